//! Error taxonomy shared across the ingestion and retrieval pipelines.
//!
//! Each variant is a *kind*, not a transport detail: callers match on the
//! variant to decide whether to skip a section, fail a unit, or fall back.
//! The conventions are:
//!
//! - [`Error::NotFound`] — fetchers skip the section and keep going.
//! - [`Error::Scraping`] / [`Error::Validation`] — abort the current
//!   section; the unit continues and the failure is recorded.
//! - [`Error::TokenLimit`] / [`Error::RateLimit`] / [`Error::Api`] /
//!   [`Error::Timeout`] — fatal for the unit; the orchestrator records the
//!   unit as failed and moves on.
//! - [`Error::Geocode`] — downgraded inside retrieval to the `["US"]`
//!   fallback; never escapes `process_query`.
//! - [`Error::Config`] — fatal at startup; the CLI exits 1.

use thiserror::Error;

/// Result alias used at every subsystem boundary.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds for regulatory ingestion and retrieval.
#[derive(Error, Debug)]
pub enum Error {
    /// The upstream returned 404 for a resource we can live without.
    #[error("not found: {url}")]
    NotFound { url: String },

    /// A scrape failed after retries for a reason other than 404.
    #[error("scraping error for {url}: {message}")]
    Scraping { url: String, message: String },

    /// Parsed or produced data failed a structural check.
    #[error("validation error: {0}")]
    Validation(String),

    /// A text exceeded the embedding service's hard input limit.
    #[error("token limit exceeded: {tokens} tokens in {what} (limit {limit})")]
    TokenLimit {
        what: String,
        tokens: usize,
        limit: usize,
    },

    /// 429 from an external service after the retry budget was spent.
    #[error("rate limited by {service} after retries")]
    RateLimit { service: String },

    /// Non-retryable or retry-exhausted external service failure.
    #[error("{service} API error: {message}")]
    Api { service: String, message: String },

    /// An external call exceeded its deadline.
    #[error("{service} timed out after {seconds}s")]
    Timeout { service: String, seconds: u64 },

    /// The LLM refused to answer.
    #[error("content filtered by the model: {0}")]
    ContentFilter(String),

    /// The geocoder failed; retrieval falls back to federal-only scope.
    #[error("geocoding failed: {0}")]
    Geocode(String),

    /// Missing or invalid configuration at startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for failures the orchestrator records without aborting the run.
    pub fn is_unit_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. } | Error::Scraping { .. } | Error::Validation(_)
        )
    }

    /// Classify a `reqwest` transport error against a service deadline.
    pub fn from_transport(service: &str, timeout_secs: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout {
                service: service.to_string(),
                seconds: timeout_secs,
            }
        } else {
            Error::Api {
                service: service.to_string(),
                message: err.to_string(),
            }
        }
    }
}
