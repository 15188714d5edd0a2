//! Rate-limited HTTP fetching with retry and error classification.
//!
//! All source fetchers share one [`Scraper`]. It enforces a minimum delay
//! between requests to the same host, retries transient failures (network
//! errors, 5xx, 429) with exponential backoff, honors `Retry-After`, and
//! classifies terminal failures into two kinds callers treat differently:
//!
//! - [`Error::NotFound`] — the section does not exist upstream; fetchers
//!   skip it and continue.
//! - [`Error::Scraping`] — anything else after the retry budget; fetchers
//!   abort the current section and record the failure.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ScrapeConfig;
use crate::error::{Error, Result};

/// Shared fetch client with per-host throttling.
pub struct Scraper {
    client: reqwest::Client,
    per_host_delay: Duration,
    max_retries: u32,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl Scraper {
    pub fn new(config: &ScrapeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("reg-harness/0.4")
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            per_host_delay: Duration::from_millis(config.per_host_delay_ms),
            max_retries: config.max_retries,
            last_request: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch a URL and return its body as text.
    pub async fn fetch_text(&self, url: &str, label: &str) -> Result<String> {
        let bytes = self.fetch_bytes(url, label).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Fetch a URL and return its body as bytes.
    pub async fn fetch_bytes(&self, url: &str, label: &str) -> Result<Vec<u8>> {
        let host = host_of(url);
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                warn!(label, url, attempt, ?delay, "retrying fetch");
                tokio::time::sleep(delay).await;
            }
            self.throttle(&host).await;

            let response = match self.client.get(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                debug!(label, url, "fetched");
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Scraping {
                        url: url.to_string(),
                        message: format!("body read failed: {e}"),
                    })?;
                return Ok(bytes.to_vec());
            }

            if status.as_u16() == 404 {
                return Err(Error::NotFound {
                    url: url.to_string(),
                });
            }

            if is_retryable_status(status.as_u16()) {
                if let Some(retry_after) = parse_retry_after(response.headers()) {
                    tokio::time::sleep(retry_after).await;
                }
                last_err = Some(format!("HTTP {status}"));
                continue;
            }

            // Non-retryable client error.
            return Err(Error::Scraping {
                url: url.to_string(),
                message: format!("HTTP {status}"),
            });
        }

        Err(Error::Scraping {
            url: url.to_string(),
            message: last_err.unwrap_or_else(|| "retries exhausted".to_string()),
        })
    }

    /// Wait until at least `per_host_delay` has passed since the last
    /// request to `host`.
    async fn throttle(&self, host: &str) {
        let wait = {
            let mut guard = self.last_request.lock().await;
            let now = Instant::now();
            let wait = guard
                .get(host)
                .and_then(|last| (*last + self.per_host_delay).checked_duration_since(now));
            guard.insert(host.to_string(), now + wait.unwrap_or_default());
            wait
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Exponential backoff: 1s, 2s, 4s, 8s for attempts 1..=4.
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt - 1).min(3))
}

/// 429 and 5xx are worth retrying; other statuses are not.
fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Parse a `Retry-After` header given in seconds.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn host_of(url: &str) -> String {
    url.split("://")
        .nth(1)
        .unwrap_or(url)
        .split('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_1_2_4_8_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(9), Duration::from_secs(8));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn retry_after_seconds_parse() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            host_of("https://statutes.capitol.texas.gov/Docs/PE/htm/PE.30.htm"),
            "statutes.capitol.texas.gov"
        );
        assert_eq!(host_of("not-a-url"), "not-a-url");
    }
}
