//! Batch embedding against the external embedding service.
//!
//! Texts are validated against the hard token limit before any network
//! call (input is never silently truncated), split into batches of 64,
//! and embedded one batch per request with a 100 ms pause between
//! batches. Retry strategy per batch:
//!
//! - HTTP 429 → retry with 1s, 2s, 4s, 8s backoff, up to 4 retries;
//!   exhausted retries surface as [`Error::RateLimit`].
//! - Other 5xx → same schedule, surfacing as [`Error::Api`].
//! - 4xx other than 429 → fail immediately.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{Credentials, EmbeddingConfig};
use crate::error::{Error, Result};
use crate::tokenizer::count_tokens;

const SERVICE: &str = "embeddings";

/// Pause between consecutive batch requests.
const INTER_BATCH_DELAY: Duration = Duration::from_millis(100);

pub struct Embedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    hard_token_limit: usize,
    batch_size: usize,
    max_retries: u32,
    api_key: String,
    timeout_secs: u64,
    expected_dimension: usize,
}

impl Embedder {
    pub fn new(
        config: &EmbeddingConfig,
        creds: &Credentials,
        expected_dimension: usize,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build embedding client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            hard_token_limit: config.hard_token_limit,
            batch_size: config.batch_size,
            max_retries: config.max_retries,
            api_key: creds.embedding_api_key.clone(),
            timeout_secs: config.timeout_secs,
            expected_dimension,
        })
    }

    /// Embed `texts`, preserving order. One vector per input.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Preflight: the service hard-rejects oversized input, so catch it
        // here with a count the caller can act on.
        for (i, text) in texts.iter().enumerate() {
            let tokens = count_tokens(text);
            if tokens > self.hard_token_limit {
                return Err(Error::TokenLimit {
                    what: format!("input {i} of {}", texts.len()),
                    tokens,
                    limit: self.hard_token_limit,
                });
            }
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for (batch_index, batch) in texts.chunks(self.batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(INTER_BATCH_DELAY).await;
            }
            debug!(batch_index, size = batch.len(), "embedding batch");
            let batch_vectors = self.embed_batch(batch).await?;
            vectors.extend(batch_vectors);
        }
        Ok(vectors)
    }

    /// Embed a single query string.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| Error::Api {
            service: SERVICE.to_string(),
            message: "empty embedding response".to_string(),
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": self.model,
            "input": batch,
            "encoding_format": "float",
        });

        let mut last_was_rate_limit = false;
        let mut last_message = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(3));
                warn!(attempt, ?delay, "retrying embedding batch");
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    if e.is_timeout() {
                        return Err(Error::Timeout {
                            service: SERVICE.to_string(),
                            seconds: self.timeout_secs,
                        });
                    }
                    last_was_rate_limit = false;
                    last_message = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let value: Value = response.json().await.map_err(|e| Error::Api {
                    service: SERVICE.to_string(),
                    message: format!("response parse failed: {e}"),
                })?;
                return self.parse_response(&value, batch.len());
            }

            if status.as_u16() == 429 {
                if let Some(retry_after) = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                {
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                }
                last_was_rate_limit = true;
                last_message = "HTTP 429".to_string();
                continue;
            }
            if status.is_server_error() {
                last_was_rate_limit = false;
                last_message = format!("HTTP {status}");
                continue;
            }

            // Non-retryable client error.
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                service: SERVICE.to_string(),
                message: format!(
                    "embedding failed (HTTP {status}): {}",
                    text.chars().take(300).collect::<String>()
                ),
            });
        }

        if last_was_rate_limit {
            Err(Error::RateLimit {
                service: SERVICE.to_string(),
            })
        } else {
            Err(Error::Api {
                service: SERVICE.to_string(),
                message: format!("retries exhausted: {last_message}"),
            })
        }
    }

    fn parse_response(&self, value: &Value, expected_count: usize) -> Result<Vec<Vec<f32>>> {
        let data = value
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::Api {
                service: SERVICE.to_string(),
                message: "missing data array in response".to_string(),
            })?;

        if data.len() != expected_count {
            return Err(Error::Api {
                service: SERVICE.to_string(),
                message: format!(
                    "expected {expected_count} embeddings, got {}",
                    data.len()
                ),
            });
        }

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let embedding = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| Error::Api {
                    service: SERVICE.to_string(),
                    message: "missing embedding in response item".to_string(),
                })?;
            let vector: Vec<f32> = embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            if vector.len() != self.expected_dimension {
                return Err(Error::Api {
                    service: SERVICE.to_string(),
                    message: format!(
                        "embedding dimension {} does not match configured {}",
                        vector.len(),
                        self.expected_dimension
                    ),
                });
            }
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_embedder(dimension: usize) -> Embedder {
        Embedder {
            client: reqwest::Client::new(),
            endpoint: "https://api.example.com/v1/embeddings".into(),
            model: "text-embedding-3-small".into(),
            hard_token_limit: 8191,
            batch_size: 64,
            max_retries: 4,
            api_key: "test".into(),
            timeout_secs: 60,
            expected_dimension: dimension,
        }
    }

    #[test]
    fn parses_well_formed_response() {
        let embedder = test_embedder(3);
        let body = json!({
            "data": [
                { "embedding": [0.1, 0.2, 0.3] },
                { "embedding": [0.4, 0.5, 0.6] },
            ]
        });
        let vectors = embedder.parse_response(&body, 2).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 3);
        assert!((vectors[1][0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn rejects_count_mismatch() {
        let embedder = test_embedder(3);
        let body = json!({ "data": [ { "embedding": [0.1, 0.2, 0.3] } ] });
        assert!(embedder.parse_response(&body, 2).is_err());
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let embedder = test_embedder(4);
        let body = json!({ "data": [ { "embedding": [0.1, 0.2, 0.3] } ] });
        assert!(embedder.parse_response(&body, 1).is_err());
    }

    #[tokio::test]
    async fn preflight_rejects_oversized_input_without_calling_out() {
        // An endpoint that does not resolve: proof the check fires first.
        let mut embedder = test_embedder(3);
        embedder.hard_token_limit = 5;
        let long = "regulatory compliance ".repeat(50);
        let err = embedder.embed(&[long]).await.unwrap_err();
        match err {
            Error::TokenLimit { tokens, limit, .. } => {
                assert!(tokens > limit);
                assert_eq!(limit, 5);
            }
            other => panic!("expected TokenLimit, got {other}"),
        }
    }

    #[tokio::test]
    async fn empty_input_is_empty_output() {
        let embedder = test_embedder(3);
        let vectors = embedder.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
