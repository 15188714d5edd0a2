//! Completion client for the external LLM.
//!
//! One call shape: `POST {model, system, messages, temperature,
//! max_tokens}`; the answer text is the concatenation of the response's
//! content blocks. Failures map onto the shared taxonomy — 429 after
//! retries is [`Error::RateLimit`], a model refusal is
//! [`Error::ContentFilter`], a blown deadline is [`Error::Timeout`], and
//! everything else [`Error::Api`].

use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::config::{Credentials, LlmConfig};
use crate::error::{Error, Result};

const SERVICE: &str = "llm";

pub struct LlmClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
    api_key: String,
    timeout_secs: u64,
}

impl LlmClient {
    pub fn new(config: &LlmConfig, creds: &Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build LLM client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            api_key: creds.llm_api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    /// Generate an answer at temperature 0.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "system": system,
            "messages": [ { "role": "user", "content": user } ],
            "temperature": 0,
            "max_tokens": self.max_tokens,
        });

        let mut last_was_rate_limit = false;
        let mut last_message = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(3));
                warn!(attempt, ?delay, "retrying LLM call");
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
                return extract_text(&value);
            }

            if status.as_u16() == 429 {
                last_was_rate_limit = true;
                last_message = "HTTP 429".to_string();
                continue;
            }
            if status.is_server_error() {
                last_was_rate_limit = false;
                last_message = format!("HTTP {status}");
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            if text.contains("content_filter") || text.contains("content policy") {
                return Err(Error::ContentFilter(
                    text.chars().take(200).collect::<String>(),
                ));
            }
            return Err(Error::Api {
                service: SERVICE.to_string(),
                message: format!(
                    "completion failed (HTTP {status}): {}",
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
}

/// Pull the answer text out of a completion response, detecting
/// refusals. Accepts a flat `{text}` or content-block form.
fn extract_text(value: &Value) -> Result<String> {
    if let Some(reason) = value.get("stop_reason").and_then(|r| r.as_str()) {
        if reason == "refusal" {
            return Err(Error::ContentFilter("model declined to answer".to_string()));
        }
    }

    if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
        return Ok(text.to_string());
    }
    if let Some(blocks) = value.get("content").and_then(|c| c.as_array()) {
        let text: String = blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("");
        if !text.is_empty() {
            return Ok(text);
        }
    }
    Err(Error::Api {
        service: SERVICE.to_string(),
        message: "completion response carried no text".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_text_response() {
        let value = json!({ "text": "Answer body [1]." });
        assert_eq!(extract_text(&value).unwrap(), "Answer body [1].");
    }

    #[test]
    fn content_block_response_concatenates() {
        let value = json!({
            "content": [ { "type": "text", "text": "Part one. " }, { "type": "text", "text": "Part two." } ],
            "stop_reason": "end_turn"
        });
        assert_eq!(extract_text(&value).unwrap(), "Part one. Part two.");
    }

    #[test]
    fn refusal_maps_to_content_filter() {
        let value = json!({ "stop_reason": "refusal", "content": [] });
        match extract_text(&value) {
            Err(Error::ContentFilter(_)) => {}
            other => panic!("expected ContentFilter, got {other:?}"),
        }
    }

    #[test]
    fn empty_response_is_api_error() {
        let value = json!({ "content": [] });
        assert!(matches!(extract_text(&value), Err(Error::Api { .. })));
    }
}
