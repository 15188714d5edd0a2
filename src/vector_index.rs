//! Vector index adapter: cosine-similarity search over fixed-dimension
//! vectors with JSON metadata.
//!
//! Speaks a Pinecone-style REST API: `POST /vectors/upsert` and
//! `POST /query`. Upserts are idempotent by record ID. The filter grammar
//! supports scalar equality, `$in`, and a top-level `$or`; helpers below
//! build the `serde_json::Value` trees so callers never hand-write filter
//! syntax.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{Credentials, VectorIndexConfig};
use crate::error::{Error, Result};

const SERVICE: &str = "vector-index";

/// One record to upsert: id, embedding, metadata.
#[derive(Debug, Clone, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Value,
}

/// One query hit, scores descending.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryMatch {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

pub struct VectorIndex {
    client: reqwest::Client,
    endpoint: String,
    name: String,
    dimension: usize,
    api_key: String,
    timeout_secs: u64,
}

impl VectorIndex {
    pub fn new(config: &VectorIndexConfig, creds: &Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build vector index client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            name: config.name.clone(),
            dimension: config.dimension,
            api_key: creds.vector_index_api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Upsert one batch of records. Callers batch at 100; larger batches
    /// are rejected upstream by the service, so this also guards locally.
    pub async fn upsert(&self, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            if record.values.len() != self.dimension {
                return Err(Error::Validation(format!(
                    "vector {} has dimension {}, index '{}' expects {}",
                    record.id,
                    record.values.len(),
                    self.name,
                    self.dimension
                )));
            }
        }

        let body = json!({
            "vectors": records,
            "namespace": "",
        });
        self.post("/vectors/upsert", &body).await?;
        Ok(())
    }

    /// Query by vector with an optional metadata filter.
    pub async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&Value>,
        include_metadata: bool,
    ) -> Result<Vec<QueryMatch>> {
        if vector.len() != self.dimension {
            return Err(Error::Validation(format!(
                "query vector has dimension {}, index '{}' expects {}",
                vector.len(),
                self.name,
                self.dimension
            )));
        }

        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": include_metadata,
        });
        if let Some(filter) = filter {
            body["filter"] = filter.clone();
        }

        let response = self.post("/query", &body).await?;
        let parsed: QueryResponse = serde_json::from_value(response).map_err(|e| Error::Api {
            service: SERVICE.to_string(),
            message: format!("malformed query response: {e}"),
        })?;
        Ok(parsed.matches)
    }

    /// POST with retry on 429/5xx and exponential backoff.
    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}{path}", self.endpoint);
        let mut last_err: Option<Error> = None;

        for attempt in 0..=4u32 {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(3));
                warn!(path, attempt, ?delay, "retrying vector index call");
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(Error::from_transport(SERVICE, self.timeout_secs, e));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response.json().await.map_err(|e| Error::Api {
                    service: SERVICE.to_string(),
                    message: format!("response parse failed: {e}"),
                });
            }

            let retryable = status.as_u16() == 429 || status.is_server_error();
            let text = response.text().await.unwrap_or_default();
            let err = if status.as_u16() == 429 {
                Error::RateLimit {
                    service: SERVICE.to_string(),
                }
            } else {
                Error::Api {
                    service: SERVICE.to_string(),
                    message: format!(
                        "{path} failed (HTTP {status}): {}",
                        text.chars().take(300).collect::<String>()
                    ),
                }
            };
            if retryable {
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| Error::Api {
            service: SERVICE.to_string(),
            message: "retries exhausted".to_string(),
        }))
    }
}

// ============ Filter grammar ============

/// `{field: {"$eq": value}}`
pub fn filter_eq(field: &str, value: impl Into<Value>) -> Value {
    json!({ field: { "$eq": value.into() } })
}

/// `{field: {"$in": values}}`
pub fn filter_in(field: &str, values: &[&str]) -> Value {
    json!({ field: { "$in": values } })
}

/// Top-level `{"$or": clauses}`. A single clause collapses to itself.
pub fn filter_or(clauses: Vec<Value>) -> Value {
    if clauses.len() == 1 {
        clauses.into_iter().next().unwrap_or(Value::Null)
    } else {
        json!({ "$or": clauses })
    }
}

/// The retrieval filter: one equality clause per target jurisdiction,
/// combined with `$or`.
pub fn jurisdiction_filter(jurisdictions: &[String]) -> Value {
    filter_or(
        jurisdictions
            .iter()
            .map(|j| filter_eq("jurisdiction", j.as_str()))
            .collect(),
    )
}
