//! Application Database client: conversations, messages, and freshness.
//!
//! A thin REST client over the document database's three logical
//! collections. The core needs only: append a user/assistant exchange in
//! one atomic write, read a conversation back, list recent
//! conversations, and update source/jurisdiction freshness records.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{AppDbConfig, Credentials};
use crate::error::{Error, Result};
use crate::models::{Answer, Confidence, Conversation, Message, Role};

const SERVICE: &str = "app-db";

/// Freshness record for one source family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source_type: String,
    pub status: String,
    pub last_scraped_at: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub titles_processed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codes_processed: Option<u32>,
    pub total_vectors: u64,
    pub duration_ms: u64,
}

/// Status row for one jurisdiction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JurisdictionStatus {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scraped_at: Option<chrono::DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_count: Option<u64>,
}

pub struct AppDb {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl AppDb {
    pub fn new(config: &AppDbConfig, creds: &Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build app-db client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: creds.app_db_api_key.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    /// Persist one question/answer exchange in a single write. Creates
    /// the conversation when `conversation_id` is `None`; returns
    /// `(conversation_id, assistant_message_id)`.
    pub async fn record_exchange(
        &self,
        conversation_id: Option<&str>,
        user_id: Option<&str>,
        question: &str,
        address: Option<&str>,
        jurisdictions: &[String],
        answer: &Answer,
        confidence: &Confidence,
    ) -> Result<(String, String)> {
        let now = Utc::now();
        let conversation_id = conversation_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let assistant_id = Uuid::new_v4().to_string();

        let user_message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            role: Role::User,
            text: question.to_string(),
            address: address.map(|a| a.to_string()),
            summary: None,
            jurisdictions: Vec::new(),
            citations: Vec::new(),
            permits: Vec::new(),
            confidence: None,
            created_at: now,
        };
        let assistant_message = Message {
            id: assistant_id.clone(),
            conversation_id: conversation_id.clone(),
            role: Role::Assistant,
            text: answer.text.clone(),
            address: None,
            summary: Some(answer.summary.clone()),
            jurisdictions: jurisdictions.to_vec(),
            citations: answer.citations.clone(),
            permits: answer.permits.clone(),
            confidence: Some(confidence.clone()),
            created_at: now,
        };

        let body = json!({
            "conversation_id": conversation_id,
            "user_id": user_id,
            "messages": [user_message, assistant_message],
        });
        self.call(
            reqwest::Method::POST,
            &format!("/conversations/{conversation_id}/exchange"),
            Some(&body),
        )
        .await?;

        Ok((conversation_id, assistant_id))
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        match self
            .call(reqwest::Method::GET, &format!("/conversations/{id}"), None)
            .await
        {
            Ok(value) => {
                let conversation = serde_json::from_value(value).map_err(|e| Error::Api {
                    service: SERVICE.to_string(),
                    message: format!("malformed conversation: {e}"),
                })?;
                Ok(Some(conversation))
            }
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Most recent conversations, optionally scoped to a user.
    pub async fn list_conversations(
        &self,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let mut path = format!("/conversations?limit={limit}&order=recent");
        if let Some(user) = user_id {
            path.push_str(&format!("&user_id={user}"));
        }
        let value = self.call(reqwest::Method::GET, &path, None).await?;
        let conversations = value
            .get("conversations")
            .cloned()
            .unwrap_or(serde_json::Value::Array(Vec::new()));
        serde_json::from_value(conversations).map_err(|e| Error::Api {
            service: SERVICE.to_string(),
            message: format!("malformed conversation list: {e}"),
        })
    }

    /// Freshness update after a family run. Callers treat this as
    /// fire-and-forget: log the error, never fail the run on it.
    pub async fn update_source_status(&self, status: &SourceStatus) -> Result<()> {
        let body = serde_json::to_value(status).map_err(|e| Error::Validation(e.to_string()))?;
        self.call(
            reqwest::Method::PUT,
            &format!("/sources/{}", status.source_type),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    pub async fn upsert_jurisdiction(&self, status: &JurisdictionStatus) -> Result<()> {
        let body = serde_json::to_value(status).map_err(|e| Error::Validation(e.to_string()))?;
        self.call(
            reqwest::Method::PUT,
            &format!("/jurisdictions/{}", status.id),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{path}", self.endpoint);
        let mut request = self.client.request(method, &url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::from_transport(SERVICE, self.timeout_secs, e))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(Error::NotFound { url });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                service: SERVICE.to_string(),
                message: format!(
                    "{path} failed (HTTP {status}): {}",
                    text.chars().take(300).collect::<String>()
                ),
            });
        }
        if status.as_u16() == 204 {
            return Ok(serde_json::Value::Null);
        }
        response.json().await.or(Ok(serde_json::Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_status_serializes_optional_fields_sparsely() {
        let status = SourceStatus {
            source_type: "federal".into(),
            status: "completed".into(),
            last_scraped_at: Utc::now(),
            titles_processed: Some(2),
            codes_processed: None,
            total_vectors: 1200,
            duration_ms: 90_000,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["titles_processed"], 2);
        assert!(value.get("codes_processed").is_none());
    }

    #[test]
    fn jurisdiction_status_uses_type_field_name() {
        let status = JurisdictionStatus {
            id: "TX-houston".into(),
            name: "Houston".into(),
            kind: "municipal".into(),
            parent: Some("TX".into()),
            is_active: true,
            last_scraped_at: None,
            vector_count: Some(300),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["type"], "municipal");
        assert_eq!(value["parent"], "TX");
    }
}
