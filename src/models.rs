//! Core data types flowing through the ingestion and retrieval pipelines.
//!
//! A fetched artifact becomes a [`RawDocument`] in the object store, parsed
//! regulatory text becomes ephemeral [`Section`]s, the chunker turns those
//! into [`Chunk`]s (the unit of retrieval), and answered queries persist as
//! [`Message`]s inside a [`Conversation`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Regulatory source family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Federal,
    State,
    County,
    Municipal,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Federal => "federal",
            SourceType::State => "state",
            SourceType::County => "county",
            SourceType::Municipal => "municipal",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "federal" => Ok(SourceType::Federal),
            "state" => Ok(SourceType::State),
            "county" => Ok(SourceType::County),
            "municipal" => Ok(SourceType::Municipal),
            other => Err(crate::error::Error::Validation(format!(
                "unknown source type '{other}'"
            ))),
        }
    }
}

/// Where a section came from, carrying the identifiers its citation needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// CFR title and part, e.g. title 21 part `117`.
    Cfr { title: u32, part: String },
    /// Texas statute code, e.g. `PE` ("Penal"), chapter `30`.
    TexasStatute {
        code: String,
        code_name: String,
        chapter: String,
    },
    /// Texas Administrative Code title and chapter.
    TexasAdminCode { title: u32, chapter: String },
    /// County code of ordinances.
    County {
        /// Canonical `{state}-{fips}` id.
        county_id: String,
        county_name: String,
        state: String,
        chapter: String,
    },
    /// Municipal code of ordinances.
    Municipal {
        state: String,
        city: String,
        chapter: String,
    },
}

impl Provenance {
    pub fn source_type(&self) -> SourceType {
        match self {
            Provenance::Cfr { .. } => SourceType::Federal,
            Provenance::TexasStatute { .. } | Provenance::TexasAdminCode { .. } => {
                SourceType::State
            }
            Provenance::County { .. } => SourceType::County,
            Provenance::Municipal { .. } => SourceType::Municipal,
        }
    }
}

/// An ordered subsection within a section, e.g. `(a)` or `(a)(1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subsection {
    pub id: String,
    pub text: String,
}

/// A parsed unit of regulatory text. Ephemeral: chunked, then discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub provenance: Provenance,
    pub jurisdiction: String,
    /// Section number within its parent, e.g. `"117.3"`, `"30.02"`, `"1-2"`.
    pub section_id: String,
    pub heading: String,
    pub text: String,
    #[serde(default)]
    pub subsections: Vec<Subsection>,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_amended: Option<String>,
}

impl Section {
    pub fn source_type(&self) -> SourceType {
        self.provenance.source_type()
    }
}

/// An embedding-ready fragment; the unit of retrieval.
///
/// Serializes with camelCase field names — this struct *is* the vector
/// index metadata schema, so the names here must match what retrieval and
/// validation filter on (`sourceType`, `chunkIndex`, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub chunk_id: String,
    pub source_id: String,
    pub source_type: SourceType,
    pub jurisdiction: String,
    pub text: String,
    pub citation: String,
    pub url: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Ordered breadcrumbs, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hierarchy: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_amended: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,
}

/// A fetched artifact destined for the object store, keyed canonically.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub key: String,
    pub bytes: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl RawDocument {
    /// Build a raw document with the metadata keys every stored object
    /// must carry (`source`, `data_type`, `fetched_at`).
    pub fn new(key: impl Into<String>, bytes: Vec<u8>, source: &str, data_type: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), source.to_string());
        metadata.insert("data_type".to_string(), data_type.to_string());
        metadata.insert("fetched_at".to_string(), Utc::now().to_rfc3339());
        Self {
            key: key.into(),
            bytes,
            metadata,
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Run status recorded in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    InProgress,
    Failed,
}

/// Per-pipeline progress marker persisted in the object store.
///
/// `last_processed_*` fields are pipeline-specific: federal runs carry
/// `title_number` + `last_processed_part`, statute runs carry
/// `last_processed_code`, TAC runs `last_processed_title`, and county or
/// municipal runs `last_processed_jurisdiction`. Deleted when the run
/// completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub status: CheckpointStatus,
    pub timestamp: DateTime<Utc>,
    pub chunks_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed_part: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed_title: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_processed_jurisdiction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self {
            status: CheckpointStatus::InProgress,
            timestamp: Utc::now(),
            chunks_processed: 0,
            title_number: None,
            last_processed_part: None,
            last_processed_code: None,
            last_processed_title: None,
            last_processed_jurisdiction: None,
            error: None,
        }
    }

    /// The most recently completed unit, whichever field carries it.
    pub fn last_processed(&self) -> Option<String> {
        self.last_processed_part
            .clone()
            .or_else(|| self.last_processed_code.clone())
            .or_else(|| self.last_processed_title.map(|t| t.to_string()))
            .or_else(|| self.last_processed_jurisdiction.clone())
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Bookkeeping attached to a [`CachedPart`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPartMeta {
    pub fetched_at: DateTime<Utc>,
    pub parsed_at: DateTime<Utc>,
    /// SHA-256 of the raw XML the sections were parsed from.
    pub xml_hash: String,
    pub section_count: usize,
}

/// Pre-parsed CFR part stored alongside its raw XML so the chunking
/// workflow never touches the XML parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPart {
    pub title_number: u32,
    pub part_number: String,
    pub sections: Vec<Section>,
    pub metadata: CachedPartMeta,
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A persisted conversation; owns an ordered list of [`Message`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// One turn in a conversation. Assistant turns carry the answer payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jurisdictions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<CitationRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permits: Vec<Permit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    pub created_at: DateTime<Utc>,
}

/// A resolved `[N]` marker from an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRef {
    pub index: usize,
    pub chunk_id: String,
    pub citation: String,
    pub url: String,
}

/// A permit requirement extracted from an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permit {
    pub name: String,
    pub issuing_agency: String,
    pub jurisdiction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub regulatory_reference: String,
}

/// Confidence label derived from retrieval metrics, never self-reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfidenceLevel::High => f.write_str("High"),
            ConfidenceLevel::Medium => f.write_str("Medium"),
            ConfidenceLevel::Low => f.write_str("Low"),
        }
    }
}

/// Composite retrieval confidence attached to every answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confidence {
    pub level: ConfidenceLevel,
    pub score: f64,
    pub avg_similarity: f64,
    pub jurisdiction_coverage: f64,
    pub citation_coverage: f64,
    pub reason: String,
}

/// The structured answer assembled by the retrieval pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub summary: String,
    pub jurisdictions: Vec<String>,
    pub citations: Vec<CitationRef>,
    pub permits: Vec<Permit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// What `process_query` returns to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: String,
    pub answer: Answer,
    pub confidence: Confidence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_metadata_uses_camel_case_names() {
        let chunk = Chunk {
            chunk_id: "abc".into(),
            source_id: "cfr-title-21".into(),
            source_type: SourceType::Federal,
            jurisdiction: "US".into(),
            text: "t".into(),
            citation: "21 C.F.R. § 117.3".into(),
            url: "https://www.ecfr.gov/current/title-21/part-117".into(),
            chunk_index: 0,
            total_chunks: 1,
            subsection: None,
            category: Some("food".into()),
            hierarchy: vec!["Title 21".into(), "Part 117".into()],
            effective_date: None,
            last_amended: None,
            last_updated: None,
            indexed_at: None,
        };
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["sourceType"], "federal");
        assert_eq!(value["chunkId"], "abc");
        assert_eq!(value["totalChunks"], 1);
        assert!(value.get("subsection").is_none());
    }

    #[test]
    fn checkpoint_roundtrips_structurally() {
        let mut cp = Checkpoint::new();
        cp.title_number = Some(21);
        cp.last_processed_part = Some("117".into());
        cp.chunks_processed = 42;
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(cp, back);
        assert_eq!(back.last_processed().as_deref(), Some("117"));
    }

    #[test]
    fn checkpoint_last_processed_prefers_the_populated_field() {
        let mut cp = Checkpoint::new();
        cp.last_processed_jurisdiction = Some("TX-houston".into());
        assert_eq!(cp.last_processed().as_deref(), Some("TX-houston"));
    }

    #[test]
    fn source_type_parses_and_displays() {
        assert_eq!("county".parse::<SourceType>().unwrap(), SourceType::County);
        assert!("galactic".parse::<SourceType>().is_err());
        assert_eq!(SourceType::Municipal.to_string(), "municipal");
    }
}
