//! Configuration parsing and validation.
//!
//! The core is configured via a TOML file (default: `config/reg.toml`).
//! The config names every external service endpoint, the ingestion targets
//! (federal titles, statute codes, TAC titles, counties, cities), chunking
//! and retrieval tuning, and batching parameters. Credentials never live in
//! the file — they are read from the environment at startup and missing
//! required credentials fail fast with [`Error::Config`].

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub object_store: ObjectStoreConfig,
    pub vector_index: VectorIndexConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub geocoder: GeocoderConfig,
    pub render: RenderConfig,
    pub app_db: AppDbConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub ingestion: IngestionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    /// S3-compatible endpoint, e.g. `https://storage.example.com`.
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorIndexConfig {
    pub endpoint: String,
    pub name: String,
    /// Must match the embedding model's output dimension.
    pub dimension: usize,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub model: String,
    /// Hard per-input token limit enforced before any API call.
    #[serde(default = "default_hard_token_limit")]
    pub hard_token_limit: usize,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocoderConfig {
    pub endpoint: String,
    /// Fast deadline: geocoding failure falls back, it never blocks a query.
    #[serde(default = "default_geocoder_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    pub endpoint: String,
    #[serde(default = "default_render_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppDbConfig {
    pub endpoint: String,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScrapeConfig {
    /// Minimum delay between requests to the same host.
    #[serde(default = "default_per_host_delay_ms")]
    pub per_host_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_scrape_timeout")]
    pub timeout_secs: u64,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            per_host_delay_ms: default_per_host_delay_ms(),
            max_retries: default_max_retries(),
            timeout_secs: default_scrape_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Soft per-chunk budget; the hard limit lives on [`EmbeddingConfig`].
    #[serde(default = "default_max_chunk_tokens")]
    pub max_tokens: usize,
    /// Fraction of `max_tokens` carried into the next chunk on overflow.
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_chunk_tokens(),
            overlap_ratio: default_overlap_ratio(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_final_top_k")]
    pub final_top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Rerank bonus for chunks updated within `recency_days`.
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_recency_days")]
    pub recency_days: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            final_top_k: default_final_top_k(),
            min_score: default_min_score(),
            recency_weight: default_recency_weight(),
            recency_days: default_recency_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    /// Families enabled for `reg ingest` with no explicit selection.
    pub enabled_sources: BTreeSet<String>,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
    #[serde(default)]
    pub federal_titles: Vec<u32>,
    #[serde(default)]
    pub statute_codes: Vec<String>,
    #[serde(default)]
    pub tac_titles: Vec<u32>,
    #[serde(default)]
    pub counties: Vec<CountyTarget>,
    #[serde(default)]
    pub cities: Vec<CityTarget>,
    /// Base URL of the Texas statutes site.
    #[serde(default = "default_statute_base")]
    pub statute_base_url: String,
    /// Base URL of the SOS TAC viewer.
    #[serde(default = "default_tac_base")]
    pub tac_base_url: String,
    /// Base URL of the eCFR versioner API.
    #[serde(default = "default_ecfr_base")]
    pub ecfr_base_url: String,
}

/// One county jurisdiction and the HTML platform it publishes on.
#[derive(Debug, Deserialize, Clone)]
pub struct CountyTarget {
    /// Canonical `{state}-{fips}` identifier, e.g. `TX-48201`.
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// Platform key resolved against the county adapter registry.
    pub platform: String,
}

/// One city rendered through the external Markdown service.
#[derive(Debug, Deserialize, Clone)]
pub struct CityTarget {
    /// Two-letter state code.
    pub state: String,
    pub name: String,
    pub base_url: String,
}

impl CityTarget {
    /// Canonical `{state}-{slug}` jurisdiction id.
    pub fn jurisdiction(&self) -> String {
        format!("{}-{}", self.state, crate::citation::slugify(&self.name))
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_store_timeout() -> u64 {
    30
}
fn default_hard_token_limit() -> usize {
    8191
}
fn default_embed_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    4
}
fn default_embed_timeout() -> u64 {
    60
}
fn default_llm_max_tokens() -> u32 {
    4096
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_geocoder_timeout() -> u64 {
    10
}
fn default_render_timeout() -> u64 {
    60
}
fn default_per_host_delay_ms() -> u64 {
    200
}
fn default_scrape_timeout() -> u64 {
    30
}
fn default_max_chunk_tokens() -> usize {
    1500
}
fn default_overlap_ratio() -> f64 {
    0.15
}
fn default_top_k() -> usize {
    50
}
fn default_final_top_k() -> usize {
    12
}
fn default_min_score() -> f64 {
    0.5
}
fn default_recency_weight() -> f64 {
    0.2
}
fn default_recency_days() -> i64 {
    365
}
fn default_upsert_batch_size() -> usize {
    100
}
fn default_statute_base() -> String {
    "https://statutes.capitol.texas.gov".to_string()
}
fn default_tac_base() -> String {
    "https://texreg.sos.state.tx.us".to_string()
}
fn default_ecfr_base() -> String {
    "https://www.ecfr.gov/api/versioner/v1".to_string()
}

/// Source families the orchestrator knows how to run.
pub const KNOWN_FAMILIES: &[&str] = &["federal", "state", "county", "municipal"];

/// Credentials resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub object_store_access_key: String,
    pub object_store_secret_key: String,
    pub vector_index_api_key: String,
    pub embedding_api_key: String,
    pub llm_api_key: String,
    pub render_api_key: Option<String>,
    pub app_db_api_key: Option<String>,
}

impl Credentials {
    /// Read credentials from the environment.
    ///
    /// Required keys fail with [`Error::Config`] naming the missing
    /// variable; optional services (render, app DB) may run unauthenticated
    /// in local setups.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            object_store_access_key: require_env("OBJECT_STORE_ACCESS_KEY_ID")?,
            object_store_secret_key: require_env("OBJECT_STORE_SECRET_ACCESS_KEY")?,
            vector_index_api_key: require_env("VECTOR_INDEX_API_KEY")?,
            embedding_api_key: require_env("EMBEDDING_API_KEY")?,
            llm_api_key: require_env("LLM_API_KEY")?,
            render_api_key: std::env::var("RENDER_SERVICE_API_KEY").ok(),
            app_db_api_key: std::env::var("APP_DB_API_KEY").ok(),
        })
    }
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| Error::Config(format!("{name} environment variable not set")))
}

/// Load and validate the TOML configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read config file {}: {e}", path.display())))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse config file: {e}")))?;

    if config.chunking.max_tokens == 0 {
        return Err(Error::Config("chunking.max_tokens must be > 0".into()));
    }
    if !(0.0..1.0).contains(&config.chunking.overlap_ratio) {
        return Err(Error::Config(
            "chunking.overlap_ratio must be in [0.0, 1.0)".into(),
        ));
    }
    if config.chunking.max_tokens > config.embedding.hard_token_limit {
        return Err(Error::Config(format!(
            "chunking.max_tokens ({}) exceeds embedding.hard_token_limit ({})",
            config.chunking.max_tokens, config.embedding.hard_token_limit
        )));
    }
    if config.vector_index.dimension == 0 {
        return Err(Error::Config("vector_index.dimension must be > 0".into()));
    }
    if config.retrieval.final_top_k == 0 || config.retrieval.final_top_k > config.retrieval.top_k {
        return Err(Error::Config(
            "retrieval.final_top_k must be in 1..=retrieval.top_k".into(),
        ));
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_score) {
        return Err(Error::Config(
            "retrieval.min_score must be in [0.0, 1.0]".into(),
        ));
    }
    for family in &config.ingestion.enabled_sources {
        if !KNOWN_FAMILIES.contains(&family.as_str()) {
            return Err(Error::Config(format!(
                "unknown source family '{family}'. Known: federal, state, county, municipal"
            )));
        }
    }
    for county in &config.ingestion.counties {
        if !county.id.contains('-') {
            return Err(Error::Config(format!(
                "county id '{}' is not of the form {{state}}-{{fips}}",
                county.id
            )));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> String {
        r#"
[object_store]
endpoint = "https://storage.example.com"
bucket = "reg-corpus"

[vector_index]
endpoint = "https://index.example.com"
name = "regulations"
dimension = 1536

[embedding]
endpoint = "https://api.example.com/v1/embeddings"
model = "text-embedding-3-small"

[llm]
endpoint = "https://api.example.com/v1/messages"
model = "answer-model-1"

[geocoder]
endpoint = "https://geocoding.example.com/onelineaddress"

[render]
endpoint = "https://render.example.com/markdown"

[app_db]
endpoint = "https://appdb.example.com"

[ingestion]
enabled_sources = ["federal", "state"]
federal_titles = [21]
statute_codes = ["PE"]
"#
        .to_string()
    }

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let file = write_config(&minimal_toml());
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.chunking.max_tokens, 1500);
        assert!((config.chunking.overlap_ratio - 0.15).abs() < 1e-9);
        assert_eq!(config.retrieval.top_k, 50);
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.ingestion.upsert_batch_size, 100);
        assert_eq!(config.scrape.per_host_delay_ms, 200);
        assert!(config.ingestion.enabled_sources.contains("federal"));
    }

    #[test]
    fn rejects_unknown_family() {
        let body = minimal_toml().replace("\"state\"", "\"galactic\"");
        let file = write_config(&body);
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("galactic"));
    }

    #[test]
    fn rejects_soft_limit_above_hard_limit() {
        let mut body = minimal_toml();
        body.push_str("\n[chunking]\nmax_tokens = 9000\n");
        let file = write_config(&body);
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn rejects_final_top_k_above_top_k() {
        let mut body = minimal_toml();
        body.push_str("\n[retrieval]\ntop_k = 10\nfinal_top_k = 20\n");
        let file = write_config(&body);
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn city_jurisdiction_is_canonical() {
        let city = CityTarget {
            state: "TX".into(),
            name: "San Antonio".into(),
            base_url: "https://example.com".into(),
        };
        assert_eq!(city.jurisdiction(), "TX-san-antonio");
    }
}
