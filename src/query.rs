//! Retrieval and answer pipeline: `process_query`.
//!
//! geocode → embed → filtered vector search → rerank → confidence →
//! prompt → LLM → parse → persist. The pipeline always returns a
//! structured result: internal failures become an assistant message
//! naming the error class with `Low` confidence and no citations, and
//! geocoding failure silently narrows scope to `["US"]`.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::answer::{
    parse_citations, parse_permits, split_jurisdiction_sections, summarize, system_prompt,
    user_prompt, ContextChunk,
};
use crate::appdb::AppDb;
use crate::config::RetrievalConfig;
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::geocode::Geocoder;
use crate::llm::LlmClient;
use crate::models::{Answer, Chunk, Confidence, ConfidenceLevel, QueryResult};
use crate::vector_index::{jurisdiction_filter, QueryMatch, VectorIndex};

/// A retrieval hit with its rerank weight.
#[derive(Debug, Clone)]
pub struct RankedChunk {
    pub chunk: Chunk,
    pub score: f64,
    pub weighted: f64,
}

pub struct QueryPipeline {
    geocoder: Arc<Geocoder>,
    embedder: Arc<Embedder>,
    index: Arc<VectorIndex>,
    llm: Arc<LlmClient>,
    app_db: Arc<AppDb>,
    retrieval: RetrievalConfig,
}

impl QueryPipeline {
    pub fn new(
        geocoder: Arc<Geocoder>,
        embedder: Arc<Embedder>,
        index: Arc<VectorIndex>,
        llm: Arc<LlmClient>,
        app_db: Arc<AppDb>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            geocoder,
            embedder,
            index,
            llm,
            app_db,
            retrieval,
        }
    }

    /// Answer a question, optionally scoped by a street address.
    pub async fn process_query(
        &self,
        question: &str,
        address: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<QueryResult> {
        let jurisdictions = match address {
            Some(address) => self.geocoder.resolve_jurisdictions(address).await,
            None => vec!["US".to_string()],
        };
        info!(?jurisdictions, "resolved query scope");

        let (answer, confidence) = match self.retrieve_and_answer(question, &jurisdictions).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "query pipeline degraded to error answer");
                failure_answer(&e)
            }
        };

        // One atomic write: conversation + user turn + assistant turn.
        let (_, query_id) = self
            .app_db
            .record_exchange(
                None,
                user_id,
                question,
                address,
                &jurisdictions,
                &answer,
                &confidence,
            )
            .await?;

        Ok(QueryResult {
            query_id,
            answer,
            confidence,
        })
    }

    async fn retrieve_and_answer(
        &self,
        question: &str,
        jurisdictions: &[String],
    ) -> Result<(Answer, Confidence)> {
        let vector = self.embedder.embed_query(question).await?;

        let filter = jurisdiction_filter(jurisdictions);
        let matches = self
            .index
            .query(&vector, self.retrieval.top_k, Some(&filter), true)
            .await?;

        let ranked = rerank(
            matches,
            self.retrieval.min_score,
            self.retrieval.recency_weight,
            self.retrieval.recency_days,
            self.retrieval.final_top_k,
            Utc::now(),
        );
        info!(retained = ranked.len(), "reranked retrieval set");

        let confidence = compute_confidence(&ranked, jurisdictions);

        let context: Vec<ContextChunk> = ranked
            .iter()
            .map(|r| ContextChunk {
                chunk_id: r.chunk.chunk_id.clone(),
                citation: r.chunk.citation.clone(),
                url: r.chunk.url.clone(),
                text: r.chunk.text.clone(),
            })
            .collect();

        let answer_text = self
            .llm
            .complete(system_prompt(), &user_prompt(question, &context))
            .await?;

        let (citations, mut warnings) = parse_citations(&answer_text, &context);
        let permits = parse_permits(&answer_text);
        let summary = summarize(&answer_text);
        if split_jurisdiction_sections(&answer_text).is_empty() {
            warnings.push("answer carries no jurisdiction section headings".to_string());
        }

        Ok((
            Answer {
                text: answer_text,
                summary,
                jurisdictions: jurisdictions.to_vec(),
                citations,
                permits,
                warnings,
            },
            confidence,
        ))
    }
}

/// Degraded result when the pipeline fails internally: the answer names
/// the error class, confidence is `Low`, citations and permits empty.
fn failure_answer(error: &Error) -> (Answer, Confidence) {
    let class = match error {
        Error::ContentFilter(_) => "ContentFilter",
        Error::RateLimit { .. } => "RateLimit",
        Error::Timeout { .. } => "Timeout",
        Error::TokenLimit { .. } => "TokenLimit",
        _ => "ApiError",
    };
    let text = format!(
        "The answer could not be generated ({class}): {error}. Please retry; no regulatory \
citations are included because retrieval did not complete."
    );
    (
        Answer {
            summary: summarize(&text),
            text,
            jurisdictions: Vec::new(),
            citations: Vec::new(),
            permits: Vec::new(),
            warnings: vec![format!("pipeline failure: {class}")],
        },
        Confidence {
            level: ConfidenceLevel::Low,
            score: 0.0,
            avg_similarity: 0.0,
            jurisdiction_coverage: 0.0,
            citation_coverage: 0.0,
            reason: format!("internal failure: {class}"),
        },
    )
}

/// Score-filter, recency-weight, sort, truncate.
///
/// `weighted = score × (1 − w) + (recent ? w : 0)` where recent means a
/// `lastUpdated` within `recency_days` of `now`.
pub fn rerank(
    matches: Vec<QueryMatch>,
    min_score: f64,
    recency_weight: f64,
    recency_days: i64,
    final_top_k: usize,
    now: DateTime<Utc>,
) -> Vec<RankedChunk> {
    let mut ranked: Vec<RankedChunk> = matches
        .into_iter()
        .filter(|m| m.score >= min_score)
        .filter_map(|m| {
            let metadata = m.metadata.clone()?;
            let chunk: Chunk = match serde_json::from_value(metadata) {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(id = %m.id, error = %e, "dropping match with malformed metadata");
                    return None;
                }
            };
            let recent = chunk
                .last_updated
                .as_deref()
                .map(|ts| is_recent(ts, now, recency_days))
                .unwrap_or(false);
            let weighted =
                m.score * (1.0 - recency_weight) + if recent { recency_weight } else { 0.0 };
            Some(RankedChunk {
                chunk,
                score: m.score,
                weighted,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.weighted
            .partial_cmp(&a.weighted)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
    });
    ranked.truncate(final_top_k);
    ranked
}

fn is_recent(timestamp: &str, now: DateTime<Utc>, days: i64) -> bool {
    let parsed = DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(timestamp, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
        });
    match parsed {
        Ok(ts) => now.signed_duration_since(ts) <= Duration::days(days),
        Err(_) => false,
    }
}

/// Retrieval-metric confidence (never an LLM self-report):
/// `0.5·avg_similarity + 0.3·jurisdiction_coverage + 0.2·citation_coverage`,
/// with `High` additionally requiring full jurisdiction coverage.
pub fn compute_confidence(ranked: &[RankedChunk], target_jurisdictions: &[String]) -> Confidence {
    if ranked.is_empty() {
        return Confidence {
            level: ConfidenceLevel::Low,
            score: 0.0,
            avg_similarity: 0.0,
            jurisdiction_coverage: 0.0,
            citation_coverage: 0.0,
            reason: "no chunks passed the retrieval score threshold".to_string(),
        };
    }

    let avg_similarity = ranked.iter().map(|r| r.score).sum::<f64>() / ranked.len() as f64;

    let covered: std::collections::BTreeSet<&str> = ranked
        .iter()
        .map(|r| r.chunk.jurisdiction.as_str())
        .collect();
    let jurisdiction_coverage = if target_jurisdictions.is_empty() {
        0.0
    } else {
        let hit = target_jurisdictions
            .iter()
            .filter(|j| covered.contains(j.as_str()))
            .count();
        hit as f64 / target_jurisdictions.len() as f64
    };

    let cited = ranked
        .iter()
        .filter(|r| !r.chunk.citation.trim().is_empty())
        .count();
    let citation_coverage = cited as f64 / ranked.len() as f64;

    let score =
        0.5 * avg_similarity + 0.3 * jurisdiction_coverage + 0.2 * citation_coverage;
    let level = if score > 0.8 && (jurisdiction_coverage - 1.0).abs() < f64::EPSILON {
        ConfidenceLevel::High
    } else if score > 0.6 {
        ConfidenceLevel::Medium
    } else {
        ConfidenceLevel::Low
    };

    Confidence {
        level,
        score,
        avg_similarity,
        jurisdiction_coverage,
        citation_coverage,
        reason: format!(
            "{:.0}% of target jurisdictions covered; average similarity {avg_similarity:.2}",
            jurisdiction_coverage * 100.0
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use serde_json::json;

    fn metadata(chunk_id: &str, jurisdiction: &str, last_updated: Option<&str>) -> serde_json::Value {
        let mut value = json!({
            "chunkId": chunk_id,
            "sourceId": "cfr-title-21",
            "sourceType": "federal",
            "jurisdiction": jurisdiction,
            "text": "Regulatory text.",
            "citation": "21 C.F.R. § 117.3",
            "url": "https://www.ecfr.gov/x",
            "chunkIndex": 0,
            "totalChunks": 1,
        });
        if let Some(ts) = last_updated {
            value["lastUpdated"] = json!(ts);
        }
        value
    }

    fn query_match(id: &str, score: f64, meta: serde_json::Value) -> QueryMatch {
        serde_json::from_value(json!({ "id": id, "score": score, "metadata": meta })).unwrap()
    }

    #[test]
    fn rerank_filters_below_min_score() {
        let now = Utc::now();
        let matches = vec![
            query_match("a", 0.9, metadata("a", "US", None)),
            query_match("b", 0.3, metadata("b", "US", None)),
        ];
        let ranked = rerank(matches, 0.5, 0.2, 365, 10, now);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].chunk.chunk_id, "a");
    }

    #[test]
    fn recent_update_outranks_slightly_higher_similarity() {
        let now = Utc::now();
        let fresh = (now - Duration::days(10)).to_rfc3339();
        let stale = (now - Duration::days(800)).to_rfc3339();
        let matches = vec![
            query_match("stale", 0.85, metadata("stale", "US", Some(&stale))),
            query_match("fresh", 0.80, metadata("fresh", "US", Some(&fresh))),
        ];
        let ranked = rerank(matches, 0.5, 0.2, 365, 10, now);
        // fresh: 0.80·0.8 + 0.2 = 0.84 beats stale: 0.85·0.8 = 0.68.
        assert_eq!(ranked[0].chunk.chunk_id, "fresh");
        assert!(ranked[0].weighted > ranked[1].weighted);
    }

    #[test]
    fn rerank_truncates_to_final_top_k() {
        let now = Utc::now();
        let matches: Vec<QueryMatch> = (0..30)
            .map(|i| {
                query_match(
                    &format!("c{i}"),
                    0.9 - (i as f64) * 0.001,
                    metadata(&format!("c{i}"), "US", None),
                )
            })
            .collect();
        let ranked = rerank(matches, 0.5, 0.2, 365, 12, now);
        assert_eq!(ranked.len(), 12);
    }

    #[test]
    fn date_only_last_updated_parses() {
        let now = Utc::now();
        let recent_date = (now - Duration::days(30)).format("%Y-%m-%d").to_string();
        assert!(is_recent(&recent_date, now, 365));
        assert!(!is_recent("2001-01-01", now, 365));
        assert!(!is_recent("not a date", now, 365));
    }

    fn ranked_chunk(jurisdiction: &str, score: f64, citation: &str) -> RankedChunk {
        RankedChunk {
            chunk: Chunk {
                chunk_id: "x".into(),
                source_id: "cfr-title-21".into(),
                source_type: SourceType::Federal,
                jurisdiction: jurisdiction.into(),
                text: "t".into(),
                citation: citation.into(),
                url: "u".into(),
                chunk_index: 0,
                total_chunks: 1,
                subsection: None,
                category: None,
                hierarchy: vec![],
                effective_date: None,
                last_amended: None,
                last_updated: None,
                indexed_at: None,
            },
            score,
            weighted: score,
        }
    }

    #[test]
    fn full_coverage_and_high_similarity_is_high() {
        let ranked = vec![
            ranked_chunk("US", 0.95, "21 C.F.R. § 117.3"),
            ranked_chunk("TX", 0.93, "Tex. Penal Code Ann. § 30.02"),
        ];
        let confidence =
            compute_confidence(&ranked, &["US".to_string(), "TX".to_string()]);
        assert_eq!(confidence.level, ConfidenceLevel::High);
        assert!((confidence.jurisdiction_coverage - 1.0).abs() < 1e-9);
    }

    #[test]
    fn partial_coverage_cannot_be_high() {
        // Similarity near perfect, but only one of four jurisdictions hit.
        let ranked = vec![ranked_chunk("US", 0.99, "21 C.F.R. § 117.3")];
        let targets = vec![
            "US".to_string(),
            "TX".to_string(),
            "TX-48201".to_string(),
            "TX-houston".to_string(),
        ];
        let confidence = compute_confidence(&ranked, &targets);
        assert_ne!(confidence.level, ConfidenceLevel::High);
        assert!(confidence.jurisdiction_coverage < 1.0);
        assert!(confidence.reason.contains("25%"));
    }

    #[test]
    fn empty_retrieval_is_low_with_reason() {
        let confidence = compute_confidence(&[], &["US".to_string()]);
        assert_eq!(confidence.level, ConfidenceLevel::Low);
        assert!(confidence.reason.contains("no chunks"));
    }

    #[test]
    fn uncited_chunks_drag_citation_coverage() {
        let ranked = vec![
            ranked_chunk("US", 0.9, "21 C.F.R. § 117.3"),
            ranked_chunk("US", 0.9, ""),
        ];
        let confidence = compute_confidence(&ranked, &["US".to_string()]);
        assert!((confidence.citation_coverage - 0.5).abs() < 1e-9);
    }
}
