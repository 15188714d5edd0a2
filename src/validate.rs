//! Index validation and coverage reporting.
//!
//! The vector index has no distinct-field operation, so sampling queries
//! a zero vector with a `sourceType` filter (capped at 10k records per
//! source type — acknowledged in the report). Coverage compares sampled
//! jurisdictions against the configured targets; quality computes token
//! distributions with the real tokenizer, metadata completeness, and
//! per-chunk issues; the storage check verifies at least one object
//! exists under each jurisdiction's canonical prefix.
//!
//! Reports come in two formats: the structured types below (JSON) and a
//! human-readable tabular rendering.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::OnceLock;

use crate::config::Config;
use crate::error::Result;
use crate::models::{Chunk, SourceType};
use crate::object_store::{keys, ObjectStore};
use crate::tokenizer::count_tokens;
use crate::vector_index::{filter_eq, QueryMatch, VectorIndex};

const SAMPLE_CAP: usize = 10_000;
const QUALITY_SAMPLE_CAP: usize = 1_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    pub total_expected: usize,
    pub total_indexed: usize,
    pub coverage_percent: f64,
    pub by_source_type: BTreeMap<String, SourceTypeCoverage>,
    pub jurisdictions: Vec<JurisdictionCoverage>,
    pub gaps: Vec<String>,
    /// Samples cap at 10k records per source type.
    pub sample_capped: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceTypeCoverage {
    pub expected: usize,
    pub indexed: usize,
    pub coverage_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JurisdictionCoverage {
    pub jurisdiction: String,
    pub source_type: SourceType,
    /// `active` or `missing`.
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDistribution {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub avg: f64,
    pub p50: usize,
    pub p95: usize,
    pub p99: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataCompleteness {
    pub with_subsection: usize,
    pub with_category: usize,
    pub with_hierarchy: usize,
    pub with_effective_date: usize,
    pub with_last_amended: usize,
    pub with_last_updated: usize,
    pub with_indexed_at: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityIssue {
    pub chunk_id: String,
    pub issue: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub source_type: SourceType,
    pub sample_size: usize,
    pub tokens: TokenDistribution,
    pub completeness: MetadataCompleteness,
    pub citation_coverage_pct: f64,
    pub issues: Vec<QualityIssue>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageReport {
    pub missing_folders: Vec<String>,
    pub jurisdictions_without_data: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullValidationReport {
    pub coverage: CoverageReport,
    pub quality: Vec<QualityReport>,
    pub storage: StorageReport,
}

pub struct Validator {
    index: Arc<VectorIndex>,
    store: Arc<ObjectStore>,
    config: Config,
}

impl Validator {
    pub fn new(index: Arc<VectorIndex>, store: Arc<ObjectStore>, config: Config) -> Self {
        Self {
            index,
            store,
            config,
        }
    }

    /// Zero-vector sample of up to `top_k` records for one source type.
    async fn sample(&self, source_type: SourceType, top_k: usize) -> Result<Vec<QueryMatch>> {
        let zero = vec![0.0f32; self.index.dimension()];
        let filter = filter_eq("sourceType", source_type.as_str());
        self.index.query(&zero, top_k, Some(&filter), true).await
    }

    /// Compare indexed jurisdictions against the configured targets.
    pub async fn check_coverage(&self) -> Result<CoverageReport> {
        let expected = expected_jurisdictions(&self.config);
        let mut sampled: BTreeMap<SourceType, BTreeSet<String>> = BTreeMap::new();

        for source_type in [
            SourceType::Federal,
            SourceType::State,
            SourceType::County,
            SourceType::Municipal,
        ] {
            let matches = self.sample(source_type, SAMPLE_CAP).await?;
            let jurisdictions = sampled.entry(source_type).or_default();
            for m in matches {
                if let Some(j) = m
                    .metadata
                    .as_ref()
                    .and_then(|md| md.get("jurisdiction"))
                    .and_then(|j| j.as_str())
                {
                    jurisdictions.insert(j.to_string());
                }
            }
        }

        Ok(aggregate_coverage(&expected, &sampled))
    }

    /// Token distribution, completeness, and issue list per source type.
    pub async fn validate_quality(&self) -> Result<Vec<QualityReport>> {
        let mut reports = Vec::new();
        for source_type in [
            SourceType::Federal,
            SourceType::State,
            SourceType::County,
            SourceType::Municipal,
        ] {
            let matches = self.sample(source_type, QUALITY_SAMPLE_CAP).await?;
            let chunks: Vec<Chunk> = matches
                .into_iter()
                .filter_map(|m| m.metadata)
                .filter_map(|md| serde_json::from_value(md).ok())
                .collect();
            reports.push(quality_report(source_type, &chunks));
        }
        Ok(reports)
    }

    /// Verify at least one object exists at each jurisdiction's canonical
    /// object-store prefix.
    pub async fn check_storage(&self) -> Result<StorageReport> {
        let mut report = StorageReport::default();
        for (source_type, identifier, jurisdiction) in expected_prefixes(&self.config) {
            let prefix = keys::jurisdiction_prefix(source_type, &identifier);
            let found = self.store.list(&prefix).await?;
            if found.is_empty() {
                report.missing_folders.push(prefix);
                report.jurisdictions_without_data.push(jurisdiction);
            }
        }
        report.jurisdictions_without_data.dedup();
        Ok(report)
    }

    pub async fn full_report(&self) -> Result<FullValidationReport> {
        Ok(FullValidationReport {
            coverage: self.check_coverage().await?,
            quality: self.validate_quality().await?,
            storage: self.check_storage().await?,
        })
    }
}

/// Expected `(source type, jurisdiction)` pairs from the config.
pub fn expected_jurisdictions(config: &Config) -> Vec<(SourceType, String)> {
    let mut expected = vec![(SourceType::Federal, "US".to_string())];
    if !config.ingestion.statute_codes.is_empty() || !config.ingestion.tac_titles.is_empty() {
        expected.push((SourceType::State, "TX".to_string()));
    }
    for county in &config.ingestion.counties {
        expected.push((SourceType::County, county.id.clone()));
    }
    for city in &config.ingestion.cities {
        expected.push((SourceType::Municipal, city.jurisdiction()));
    }
    expected
}

/// Expected `(source type, prefix identifier, jurisdiction)` triples for
/// the storage check.
fn expected_prefixes(config: &Config) -> Vec<(SourceType, String, String)> {
    let mut prefixes = Vec::new();
    for title in &config.ingestion.federal_titles {
        prefixes.push((SourceType::Federal, format!("title-{title}"), "US".to_string()));
    }
    for code in &config.ingestion.statute_codes {
        prefixes.push((SourceType::State, format!("statutes/{code}"), "TX".to_string()));
    }
    for title in &config.ingestion.tac_titles {
        prefixes.push((SourceType::State, format!("tac/title-{title}"), "TX".to_string()));
    }
    for county in &config.ingestion.counties {
        prefixes.push((SourceType::County, county.id.clone(), county.id.clone()));
    }
    for city in &config.ingestion.cities {
        let j = city.jurisdiction();
        prefixes.push((SourceType::Municipal, j.clone(), j));
    }
    prefixes
}

/// Fold sampled jurisdiction sets into the coverage report.
pub fn aggregate_coverage(
    expected: &[(SourceType, String)],
    sampled: &BTreeMap<SourceType, BTreeSet<String>>,
) -> CoverageReport {
    let mut jurisdictions = Vec::new();
    let mut gaps = Vec::new();
    let mut by_source_type: BTreeMap<String, SourceTypeCoverage> = BTreeMap::new();
    let mut total_indexed = 0usize;

    for (source_type, jurisdiction) in expected {
        let active = sampled
            .get(source_type)
            .map(|set| set.contains(jurisdiction))
            .unwrap_or(false);
        let entry = by_source_type
            .entry(source_type.as_str().to_string())
            .or_default();
        entry.expected += 1;
        if active {
            entry.indexed += 1;
            total_indexed += 1;
        } else {
            gaps.push(jurisdiction.clone());
        }
        jurisdictions.push(JurisdictionCoverage {
            jurisdiction: jurisdiction.clone(),
            source_type: *source_type,
            status: if active { "active" } else { "missing" }.to_string(),
        });
    }

    for entry in by_source_type.values_mut() {
        entry.coverage_percent = if entry.expected == 0 {
            0.0
        } else {
            entry.indexed as f64 / entry.expected as f64 * 100.0
        };
    }

    let total_expected = expected.len();
    CoverageReport {
        total_expected,
        total_indexed,
        coverage_percent: if total_expected == 0 {
            0.0
        } else {
            total_indexed as f64 / total_expected as f64 * 100.0
        },
        by_source_type,
        jurisdictions,
        gaps,
        sample_capped: true,
    }
}

fn canonical_jurisdiction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(US|[A-Z]{2}|[A-Z]{2}-\d{5}|[A-Z]{2}-[a-z0-9-]+)$")
            .expect("jurisdiction pattern is valid")
    })
}

/// Quality metrics over one source type's sampled chunks.
pub fn quality_report(source_type: SourceType, chunks: &[Chunk]) -> QualityReport {
    let mut token_counts: Vec<usize> = chunks.iter().map(|c| count_tokens(&c.text)).collect();
    token_counts.sort_unstable();

    let mut completeness = MetadataCompleteness::default();
    let mut issues = Vec::new();
    let mut cited = 0usize;

    for chunk in chunks {
        if chunk.subsection.is_some() {
            completeness.with_subsection += 1;
        }
        if chunk.category.is_some() {
            completeness.with_category += 1;
        }
        if !chunk.hierarchy.is_empty() {
            completeness.with_hierarchy += 1;
        }
        if chunk.effective_date.is_some() {
            completeness.with_effective_date += 1;
        }
        if chunk.last_amended.is_some() {
            completeness.with_last_amended += 1;
        }
        if chunk.last_updated.is_some() {
            completeness.with_last_updated += 1;
        }
        if chunk.indexed_at.is_some() {
            completeness.with_indexed_at += 1;
        }

        if chunk.citation.trim().is_empty() {
            issues.push(QualityIssue {
                chunk_id: chunk.chunk_id.clone(),
                issue: "empty citation".to_string(),
            });
        } else {
            cited += 1;
        }
        if chunk.url.trim().is_empty() {
            issues.push(QualityIssue {
                chunk_id: chunk.chunk_id.clone(),
                issue: "empty url".to_string(),
            });
        }
        if !canonical_jurisdiction_re().is_match(&chunk.jurisdiction) {
            issues.push(QualityIssue {
                chunk_id: chunk.chunk_id.clone(),
                issue: format!("non-canonical jurisdiction '{}'", chunk.jurisdiction),
            });
        }
        if chunk.chunk_index >= chunk.total_chunks {
            issues.push(QualityIssue {
                chunk_id: chunk.chunk_id.clone(),
                issue: format!(
                    "chunk_index {} outside total_chunks {}",
                    chunk.chunk_index, chunk.total_chunks
                ),
            });
        }
    }

    QualityReport {
        source_type,
        sample_size: chunks.len(),
        tokens: token_distribution(&token_counts),
        completeness,
        citation_coverage_pct: if chunks.is_empty() {
            0.0
        } else {
            cited as f64 / chunks.len() as f64 * 100.0
        },
        issues,
    }
}

/// Distribution over pre-sorted token counts.
fn token_distribution(sorted: &[usize]) -> TokenDistribution {
    if sorted.is_empty() {
        return TokenDistribution::default();
    }
    TokenDistribution {
        count: sorted.len(),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        avg: sorted.iter().sum::<usize>() as f64 / sorted.len() as f64,
        p50: percentile(sorted, 50.0),
        p95: percentile(sorted, 95.0),
        p99: percentile(sorted, 99.0),
    }
}

fn percentile(sorted: &[usize], p: f64) -> usize {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Human-readable tabular rendering of the full report.
pub fn render_markdown(report: &FullValidationReport) -> String {
    let mut out = String::new();
    out.push_str("# Validation report\n\n## Coverage\n\n");
    out.push_str(&format!(
        "{} of {} expected jurisdictions indexed ({:.1}%). Sampling caps at 10k records per source type.\n\n",
        report.coverage.total_indexed,
        report.coverage.total_expected,
        report.coverage.coverage_percent
    ));
    out.push_str("| Jurisdiction | Source type | Status |\n|---|---|---|\n");
    for j in &report.coverage.jurisdictions {
        out.push_str(&format!(
            "| {} | {} | {} |\n",
            j.jurisdiction, j.source_type, j.status
        ));
    }

    out.push_str("\n## Quality\n\n");
    out.push_str(
        "| Source type | Sample | Tokens p50 | p95 | p99 | Max | Citations % | Issues |\n|---|---|---|---|---|---|---|---|\n",
    );
    for q in &report.quality {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {:.1} | {} |\n",
            q.source_type,
            q.sample_size,
            q.tokens.p50,
            q.tokens.p95,
            q.tokens.p99,
            q.tokens.max,
            q.citation_coverage_pct,
            q.issues.len()
        ));
    }

    out.push_str("\n## Storage\n\n");
    if report.storage.missing_folders.is_empty() {
        out.push_str("All expected prefixes hold data.\n");
    } else {
        for folder in &report.storage.missing_folders {
            out.push_str(&format!("- missing: `{folder}`\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_on_small_sets() {
        let sorted: Vec<usize> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 50.0), 51);
        assert_eq!(percentile(&sorted, 95.0), 95);
        assert_eq!(percentile(&sorted, 99.0), 99);
        assert_eq!(percentile(&[42], 95.0), 42);
        assert_eq!(percentile(&[], 95.0), 0);
    }

    fn chunk(jurisdiction: &str, citation: &str) -> Chunk {
        Chunk {
            chunk_id: format!("{jurisdiction}-{citation}"),
            source_id: "cfr-title-21".into(),
            source_type: SourceType::Federal,
            jurisdiction: jurisdiction.into(),
            text: "Some regulatory text to count.".into(),
            citation: citation.into(),
            url: "https://www.ecfr.gov/x".into(),
            chunk_index: 0,
            total_chunks: 1,
            subsection: None,
            category: None,
            hierarchy: vec!["Title 21".into()],
            effective_date: None,
            last_amended: None,
            last_updated: Some("2026-01-01".into()),
            indexed_at: Some("2026-01-02T00:00:00Z".into()),
        }
    }

    #[test]
    fn quality_flags_missing_citation_and_bad_jurisdiction() {
        let chunks = vec![
            chunk("US", "21 C.F.R. § 117.3"),
            chunk("US", ""),
            chunk("texas", "Tex. Penal Code Ann. § 30.02"),
        ];
        let report = quality_report(SourceType::Federal, &chunks);
        assert_eq!(report.sample_size, 3);
        assert!((report.citation_coverage_pct - 66.666).abs() < 0.1);
        assert!(report.issues.iter().any(|i| i.issue == "empty citation"));
        assert!(report
            .issues
            .iter()
            .any(|i| i.issue.contains("non-canonical jurisdiction")));
        assert_eq!(report.completeness.with_last_updated, 3);
        assert_eq!(report.completeness.with_subsection, 0);
        assert!(report.tokens.count == 3 && report.tokens.min > 0);
    }

    #[test]
    fn canonical_jurisdiction_forms() {
        let re = canonical_jurisdiction_re();
        for ok in ["US", "TX", "TX-48201", "TX-houston", "NM-san-juan"] {
            assert!(re.is_match(ok), "{ok} should be canonical");
        }
        for bad in ["usa", "texas", "TX-", "tx-houston", "TX-Houston"] {
            assert!(!re.is_match(bad), "{bad} should not be canonical");
        }
    }

    #[test]
    fn empty_index_reports_every_jurisdiction_missing() {
        let expected = vec![
            (SourceType::Federal, "US".to_string()),
            (SourceType::State, "TX".to_string()),
            (SourceType::Municipal, "TX-houston".to_string()),
        ];
        let report = aggregate_coverage(&expected, &BTreeMap::new());
        assert_eq!(report.total_expected, 3);
        assert_eq!(report.total_indexed, 0);
        assert_eq!(report.coverage_percent, 0.0);
        assert_eq!(report.gaps.len(), 3);
        assert!(report.jurisdictions.iter().all(|j| j.status == "missing"));
    }

    #[test]
    fn partial_coverage_aggregates_by_source_type() {
        let expected = vec![
            (SourceType::Federal, "US".to_string()),
            (SourceType::County, "TX-48201".to_string()),
            (SourceType::County, "TX-48113".to_string()),
        ];
        let mut sampled = BTreeMap::new();
        sampled.insert(
            SourceType::Federal,
            ["US".to_string()].into_iter().collect::<BTreeSet<_>>(),
        );
        sampled.insert(
            SourceType::County,
            ["TX-48201".to_string()].into_iter().collect::<BTreeSet<_>>(),
        );
        let report = aggregate_coverage(&expected, &sampled);
        assert_eq!(report.total_indexed, 2);
        assert_eq!(report.gaps, vec!["TX-48113".to_string()]);
        let county = &report.by_source_type["county"];
        assert_eq!(county.expected, 2);
        assert_eq!(county.indexed, 1);
        assert!((county.coverage_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn markdown_report_renders_tables() {
        let expected = vec![(SourceType::Federal, "US".to_string())];
        let coverage = aggregate_coverage(&expected, &BTreeMap::new());
        let report = FullValidationReport {
            coverage,
            quality: vec![quality_report(SourceType::Federal, &[])],
            storage: StorageReport {
                missing_folders: vec!["federal/cfr/title-21/".to_string()],
                jurisdictions_without_data: vec!["US".to_string()],
            },
        };
        let markdown = render_markdown(&report);
        assert!(markdown.contains("| US | federal | missing |"));
        assert!(markdown.contains("missing: `federal/cfr/title-21/`"));
    }
}
