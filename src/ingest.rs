//! Ingestion orchestration: fetch → store raw → chunk → embed → upsert,
//! checkpointed per unit.
//!
//! Families run sequentially; units within a family run sequentially so
//! checkpoints advance monotonically and memory stays bounded by one
//! unit. A unit failure is recorded in the per-unit outcome and the run
//! moves on; a pre-unit failure (index enumeration, checkpoint write)
//! aborts the pipeline with the last good checkpoint intact. On
//! completion the checkpoint is deleted and a best-effort freshness
//! update goes to the Application Database.
//!
//! The federal family runs one workflow per title: parts prefer the
//! pre-parsed cache (see [`crate::fetcher_federal::cache_title`]), and
//! the chunk/embed-batch/upsert-batch steps persist per-instance scratch
//! state so an interrupted title resumes mid-part.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::appdb::{AppDb, JurisdictionStatus, SourceStatus};
use crate::chunker::{chunk_section, ChunkContext};
use crate::config::{Config, Credentials};
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::fetcher::SourceFetcher;
use crate::fetcher_county::CountyFetcher;
use crate::fetcher_federal::{load_cached_part, FederalFetcher};
use crate::fetcher_municipal::{MunicipalFetcher, RenderClient};
use crate::fetcher_statute::StatuteFetcher;
use crate::fetcher_tac::TacFetcher;
use crate::models::{Checkpoint, CheckpointStatus, Chunk, Section, SourceType};
use crate::object_store::ObjectStore;
use crate::scrape::Scraper;
use crate::vector_index::{VectorIndex, VectorRecord};
use crate::workflow::WorkflowState;

/// What happened to one unit (a CFR part, a statute code, a TAC title, a
/// county, or a city).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit: String,
    pub sections: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub skipped_not_found: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub section_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Unit-fatal failure, recorded rather than propagated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted result of a federal part's chunking step.
#[derive(Debug, Serialize, Deserialize)]
struct ChunkStep {
    chunks: Vec<Chunk>,
    #[serde(default)]
    section_errors: Vec<String>,
}

impl UnitOutcome {
    fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            sections: 0,
            chunks: 0,
            vectors: 0,
            skipped_not_found: 0,
            section_errors: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }
}

/// One pipeline's aggregated run result.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub source_type: SourceType,
    pub units: Vec<UnitOutcome>,
    pub chunks_processed: u64,
    pub duration_ms: u64,
    pub completed: bool,
}

impl PipelineResult {
    pub fn failed_units(&self) -> usize {
        self.units.iter().filter(|u| u.error.is_some()).count()
    }
}

/// Aggregate over every pipeline a batch run invoked.
#[derive(Debug, Default, Serialize)]
pub struct BatchPipelineResult {
    pub pipelines: Vec<PipelineResult>,
}

impl BatchPipelineResult {
    pub fn total_vectors(&self) -> u64 {
        self.pipelines.iter().map(|p| p.chunks_processed).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.pipelines
            .iter()
            .any(|p| !p.completed || p.failed_units() > 0)
    }
}

pub struct Ingestor {
    config: Config,
    store: Arc<ObjectStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<Embedder>,
    scraper: Arc<Scraper>,
    render: Arc<RenderClient>,
    app_db: Arc<AppDb>,
}

impl Ingestor {
    /// Build every external-service client once; all are read-only after
    /// construction.
    pub fn new(config: Config, creds: &Credentials) -> Result<Self> {
        let store = Arc::new(ObjectStore::new(&config.object_store, creds)?);
        let index = Arc::new(VectorIndex::new(&config.vector_index, creds)?);
        let embedder = Arc::new(Embedder::new(
            &config.embedding,
            creds,
            config.vector_index.dimension,
        )?);
        let scraper = Arc::new(Scraper::new(&config.scrape)?);
        let render = Arc::new(RenderClient::new(&config.render, creds)?);
        let app_db = Arc::new(AppDb::new(&config.app_db, creds)?);
        Ok(Self {
            config,
            store,
            index,
            embedder,
            scraper,
            render,
            app_db,
        })
    }

    /// Run the requested families in fixed order, aggregating results.
    pub async fn run_families(&self, families: &BTreeSet<String>) -> Result<BatchPipelineResult> {
        let mut batch = BatchPipelineResult::default();
        for family in ["federal", "state", "county", "municipal"] {
            if !families.contains(family) {
                continue;
            }
            let results = self.run_family(family).await?;
            batch.pipelines.extend(results);
        }
        Ok(batch)
    }

    /// Run one family's pipeline(s).
    pub async fn run_family(&self, family: &str) -> Result<Vec<PipelineResult>> {
        let started = Instant::now();
        let mut results = Vec::new();

        match family {
            "federal" => {
                for title in &self.config.ingestion.federal_titles {
                    results.push(self.run_federal_title(*title).await?);
                }
            }
            "state" => {
                if !self.config.ingestion.statute_codes.is_empty() {
                    let fetcher = self.statute_fetcher();
                    results.push(self.run_pipeline(&fetcher, "tx-statute").await?);
                }
                if !self.config.ingestion.tac_titles.is_empty() {
                    let fetcher = self.tac_fetcher();
                    results.push(self.run_pipeline(&fetcher, "tx-tac").await?);
                }
            }
            "county" => {
                let fetcher = self.county_fetcher();
                results.push(self.run_pipeline(&fetcher, "county").await?);
            }
            "municipal" => {
                let fetcher = self.municipal_fetcher();
                results.push(self.run_pipeline(&fetcher, "municipal").await?);
            }
            other => {
                return Err(Error::Config(format!("unknown source family '{other}'")));
            }
        }

        self.report_freshness(family, &results, started.elapsed())
            .await;
        Ok(results)
    }

    /// Run a single unit outside the checkpoint flow (operator verb).
    pub async fn run_unit(&self, family: &str, identifier: &str) -> Result<UnitOutcome> {
        match family {
            "federal" => {
                let title: u32 = identifier.parse().map_err(|_| {
                    Error::Config(format!("federal unit '{identifier}' is not a title number"))
                })?;
                let fetcher = self.federal_fetcher(title);
                // The unit grain inside a title is a part; an explicit
                // title identifier reprocesses all of its parts.
                let mut combined = UnitOutcome::new(identifier);
                for part in fetcher.list_units().await? {
                    let outcome = self.process_unit(&fetcher, &part).await;
                    combined.sections += outcome.sections;
                    combined.chunks += outcome.chunks;
                    combined.vectors += outcome.vectors;
                    combined.skipped_not_found += outcome.skipped_not_found;
                    combined.section_errors.extend(outcome.section_errors);
                    combined.warnings.extend(outcome.warnings);
                    if let Some(e) = outcome.error {
                        combined.section_errors.push(format!("part {part}: {e}"));
                    }
                }
                Ok(combined)
            }
            "state" => {
                if self
                    .config
                    .ingestion
                    .statute_codes
                    .iter()
                    .any(|c| c == identifier)
                {
                    let fetcher = self.statute_fetcher();
                    Ok(self.process_unit(&fetcher, identifier).await)
                } else {
                    let fetcher = self.tac_fetcher();
                    Ok(self.process_unit(&fetcher, identifier).await)
                }
            }
            "county" => {
                let fetcher = self.county_fetcher();
                Ok(self.process_unit(&fetcher, identifier).await)
            }
            "municipal" => {
                let fetcher = self.municipal_fetcher();
                Ok(self.process_unit(&fetcher, identifier).await)
            }
            other => Err(Error::Config(format!("unknown source family '{other}'"))),
        }
    }

    fn federal_fetcher(&self, title: u32) -> FederalFetcher {
        FederalFetcher::new(
            self.scraper.clone(),
            &self.config.ingestion.ecfr_base_url,
            title,
        )
    }

    fn statute_fetcher(&self) -> StatuteFetcher {
        StatuteFetcher::new(
            self.scraper.clone(),
            &self.config.ingestion.statute_base_url,
            self.config.ingestion.statute_codes.clone(),
        )
    }

    fn tac_fetcher(&self) -> TacFetcher {
        TacFetcher::new(
            self.scraper.clone(),
            &self.config.ingestion.tac_base_url,
            self.config.ingestion.tac_titles.clone(),
        )
    }

    fn county_fetcher(&self) -> CountyFetcher {
        CountyFetcher::new(self.scraper.clone(), self.config.ingestion.counties.clone())
    }

    fn municipal_fetcher(&self) -> MunicipalFetcher {
        MunicipalFetcher::new(self.render.clone(), self.config.ingestion.cities.clone())
    }

    // ============ Generic checkpointed pipeline ============

    async fn run_pipeline(
        &self,
        fetcher: &dyn SourceFetcher,
        label: &str,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        let checkpoint_key = fetcher.checkpoint_key();
        let mut checkpoint: Checkpoint = self
            .store
            .get_json(&checkpoint_key)
            .await?
            .unwrap_or_default();

        let units = fetcher.list_units().await?;
        let remaining = remaining_units(&units, checkpoint.last_processed().as_deref());
        info!(
            pipeline = label,
            total = units.len(),
            remaining = remaining.len(),
            "starting pipeline"
        );

        let mut result = PipelineResult {
            pipeline: label.to_string(),
            source_type: fetcher.source_type(),
            units: Vec::new(),
            chunks_processed: checkpoint.chunks_processed,
            duration_ms: 0,
            completed: false,
        };

        for unit in remaining {
            let outcome = self.process_unit(fetcher, &unit).await;
            if let Some(e) = &outcome.error {
                error!(pipeline = label, unit = %unit, error = %e, "unit failed");
            } else {
                checkpoint.status = CheckpointStatus::InProgress;
                checkpoint.timestamp = Utc::now();
                checkpoint.chunks_processed += outcome.vectors as u64;
                fetcher.record_progress(&mut checkpoint, &unit);
                // Checkpoint write strictly precedes the next unit's fetch.
                self.store
                    .put_json(&checkpoint_key, &checkpoint, &Default::default())
                    .await?;
            }
            result.units.push(outcome);
        }

        self.store.delete(&checkpoint_key).await?;
        result.chunks_processed = checkpoint.chunks_processed;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.completed = true;
        Ok(result)
    }

    /// Fetch, persist raw, chunk, embed, upsert one unit. Failures land
    /// in the outcome, never propagate.
    async fn process_unit(&self, fetcher: &dyn SourceFetcher, unit: &str) -> UnitOutcome {
        let mut outcome = UnitOutcome::new(unit);

        let fetched = match fetcher.fetch_unit(unit).await {
            Ok(fetched) => fetched,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };
        outcome.sections = fetched.sections.len();
        outcome.skipped_not_found = fetched.skipped_not_found;
        outcome.section_errors = fetched.section_errors;
        outcome.warnings = fetched.warnings;

        for doc in &fetched.raw_docs {
            if let Err(e) = self.store.put(&doc.key, &doc.bytes, &doc.metadata).await {
                outcome.error = Some(format!("raw store of {} failed: {e}", doc.key));
                return outcome;
            }
        }

        let mut chunks = self.chunk_sections(&fetched.sections, &mut outcome);
        outcome.chunks = chunks.len();
        if chunks.is_empty() {
            return outcome;
        }

        match self.embed_and_upsert(&mut chunks).await {
            Ok(count) => outcome.vectors = count,
            Err(e) => outcome.error = Some(e.to_string()),
        }
        outcome
    }

    fn chunk_sections(&self, sections: &[Section], outcome: &mut UnitOutcome) -> Vec<Chunk> {
        let ctx = ChunkContext::default();
        let mut chunks = Vec::new();
        for section in sections {
            match chunk_section(
                section,
                &ctx,
                self.config.chunking.max_tokens,
                self.config.chunking.overlap_ratio,
            ) {
                Ok(section_chunks) => chunks.extend(section_chunks),
                Err(e) => {
                    outcome
                        .section_errors
                        .push(format!("{}: {e}", section.section_id));
                }
            }
        }
        chunks
    }

    async fn embed_and_upsert(&self, chunks: &mut [Chunk]) -> Result<usize> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        let records = build_records(chunks, vectors, &Utc::now().to_rfc3339())?;
        for batch in records.chunks(self.config.ingestion.upsert_batch_size) {
            self.index.upsert(batch).await?;
        }
        Ok(records.len())
    }

    // ============ Federal per-title workflow ============

    /// One CFR title as a long-running workflow: parts prefer cached
    /// sections, and chunk/embed-batch/upsert-batch steps persist
    /// scratch state so an interrupted part resumes mid-step. Scratch is
    /// cleared with the checkpoint when the title completes.
    async fn run_federal_title(&self, title: u32) -> Result<PipelineResult> {
        let started = Instant::now();
        let fetcher = self.federal_fetcher(title);
        let label = format!("cfr-title-{title}");
        let workflow = WorkflowState::new(self.store.clone(), &label, "current");

        let checkpoint_key = fetcher.checkpoint_key();
        let mut checkpoint: Checkpoint = self
            .store
            .get_json(&checkpoint_key)
            .await?
            .unwrap_or_default();

        let units = fetcher.list_units().await?;
        let remaining = remaining_units(&units, checkpoint.last_processed().as_deref());
        info!(title, total = units.len(), remaining = remaining.len(), "starting title workflow");

        let mut result = PipelineResult {
            pipeline: label.clone(),
            source_type: SourceType::Federal,
            units: Vec::new(),
            chunks_processed: checkpoint.chunks_processed,
            duration_ms: 0,
            completed: false,
        };

        for part in remaining {
            let outcome = self.process_federal_part(&fetcher, &workflow, title, &part).await;
            if let Some(e) = &outcome.error {
                error!(title, part = %part, error = %e, "part failed");
            } else {
                checkpoint.status = CheckpointStatus::InProgress;
                checkpoint.timestamp = Utc::now();
                checkpoint.chunks_processed += outcome.vectors as u64;
                fetcher.record_progress(&mut checkpoint, &part);
                self.store
                    .put_json(&checkpoint_key, &checkpoint, &Default::default())
                    .await?;
            }
            result.units.push(outcome);
        }

        self.store.delete(&checkpoint_key).await?;
        if let Err(e) = workflow.clear().await {
            warn!(title, error = %e, "failed to clear workflow scratch");
        }
        result.chunks_processed = checkpoint.chunks_processed;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.completed = true;
        Ok(result)
    }

    async fn process_federal_part(
        &self,
        fetcher: &FederalFetcher,
        workflow: &WorkflowState,
        title: u32,
        part: &str,
    ) -> UnitOutcome {
        let mut outcome = UnitOutcome::new(part);

        // Sections: the pre-parse cache wins; a cache miss falls back to
        // a live fetch (which also persists the raw XML).
        let sections: Vec<Section> = match load_cached_part(&self.store, title, part).await {
            Ok(Some(cached)) => cached.sections,
            Ok(None) => match fetcher.fetch_unit(part).await {
                Ok(fetched) => {
                    for doc in &fetched.raw_docs {
                        if let Err(e) = self.store.put(&doc.key, &doc.bytes, &doc.metadata).await {
                            outcome.error = Some(format!("raw store failed: {e}"));
                            return outcome;
                        }
                    }
                    outcome.skipped_not_found = fetched.skipped_not_found;
                    outcome.section_errors = fetched.section_errors;
                    outcome.warnings = fetched.warnings;
                    fetched.sections
                }
                Err(e) => {
                    outcome.error = Some(e.to_string());
                    return outcome;
                }
            },
            Err(e) => {
                outcome.error = Some(format!("cache read failed: {e}"));
                return outcome;
            }
        };
        outcome.sections = sections.len();

        // Chunking as a persisted step.
        let chunk_step = format!("chunk-part-{part}");
        let chunked: ChunkStep = match workflow.load_step(&chunk_step).await {
            Ok(Some(saved)) => saved,
            Ok(None) => {
                let mut probe = UnitOutcome::new(part);
                let chunks = self.chunk_sections(&sections, &mut probe);
                let result = ChunkStep {
                    chunks,
                    section_errors: probe.section_errors,
                };
                if let Err(e) = workflow.save_step(&chunk_step, &result).await {
                    outcome.error = Some(e.to_string());
                    return outcome;
                }
                result
            }
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };
        outcome.section_errors.extend(chunked.section_errors);
        outcome.chunks = chunked.chunks.len();
        if chunked.chunks.is_empty() {
            return outcome;
        }

        // Embed and upsert, one persisted step per batch.
        let batch_size = self.config.embedding.batch_size;
        let indexed_at = Utc::now().to_rfc3339();
        for (batch_index, batch) in chunked.chunks.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            let embed_step = format!("embed-batch-{part}-{batch_index}");
            let embedder = self.embedder.clone();
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors: Vec<Vec<f32>> = match workflow
                .run_step(&embed_step, move || async move { embedder.embed(&texts).await })
                .await
            {
                Ok(vectors) => vectors,
                Err(e) => {
                    outcome.error = Some(e.to_string());
                    return outcome;
                }
            };

            let upsert_step = format!("upsert-batch-{part}-{batch_index}");
            let already: Option<usize> = match workflow.load_step(&upsert_step).await {
                Ok(saved) => saved,
                Err(e) => {
                    outcome.error = Some(e.to_string());
                    return outcome;
                }
            };
            let count = match already {
                Some(count) => count,
                None => {
                    let mut batch_chunks = batch.to_vec();
                    let upserted: Result<usize> = async {
                        let records = build_records(&mut batch_chunks, vectors, &indexed_at)?;
                        for slice in records.chunks(self.config.ingestion.upsert_batch_size) {
                            self.index.upsert(slice).await?;
                        }
                        Ok(records.len())
                    }
                    .await;
                    match upserted {
                        Ok(count) => {
                            if let Err(e) = workflow.save_step(&upsert_step, &count).await {
                                outcome.error = Some(e.to_string());
                                return outcome;
                            }
                            count
                        }
                        Err(e) => {
                            outcome.error = Some(e.to_string());
                            return outcome;
                        }
                    }
                }
            };
            outcome.vectors += count;
        }
        outcome
    }

    /// Best-effort freshness update; logged, never fatal.
    async fn report_freshness(
        &self,
        family: &str,
        results: &[PipelineResult],
        elapsed: std::time::Duration,
    ) {
        let total_vectors: u64 = results.iter().map(|r| r.chunks_processed).sum();
        let failed: usize = results.iter().map(|r| r.failed_units()).sum();
        let status = SourceStatus {
            source_type: family.to_string(),
            status: if failed == 0 { "completed" } else { "partial" }.to_string(),
            last_scraped_at: Utc::now(),
            titles_processed: (family == "federal")
                .then(|| self.config.ingestion.federal_titles.len() as u32),
            codes_processed: (family == "state")
                .then(|| self.config.ingestion.statute_codes.len() as u32),
            total_vectors,
            duration_ms: elapsed.as_millis() as u64,
        };
        if let Err(e) = self.app_db.update_source_status(&status).await {
            warn!(family, error = %e, "freshness update failed");
        }

        for jurisdiction in self.family_jurisdictions(family, results) {
            if let Err(e) = self.app_db.upsert_jurisdiction(&jurisdiction).await {
                warn!(family, jurisdiction = %jurisdiction.id, error = %e, "jurisdiction update failed");
            }
        }
    }

    /// Jurisdiction status rows for one family run. County and municipal
    /// units are jurisdictions themselves, so their vector counts come
    /// from the matching unit outcome.
    fn family_jurisdictions(
        &self,
        family: &str,
        results: &[PipelineResult],
    ) -> Vec<JurisdictionStatus> {
        let now = Utc::now();
        let unit_vectors = |unit: &str| -> Option<u64> {
            results
                .iter()
                .flat_map(|r| &r.units)
                .find(|u| u.unit == unit)
                .map(|u| u.vectors as u64)
        };
        let total: u64 = results.iter().map(|r| r.chunks_processed).sum();

        match family {
            "federal" => vec![JurisdictionStatus {
                id: "US".to_string(),
                name: "United States".to_string(),
                kind: "federal".to_string(),
                parent: None,
                is_active: true,
                last_scraped_at: Some(now),
                vector_count: Some(total),
            }],
            "state" => vec![JurisdictionStatus {
                id: "TX".to_string(),
                name: "Texas".to_string(),
                kind: "state".to_string(),
                parent: Some("US".to_string()),
                is_active: true,
                last_scraped_at: Some(now),
                vector_count: Some(total),
            }],
            "county" => self
                .config
                .ingestion
                .counties
                .iter()
                .map(|county| JurisdictionStatus {
                    id: county.id.clone(),
                    name: county.name.clone(),
                    kind: "county".to_string(),
                    parent: county.id.split('-').next().map(|s| s.to_string()),
                    is_active: true,
                    last_scraped_at: Some(now),
                    vector_count: unit_vectors(&county.id),
                })
                .collect(),
            "municipal" => self
                .config
                .ingestion
                .cities
                .iter()
                .map(|city| {
                    let id = city.jurisdiction();
                    JurisdictionStatus {
                        vector_count: unit_vectors(&id),
                        id,
                        name: city.name.clone(),
                        kind: "municipal".to_string(),
                        parent: Some(city.state.clone()),
                        is_active: true,
                        last_scraped_at: Some(now),
                    }
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Units left to process: everything after `last_processed` in list
/// order. An unknown `last_processed` (upstream list changed) restarts
/// from the beginning rather than silently skipping everything.
fn remaining_units(units: &[String], last_processed: Option<&str>) -> Vec<String> {
    match last_processed {
        Some(last) if units.iter().any(|u| u == last) => units
            .iter()
            .skip_while(|u| u.as_str() != last)
            .skip(1)
            .cloned()
            .collect(),
        _ => units.to_vec(),
    }
}

/// Vector records from chunks: `id = chunk_id`, metadata is the chunk
/// itself (embedding excluded by construction) stamped with
/// `indexed_at`.
fn build_records(
    chunks: &mut [Chunk],
    vectors: Vec<Vec<f32>>,
    indexed_at: &str,
) -> Result<Vec<VectorRecord>> {
    if chunks.len() != vectors.len() {
        return Err(Error::Validation(format!(
            "embedding count {} does not match chunk count {}",
            vectors.len(),
            chunks.len()
        )));
    }
    chunks
        .iter_mut()
        .zip(vectors)
        .map(|(chunk, values)| {
            chunk.indexed_at = Some(indexed_at.to_string());
            let metadata = serde_json::to_value(&*chunk)
                .map_err(|e| Error::Validation(format!("chunk metadata serialize: {e}")))?;
            Ok(VectorRecord {
                id: chunk.chunk_id.clone(),
                values,
                metadata,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn resume_skips_through_last_processed() {
        let all = units(&["100", "101", "117", "120"]);
        assert_eq!(remaining_units(&all, None), all);
        assert_eq!(remaining_units(&all, Some("100")), units(&["101", "117", "120"]));
        assert_eq!(remaining_units(&all, Some("117")), units(&["120"]));
        assert_eq!(remaining_units(&all, Some("120")), Vec::<String>::new());
    }

    #[test]
    fn unknown_checkpoint_unit_restarts_from_scratch() {
        let all = units(&["100", "101"]);
        assert_eq!(remaining_units(&all, Some("999")), all);
    }

    #[test]
    fn records_carry_chunk_metadata_and_indexed_at() {
        use crate::models::SourceType;
        let mut chunks = vec![Chunk {
            chunk_id: "cfr-title-21-117.3-0-abc".into(),
            source_id: "cfr-title-21".into(),
            source_type: SourceType::Federal,
            jurisdiction: "US".into(),
            text: "Regulatory text.".into(),
            citation: "21 C.F.R. § 117.3".into(),
            url: "https://www.ecfr.gov/x".into(),
            chunk_index: 0,
            total_chunks: 1,
            subsection: None,
            category: None,
            hierarchy: vec![],
            effective_date: None,
            last_amended: None,
            last_updated: None,
            indexed_at: None,
        }];
        let records = build_records(&mut chunks, vec![vec![0.1, 0.2]], "2026-08-01T00:00:00Z")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "cfr-title-21-117.3-0-abc");
        assert_eq!(records[0].metadata["indexedAt"], "2026-08-01T00:00:00Z");
        assert_eq!(records[0].metadata["jurisdiction"], "US");

        let mut short = chunks.clone();
        assert!(build_records(&mut short, vec![], "t").is_err());
    }

    #[test]
    fn batch_result_failure_detection() {
        let ok = PipelineResult {
            pipeline: "tx-statute".into(),
            source_type: SourceType::State,
            units: vec![UnitOutcome::new("PE")],
            chunks_processed: 10,
            duration_ms: 5,
            completed: true,
        };
        let mut failed_unit = UnitOutcome::new("HS");
        failed_unit.error = Some("rate limited by embeddings after retries".into());
        let partial = PipelineResult {
            pipeline: "tx-statute".into(),
            source_type: SourceType::State,
            units: vec![failed_unit],
            chunks_processed: 0,
            duration_ms: 5,
            completed: true,
        };

        let healthy = BatchPipelineResult {
            pipelines: vec![ok.clone()],
        };
        assert!(!healthy.has_failures());
        assert_eq!(healthy.total_vectors(), 10);

        let degraded = BatchPipelineResult {
            pipelines: vec![ok, partial],
        };
        assert!(degraded.has_failures());
    }
}
