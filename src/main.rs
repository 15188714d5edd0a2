//! `reg` — operator CLI for the regulatory ingestion and retrieval core.
//!
//! Exit codes: `0` success, `1` configuration error (missing credentials
//! or invalid config), `2` partial failure (some units failed), `3`
//! unrecoverable error.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use reg_harness::appdb::AppDb;
use reg_harness::config::{load_config, Config, Credentials};
use reg_harness::embedder::Embedder;
use reg_harness::error::Error;
use reg_harness::fetcher_federal::{cache_title, FederalFetcher};
use reg_harness::geocode::Geocoder;
use reg_harness::ingest::Ingestor;
use reg_harness::llm::LlmClient;
use reg_harness::object_store::ObjectStore;
use reg_harness::query::QueryPipeline;
use reg_harness::validate::{render_markdown, Validator};
use reg_harness::vector_index::VectorIndex;

#[derive(Parser)]
#[command(
    name = "reg",
    about = "Reg Harness — regulatory ingestion and retrieval core for legal-compliance RAG",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/reg.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ingestion for the enabled (or named) source families
    Ingest {
        /// Families to run (federal, state, county, municipal);
        /// defaults to the enabled set from config
        #[arg(long)]
        family: Vec<String>,
    },

    /// Run ingestion for one unit of one family
    IngestUnit {
        /// Source family
        family: String,
        /// Unit identifier (CFR title, statute code, TAC title,
        /// county id, or city jurisdiction)
        identifier: String,
    },

    /// Pre-parse one CFR title into the object-store cache
    CacheFederal {
        /// CFR title number
        title: u32,
    },

    /// Answer a compliance question
    Query {
        /// The question
        question: String,
        /// Street address to scope jurisdictions
        #[arg(long)]
        address: Option<String>,
        /// User id for conversation history
        #[arg(long)]
        user: Option<String>,
    },

    /// Conversation history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Jurisdiction coverage report
    Coverage {
        /// Output format: markdown or json
        #[arg(long, default_value = "markdown")]
        format: String,
    },

    /// Full validation report (coverage, quality, storage)
    Validate {
        /// Output format: markdown or json
        #[arg(long, default_value = "markdown")]
        format: String,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List recent conversations
    List {
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Fetch one conversation with its messages
    Get {
        /// Conversation id
        id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("reg_harness=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<Error>() {
                Some(Error::Config(_)) => ExitCode::from(1),
                _ => ExitCode::from(3),
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli.config)?;
    let creds = Credentials::from_env()?;

    match cli.command {
        Commands::Ingest { family } => {
            let families = if family.is_empty() {
                config.ingestion.enabled_sources.clone()
            } else {
                family.into_iter().collect()
            };
            let ingestor = Ingestor::new(config, &creds)?;
            let batch = ingestor.run_families(&families).await?;

            for pipeline in &batch.pipelines {
                println!("pipeline {}", pipeline.pipeline);
                println!("  units processed: {}", pipeline.units.len());
                println!("  vectors upserted: {}", pipeline.chunks_processed);
                println!("  failed units: {}", pipeline.failed_units());
                println!("  duration: {} ms", pipeline.duration_ms);
                for unit in pipeline.units.iter().filter(|u| u.error.is_some()) {
                    println!(
                        "  failed: {} ({})",
                        unit.unit,
                        unit.error.as_deref().unwrap_or_default()
                    );
                }
            }
            println!("total vectors: {}", batch.total_vectors());

            if batch.has_failures() {
                println!("partial failure");
                return Ok(ExitCode::from(2));
            }
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }

        Commands::IngestUnit { family, identifier } => {
            let ingestor = Ingestor::new(config, &creds)?;
            let outcome = ingestor.run_unit(&family, &identifier).await?;
            println!("unit {}", outcome.unit);
            println!("  sections: {}", outcome.sections);
            println!("  chunks: {}", outcome.chunks);
            println!("  vectors: {}", outcome.vectors);
            println!("  skipped (404): {}", outcome.skipped_not_found);
            for err in &outcome.section_errors {
                println!("  section error: {err}");
            }
            if let Some(e) = &outcome.error {
                println!("failed: {e}");
                return Ok(ExitCode::from(2));
            }
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }

        Commands::CacheFederal { title } => {
            let store = ObjectStore::new(&config.object_store, &creds)?;
            let scraper = Arc::new(reg_harness::scrape::Scraper::new(&config.scrape)?);
            let fetcher = FederalFetcher::new(scraper, &config.ingestion.ecfr_base_url, title);
            let summary = cache_title(&fetcher, &store).await?;
            println!("cache title {title}");
            println!("  parts fetched: {}", summary.parts_fetched);
            println!("  parts re-parsed: {}", summary.parts_reparsed);
            println!("  parts unchanged: {}", summary.parts_unchanged);
            println!("  sections cached: {}", summary.sections_cached);
            for failure in &summary.failures {
                println!("  failed: {failure}");
            }
            if summary.failures.is_empty() {
                println!("ok");
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(2))
            }
        }

        Commands::Query {
            question,
            address,
            user,
        } => {
            let pipeline = build_query_pipeline(&config, &creds)?;
            let result = pipeline
                .process_query(&question, address.as_deref(), user.as_deref())
                .await?;

            println!("{}", result.answer.text);
            println!();
            println!(
                "confidence: {} ({:.2}) — {}",
                result.confidence.level, result.confidence.score, result.confidence.reason
            );
            for citation in &result.answer.citations {
                println!("[{}] {} — {}", citation.index, citation.citation, citation.url);
            }
            for warning in &result.answer.warnings {
                println!("warning: {warning}");
            }
            println!("query id: {}", result.query_id);
            Ok(ExitCode::SUCCESS)
        }

        Commands::History { action } => {
            let app_db = AppDb::new(&config.app_db, &creds)?;
            match action {
                HistoryAction::List { user, limit } => {
                    let conversations =
                        app_db.list_conversations(user.as_deref(), limit).await?;
                    for conversation in &conversations {
                        println!(
                            "{}  {}  {} message(s)",
                            conversation.id,
                            conversation.updated_at.format("%Y-%m-%d %H:%M"),
                            conversation.messages.len()
                        );
                    }
                }
                HistoryAction::Get { id } => match app_db.get_conversation(&id).await? {
                    Some(conversation) => {
                        println!("{}", serde_json::to_string_pretty(&conversation)?);
                    }
                    None => println!("conversation {id} not found"),
                },
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Coverage { format } => {
            let validator = build_validator(config, &creds)?;
            let coverage = validator.check_coverage().await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&coverage)?);
            } else {
                println!(
                    "coverage: {}/{} jurisdictions ({:.1}%)",
                    coverage.total_indexed, coverage.total_expected, coverage.coverage_percent
                );
                for j in &coverage.jurisdictions {
                    println!("  {}  {}  {}", j.jurisdiction, j.source_type, j.status);
                }
                for gap in &coverage.gaps {
                    println!("  gap: {gap}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Validate { format } => {
            let validator = build_validator(config, &creds)?;
            let report = validator.full_report().await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", render_markdown(&report));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_query_pipeline(config: &Config, creds: &Credentials) -> anyhow::Result<QueryPipeline> {
    Ok(QueryPipeline::new(
        Arc::new(Geocoder::new(&config.geocoder)?),
        Arc::new(Embedder::new(
            &config.embedding,
            creds,
            config.vector_index.dimension,
        )?),
        Arc::new(VectorIndex::new(&config.vector_index, creds)?),
        Arc::new(LlmClient::new(&config.llm, creds)?),
        Arc::new(AppDb::new(&config.app_db, creds)?),
        config.retrieval.clone(),
    ))
}

fn build_validator(config: Config, creds: &Credentials) -> anyhow::Result<Validator> {
    let index = Arc::new(VectorIndex::new(&config.vector_index, creds)?);
    let store = Arc::new(ObjectStore::new(&config.object_store, creds)?);
    Ok(Validator::new(index, store, config))
}
