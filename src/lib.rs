//! # Reg Harness
//!
//! **Regulatory ingestion and retrieval core for legal-compliance RAG.**
//!
//! Reg Harness answers one question for a natural-language query plus an
//! optional street address: which federal, state, county, and municipal
//! regulations apply, and what are their exact citations?
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │   Fetchers   │──▶│   Pipeline     │──▶│ Vector index │
//! │ CFR/TX/Cnty/ │   │ Chunk + Embed │   │  + Object    │
//! │  Municipal   │   │  (checkpoint) │   │    store     │
//! └──────────────┘   └───────────────┘   └──────┬───────┘
//!                                               │
//!                       geocode → embed → filter-search → rerank
//!                                               │
//!                                        ┌──────▼───────┐
//!                                        │ LLM answer + │
//!                                        │  citations   │
//!                                        └──────────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. **Fetchers** walk each source (eCFR XML, Texas statute and TAC
//!    HTML, county platforms, municipal Markdown) and produce parsed
//!    [`models::Section`]s plus raw documents for the object store.
//! 2. The **chunker** ([`chunker`]) segments sections structure-first
//!    into ≤ budget [`models::Chunk`]s with deterministic IDs and
//!    Bluebook citations ([`citation`]).
//! 3. The **embedder** ([`embedder`]) turns chunk text into vectors; the
//!    **orchestrator** ([`ingest`]) upserts them with checkpointed,
//!    resumable progress.
//! 4. At query time ([`query`]), an address resolves to jurisdictions
//!    ([`geocode`]), the index is filter-searched and reranked, and the
//!    LLM ([`llm`]) produces a cited answer parsed by [`answer`] and
//!    persisted via [`appdb`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, validation, env credentials |
//! | [`error`] | Error taxonomy shared across subsystems |
//! | [`models`] | Core types: `Section`, `Chunk`, `Checkpoint`, `Message` |
//! | [`tokenizer`] | BPE token counts matching the embedding model |
//! | [`citation`] | Bluebook formatting, slugs, deterministic IDs |
//! | [`scrape`] | Rate-limited HTTP fetching with retry/backoff |
//! | [`object_store`] | S3-compatible blob adapter + canonical key layout |
//! | [`vector_index`] | Upsert/query adapter with `$eq`/`$in`/`$or` filters |
//! | [`embedder`] | Batched embedding with preflight token checks |
//! | [`chunker`] | Structure-aware segmentation with overlap fallback |
//! | [`fetcher`] | Fetcher contract + shared HTML/subsection parsing |
//! | [`fetcher_federal`] | eCFR titles/parts, XML parse, pre-parse cache |
//! | [`fetcher_statute`] | Texas statutes TOC → chapters → sections |
//! | [`fetcher_tac`] | Texas Administrative Code viewer walk |
//! | [`fetcher_county`] | County platform adapters + registry |
//! | [`fetcher_municipal`] | Rendering service + Markdown section walk |
//! | [`ingest`] | Checkpointed per-family orchestration |
//! | [`workflow`] | Per-instance step scratch state |
//! | [`geocode`] | Address → jurisdiction list (never fails the query) |
//! | [`llm`] | Completion client with error taxonomy mapping |
//! | [`answer`] | Prompt assembly; citation/permit/summary parsing |
//! | [`query`] | `process_query`: retrieve, rerank, generate, persist |
//! | [`appdb`] | Conversations, messages, freshness records |
//! | [`validate`] | Coverage, quality, and storage reports |

pub mod answer;
pub mod appdb;
pub mod chunker;
pub mod citation;
pub mod config;
pub mod embedder;
pub mod error;
pub mod fetcher;
pub mod fetcher_county;
pub mod fetcher_federal;
pub mod fetcher_municipal;
pub mod fetcher_statute;
pub mod fetcher_tac;
pub mod geocode;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod object_store;
pub mod query;
pub mod scrape;
pub mod tokenizer;
pub mod validate;
pub mod vector_index;
pub mod workflow;
