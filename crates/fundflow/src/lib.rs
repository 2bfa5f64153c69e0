// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # FundFlow Ingestion Core
//!
//! FundFlow aggregates African AI funding opportunities from heterogeneous
//! sources into a single authoritative store. This crate is the ingestion
//! core: it accepts a continuous stream of candidate records from four
//! independent collectors, classifies them, detects duplicates against the
//! existing corpus, validates quality, and routes each record either to an
//! auto-publish path or to a human-review queue - while tolerating
//! per-source failures without collapsing the whole pipeline.
//!
//! ## Architecture
//!
//! ```text
//! Collectors -> Router -> Classifier -> Deduplicator -> Validator -> Publisher
//!                             |  ^
//!                             v  |
//!                        Scrape Queue (on-demand enrichment)
//! ```
//!
//! Source health (status, rate budget, circuit breakers, quality score) is
//! shared state updated by every stage; the router and collectors consult it
//! before admitting new work. Stages communicate over bounded queues, each
//! of which acts as a backpressure point.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fundflow::config::PipelineConfig;
//! use fundflow::pipeline::Pipeline;
//! # async fn example(adapters: fundflow::pipeline::Adapters) -> fundflow::Result<()> {
//! let config = PipelineConfig::default();
//! let pipeline = Pipeline::spawn(config, adapters).await?;
//! // ... run collectors against pipeline.router_handle() ...
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! External systems (SQL store, vector index, LLM, search API, HTTP fetch)
//! are consumed through the narrow adapter traits in [`adapters`]; the core
//! never talks to a backend directly.

pub mod adapters;
pub mod admin;
pub mod classify;
pub mod collector;
pub mod config;
pub mod dead_letter;
pub mod dedup;
pub mod env_vars;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod publish;
pub mod queue;
pub mod ratelimit;
pub mod record;
pub mod router;
pub mod scrape;
pub mod validate;

pub use error::{Error, Result};
pub use record::{CandidateRecord, OpportunityRecord, Priority};

/// Default HTTP request timeout for outbound fetches.
pub const DEFAULT_HTTP_REQUEST_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(30);
/// Default HTTP connect timeout for outbound fetches.
pub const DEFAULT_HTTP_CONNECT_TIMEOUT: std::time::Duration =
    std::time::Duration::from_secs(10);
