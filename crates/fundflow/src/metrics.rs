// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

// Allow expect() in this module: used for fallback metric creation where
// the fallback name is guaranteed to be valid.
#![allow(clippy::expect_used)]

//! Prometheus metrics for the ingestion pipeline.
//!
//! FundFlow is a library embedded in multiple binaries. When two components
//! register the same metric name, the default Prometheus registry returns
//! an error and the upstream `register_*` macros panic. The helpers here
//! log and continue instead, returning an unregistered metric as a
//! fallback.

use std::sync::LazyLock;

use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts};
use tracing::warn;

// Counter metrics include the _total suffix per Prometheus naming convention.

/// Records entering each stage, labeled by stage and outcome.
pub const METRIC_STAGE_RECORDS_TOTAL: &str = "fundflow_stage_records_total";
/// Per-stage processing latency.
pub const METRIC_STAGE_LATENCY_SECONDS: &str = "fundflow_stage_latency_seconds";
/// Records shed by the router, labeled by tier.
pub const METRIC_ROUTER_SHED_TOTAL: &str = "fundflow_router_shed_total";
/// Breaker open/close transitions, labeled by collector and transition.
pub const METRIC_BREAKER_TRANSITIONS_TOTAL: &str = "fundflow_breaker_transitions_total";
/// Scrape requests by terminal status.
pub const METRIC_SCRAPE_REQUESTS_TOTAL: &str = "fundflow_scrape_requests_total";
/// Dedup verdicts, labeled by verdict.
pub const METRIC_DEDUP_VERDICTS_TOTAL: &str = "fundflow_dedup_verdicts_total";
/// Candidates dead-lettered, labeled by stage.
pub const METRIC_DEAD_LETTER_TOTAL: &str = "fundflow_dead_letter_total";

/// Register a labeled counter in the default registry, falling back to an
/// unregistered metric when the name is already taken.
#[must_use]
pub fn counter_vec(opts: Opts, labels: &[&str]) -> CounterVec {
    let fallback_opts = opts.clone();
    let metric = CounterVec::new(opts, labels).expect("valid counter opts");
    match prometheus::default_registry().register(Box::new(metric.clone())) {
        Ok(()) => metric,
        Err(e) => {
            warn!(metric = %fallback_opts.name, error = %e, "metric already registered; using unregistered fallback");
            metric
        }
    }
}

/// Register a labeled histogram in the default registry, falling back to an
/// unregistered metric when the name is already taken.
#[must_use]
pub fn histogram_vec(opts: HistogramOpts, labels: &[&str]) -> HistogramVec {
    let name = opts.common_opts.name.clone();
    let metric = HistogramVec::new(opts, labels).expect("valid histogram opts");
    match prometheus::default_registry().register(Box::new(metric.clone())) {
        Ok(()) => metric,
        Err(e) => {
            warn!(metric = %name, error = %e, "metric already registered; using unregistered fallback");
            metric
        }
    }
}

/// Records entering each stage, by stage and outcome.
pub static STAGE_RECORDS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(
            METRIC_STAGE_RECORDS_TOTAL,
            "Records processed per pipeline stage",
        ),
        &["stage", "outcome"],
    )
});

/// Per-stage latency histogram.
pub static STAGE_LATENCY_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    histogram_vec(
        HistogramOpts::new(
            METRIC_STAGE_LATENCY_SECONDS,
            "Per-stage processing latency in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0,
        ]),
        &["stage"],
    )
});

/// Records shed by the router under backpressure.
pub static ROUTER_SHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(
            METRIC_ROUTER_SHED_TOTAL,
            "Records shed by the router due to backpressure or open breakers",
        ),
        &["tier", "reason"],
    )
});

/// Breaker transitions per collector.
pub static BREAKER_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(
            METRIC_BREAKER_TRANSITIONS_TOTAL,
            "Circuit breaker open/close transitions",
        ),
        &["collector", "transition"],
    )
});

/// Scrape requests by terminal status.
pub static SCRAPE_REQUESTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(
            METRIC_SCRAPE_REQUESTS_TOTAL,
            "Scrape requests by terminal status",
        ),
        &["status"],
    )
});

/// Dedup verdicts by kind.
pub static DEDUP_VERDICTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(METRIC_DEDUP_VERDICTS_TOTAL, "Deduplication verdicts"),
        &["verdict"],
    )
});

/// Dead-lettered candidates by stage.
pub static DEAD_LETTER_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    counter_vec(
        Opts::new(
            METRIC_DEAD_LETTER_TOTAL,
            "Candidates written to the dead-letter sink",
        ),
        &["stage"],
    )
});
