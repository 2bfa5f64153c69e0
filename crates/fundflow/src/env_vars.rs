//! Centralized environment variable names and helpers for FundFlow.
//!
//! Keeps configuration naming consistent across binaries and crates; every
//! config struct's `from_env()` reads through these constants rather than
//! scattering string literals.

// =============================================================================
// Environment Variable Name Constants
// =============================================================================

/// Path to the SQLite database backing the scrape/review/dead-letter queues.
pub const FUNDFLOW_QUEUE_DB_PATH: &str = "FUNDFLOW_QUEUE_DB_PATH";
/// Scrape worker pool size (default: 4).
pub const FUNDFLOW_SCRAPE_WORKERS: &str = "FUNDFLOW_SCRAPE_WORKERS";
/// Per-tier router queue capacity (default: 256).
pub const FUNDFLOW_ROUTER_CAPACITY: &str = "FUNDFLOW_ROUTER_CAPACITY";
/// Classifier enrichment threshold in [0,1] (default: 0.5).
pub const FUNDFLOW_ENRICHMENT_THRESHOLD: &str = "FUNDFLOW_ENRICHMENT_THRESHOLD";
/// Classifier enrichment timeout in seconds (default: 600).
pub const FUNDFLOW_ENRICHMENT_TIMEOUT_SECS: &str = "FUNDFLOW_ENRICHMENT_TIMEOUT_SECS";
/// Hard duplicate threshold (default: 0.90).
pub const FUNDFLOW_DEDUP_HARD_THRESHOLD: &str = "FUNDFLOW_DEDUP_HARD_THRESHOLD";
/// Likely-duplicate floor (default: 0.75).
pub const FUNDFLOW_DEDUP_LIKELY_FLOOR: &str = "FUNDFLOW_DEDUP_LIKELY_FLOOR";
/// Validator auto-approve threshold (default: 0.85).
pub const FUNDFLOW_AUTO_APPROVE: &str = "FUNDFLOW_AUTO_APPROVE";
/// Validator review floor (default: 0.65).
pub const FUNDFLOW_REVIEW_FLOOR: &str = "FUNDFLOW_REVIEW_FLOOR";
/// Circuit breaker cool-down in seconds (default: 60).
pub const FUNDFLOW_BREAKER_COOL_DOWN_SECS: &str = "FUNDFLOW_BREAKER_COOL_DOWN_SECS";
/// Operator control endpoint bind address (default: 127.0.0.1:8920).
pub const FUNDFLOW_ADMIN_ADDR: &str = "FUNDFLOW_ADMIN_ADDR";
/// User agent for outbound HTTP fetches.
pub const FUNDFLOW_USER_AGENT: &str = "FUNDFLOW_USER_AGENT";

// =============================================================================
// Typed helpers
// =============================================================================

/// Reads an environment variable as a string, returning `None` if unset.
#[must_use]
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Reads an environment variable as a string, returning `default` if unset.
#[must_use]
pub fn env_string_or_default(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reads an environment variable as a `usize`, returning `default` if unset or invalid.
#[must_use]
pub fn env_usize_or_default(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reads an environment variable as a `u64`, returning `default` if unset or invalid.
#[must_use]
pub fn env_u64_or_default(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Reads an environment variable as an `f64`, returning `default` if unset,
/// invalid, or non-finite.
#[must_use]
pub fn env_f64_or_default(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
