//! Source Health Registry: per-collector status, rolling success rate,
//! quality score, circuit breaker and rate budget.
//!
//! Mutated by the collectors, the rate gate, the dedup engine and the
//! validator; every mutation for one collector is serialized behind that
//! collector's own mutex so an outcome report increments each counter at
//! most once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, RateLimitConfig};
use crate::metrics;
use crate::ratelimit::{Admission, CircuitBreaker, TokenBucket};
use crate::record::CollectorKind;

/// Width of the rolling success window.
const SUCCESS_RING_WIDTH: usize = 100;
/// EWMA smoothing factor for the quality score.
const QUALITY_ALPHA: f64 = 0.1;

/// Collector status as seen by the router and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceStatus {
    /// Healthy, admitting work
    Active,
    /// Elevated failure rate; still admitting
    Degraded,
    /// Breaker open or hard-failed
    Failed,
    /// Operator-paused
    Maintenance,
}

impl SourceStatus {
    /// Stable label for metrics and the admin API.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Degraded => "degraded",
            SourceStatus::Failed => "failed",
            SourceStatus::Maintenance => "maintenance",
        }
    }
}

/// Outcome of one unit of collector work, reported downstream.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Work completed; latency and an optional downstream quality hint
    Success {
        /// Wall time for the unit of work
        latency: Duration,
        /// Downstream validation quality in [0,1], when known
        quality_hint: Option<f64>,
    },
    /// Recoverable failure (fetch error, transient upstream)
    SoftFailure(String),
    /// Unrecoverable failure; counts toward the breaker
    HardFailure(String),
    /// Record was shed or refused (schema violation, rate limit)
    Rejected(String),
}

/// Point-in-time view of one collector's health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Collector id
    pub collector: String,
    /// Current status
    pub status: SourceStatus,
    /// Success rate over the rolling window, in [0,1]
    pub success_rate: f64,
    /// Mean latency over the rolling window, milliseconds
    pub avg_latency_ms: f64,
    /// EWMA quality score, in [0,1]
    pub quality_score: f64,
    /// Consecutive hard failures counted by the breaker
    pub breaker_failures: u32,
    /// Whether the breaker currently refuses work
    pub breaker_open: bool,
    /// Seconds until the next half-open probe, when open
    pub breaker_open_for_secs: Option<u64>,
    /// Rate-limit tokens remaining
    pub tokens_remaining: u64,
    /// When this snapshot was taken
    pub taken_at: DateTime<Utc>,
}

struct CollectorState {
    status: SourceStatus,
    ring: VecDeque<bool>,
    latencies_ms: VecDeque<f64>,
    quality_score: f64,
    breaker: CircuitBreaker,
    bucket: TokenBucket,
    last_failure_at: Option<Instant>,
}

impl CollectorState {
    fn new(kind: CollectorKind, breaker: &BreakerConfig, rate: &RateLimitConfig) -> Self {
        Self {
            status: SourceStatus::Active,
            ring: VecDeque::with_capacity(SUCCESS_RING_WIDTH),
            latencies_ms: VecDeque::with_capacity(SUCCESS_RING_WIDTH),
            quality_score: 0.5,
            breaker: CircuitBreaker::new(kind.breaker_threshold(), breaker),
            bucket: TokenBucket::per_minute(rate.quota_per_minute),
            last_failure_at: None,
        }
    }

    fn push_ring(&mut self, success: bool) {
        if self.ring.len() == SUCCESS_RING_WIDTH {
            self.ring.pop_front();
        }
        self.ring.push_back(success);
    }

    fn success_rate(&self) -> f64 {
        if self.ring.is_empty() {
            return 1.0;
        }
        let successes = self.ring.iter().filter(|s| **s).count();
        successes as f64 / self.ring.len() as f64
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64
    }

    fn derive_status(&mut self) {
        if self.status == SourceStatus::Maintenance {
            return; // operator override holds until cleared
        }
        self.status = if self.breaker.is_open() {
            SourceStatus::Failed
        } else if self.success_rate() < 0.5 {
            SourceStatus::Degraded
        } else {
            SourceStatus::Active
        };
    }
}

/// Registry of per-collector health state. Injected into every component
/// that reports or consults source health; never a static singleton.
pub struct SourceHealthRegistry {
    collectors: HashMap<CollectorKind, Mutex<CollectorState>>,
    breaker_quiet_period: Duration,
}

impl SourceHealthRegistry {
    /// Registry covering all four collectors.
    #[must_use]
    pub fn new(breaker: &BreakerConfig, rate: &RateLimitConfig) -> Self {
        let collectors = CollectorKind::ALL
            .into_iter()
            .map(|kind| (kind, Mutex::new(CollectorState::new(kind, breaker, rate))))
            .collect();
        Self {
            collectors,
            breaker_quiet_period: breaker.cool_down,
        }
    }

    fn state(&self, id: CollectorKind) -> &Mutex<CollectorState> {
        // The map is populated for every CollectorKind at construction.
        #[allow(clippy::unwrap_used)]
        self.collectors.get(&id).unwrap()
    }

    /// Point-in-time health snapshot for one collector.
    pub fn snapshot(&self, id: CollectorKind) -> HealthSnapshot {
        let mut state = self.state(id).lock();
        let breaker_open = state.breaker.is_open();
        let open_for = state
            .breaker
            .open_until()
            .map(|until| until.saturating_duration_since(Instant::now()).as_secs());
        HealthSnapshot {
            collector: id.as_str().to_string(),
            status: state.status,
            success_rate: state.success_rate(),
            avg_latency_ms: state.avg_latency_ms(),
            quality_score: state.quality_score,
            breaker_failures: state.breaker.failure_count(),
            breaker_open,
            breaker_open_for_secs: if breaker_open { open_for } else { None },
            tokens_remaining: state.bucket.available(),
            taken_at: Utc::now(),
        }
    }

    /// Snapshots for every collector.
    pub fn snapshot_all(&self) -> Vec<HealthSnapshot> {
        CollectorKind::ALL
            .into_iter()
            .map(|kind| self.snapshot(kind))
            .collect()
    }

    /// Record the outcome of one unit of work. Each counter moves at most
    /// once per call.
    pub fn record_outcome(&self, id: CollectorKind, outcome: &Outcome) {
        let mut state = self.state(id).lock();
        match outcome {
            Outcome::Success {
                latency,
                quality_hint,
            } => {
                state.push_ring(true);
                let ms = latency.as_secs_f64() * 1000.0;
                if state.latencies_ms.len() == SUCCESS_RING_WIDTH {
                    state.latencies_ms.pop_front();
                }
                state.latencies_ms.push_back(ms);
                if let Some(hint) = quality_hint {
                    let clamped = hint.clamp(0.0, 1.0);
                    state.quality_score =
                        QUALITY_ALPHA * clamped + (1.0 - QUALITY_ALPHA) * state.quality_score;
                }
                let was_open = state.breaker.is_open();
                state.breaker.record_success();
                if was_open {
                    info!(collector = %id, "circuit breaker closed after successful probe");
                    metrics::BREAKER_TRANSITIONS_TOTAL
                        .with_label_values(&[id.as_str(), "closed"])
                        .inc();
                }
            }
            Outcome::SoftFailure(reason) => {
                state.push_ring(false);
                state.breaker.record_soft_failure();
                state.last_failure_at = Some(Instant::now());
                debug!(collector = %id, reason = %reason, "soft failure recorded");
            }
            Outcome::HardFailure(reason) => {
                state.push_ring(false);
                state.last_failure_at = Some(Instant::now());
                let opened = state.breaker.record_hard_failure();
                if opened {
                    warn!(
                        collector = %id,
                        reason = %reason,
                        failures = state.breaker.failure_count(),
                        "circuit breaker opened"
                    );
                    metrics::BREAKER_TRANSITIONS_TOTAL
                        .with_label_values(&[id.as_str(), "opened"])
                        .inc();
                } else {
                    debug!(collector = %id, reason = %reason, "hard failure recorded");
                }
            }
            Outcome::Rejected(reason) => {
                // Rejections count against quality, not against the breaker.
                state.quality_score = (1.0 - QUALITY_ALPHA) * state.quality_score;
                debug!(collector = %id, reason = %reason, "record rejected");
            }
        }
        state.derive_status();
    }

    /// Operator status override (`Maintenance` pauses intake; `Active`
    /// clears the override).
    pub fn set_status(&self, id: CollectorKind, status: SourceStatus, reason: &str) {
        let mut state = self.state(id).lock();
        info!(collector = %id, status = status.as_str(), reason = %reason, "status set");
        state.status = status;
    }

    /// Combined breaker + token-bucket admission check for a collector.
    /// Breaker-open short-circuits without consuming a token; a half-open
    /// probe is admitted without consuming one either.
    pub fn try_acquire(&self, id: CollectorKind) -> Admission {
        let mut state = self.state(id).lock();
        if state.status == SourceStatus::Maintenance {
            return Admission {
                allowed: false,
                wait_hint: Some(self.breaker_quiet_period),
            };
        }
        let breaker_admission = state.breaker.check();
        if !breaker_admission.allowed {
            return breaker_admission;
        }
        if state.breaker.failure_count() >= 1 && state.breaker.is_open() {
            // Probe admitted by the breaker; skip the bucket.
            return breaker_admission;
        }
        if state.bucket.try_consume() {
            Admission {
                allowed: true,
                wait_hint: None,
            }
        } else {
            let hint = state.bucket.time_to_next_token();
            Admission {
                allowed: false,
                wait_hint: Some(hint),
            }
        }
    }

    /// True while the collector's breaker refuses work.
    pub fn breaker_open(&self, id: CollectorKind) -> bool {
        self.state(id).lock().breaker.is_open()
    }

    /// Operator override of the breaker; `None` restores normal operation.
    pub fn force_breaker(&self, id: CollectorKind, forced_open: Option<bool>) {
        let mut state = self.state(id).lock();
        warn!(collector = %id, forced = ?forced_open, "breaker forced by operator");
        state.breaker.force(forced_open);
        state.derive_status();
    }

    /// Spawn the background ticker that decays breaker failure counts after
    /// a quiet period. Runs until `shutdown` flips to true.
    pub fn spawn_decay_ticker(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let quiet = registry.breaker_quiet_period;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(quiet);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for kind in CollectorKind::ALL {
                            let mut state = registry.state(kind).lock();
                            let quiet_elapsed = state
                                .last_failure_at
                                .map_or(true, |at| at.elapsed() >= quiet);
                            if quiet_elapsed && state.breaker.failure_count() > 0 {
                                state.breaker.decay_failure();
                                debug!(collector = %kind, "breaker failure count decayed");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
