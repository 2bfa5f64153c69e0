// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Token-bucket admission and failure-counting circuit breakers.
//!
//! One bucket + breaker pair guards each collector's intake; the scrape
//! workers reuse the same bucket shape keyed by request hostname for
//! per-domain politeness.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::config::BreakerConfig;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// Whether the request may proceed
    pub allowed: bool,
    /// When denied: how long until a retry has a chance of succeeding
    pub wait_hint: Option<Duration>,
}

impl Admission {
    fn granted() -> Self {
        Self {
            allowed: true,
            wait_hint: None,
        }
    }

    fn denied(wait_hint: Duration) -> Self {
        Self {
            allowed: false,
            wait_hint: Some(wait_hint),
        }
    }
}

/// Token bucket: capacity = per-minute quota, refill = quota/60 per second.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    /// Bucket sized for a per-minute quota, starting full.
    #[must_use]
    pub fn per_minute(quota: u64) -> Self {
        Self::new(quota, quota as f64 / 60.0)
    }

    /// Bucket with explicit capacity and refill rate (tokens/second).
    #[must_use]
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        let refill_rate = if refill_rate.is_finite() && refill_rate >= 0.0 {
            refill_rate
        } else {
            0.0
        };
        Self {
            capacity,
            tokens: capacity as f64, // Start full
            last_refill: Instant::now(),
            refill_rate,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let updated = self.tokens + elapsed * self.refill_rate;
        self.tokens = updated.clamp(0.0, self.capacity as f64);
        self.last_refill = now;
    }

    /// Consume one token if available.
    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token will be available.
    #[must_use]
    pub fn time_to_next_token(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 || self.refill_rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
    }

    /// Tokens currently available.
    #[must_use]
    pub fn available(&mut self) -> u64 {
        self.refill();
        self.tokens as u64
    }
}

/// Breaker state, visible in health snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Admitting work
    Closed,
    /// Short-circuiting until the cool-down elapses
    Open,
    /// One probe admitted; its outcome decides open vs closed
    HalfOpen,
}

/// Failure-counting circuit breaker.
///
/// Opens on the Nth consecutive hard failure. After `cool_down` one probe
/// is admitted; Success closes the breaker and resets the cool-down,
/// HardFailure reopens it for twice the previous cool-down (capped).
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive_hard_failures: u32,
    state: BreakerState,
    open_until: Option<Instant>,
    base_cool_down: Duration,
    current_cool_down: Duration,
    max_cool_down: Duration,
    probe_inflight: bool,
    /// Operator override: `Some(true)` forces open, `Some(false)` forces closed.
    forced: Option<bool>,
}

impl CircuitBreaker {
    /// Breaker opening after `threshold` consecutive hard failures.
    #[must_use]
    pub fn new(threshold: u32, config: &BreakerConfig) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_hard_failures: 0,
            state: BreakerState::Closed,
            open_until: None,
            base_cool_down: config.cool_down,
            current_cool_down: config.cool_down,
            max_cool_down: config.max_cool_down,
            probe_inflight: false,
            forced: None,
        }
    }

    /// Current state, advancing Open -> HalfOpen when the cool-down has
    /// elapsed.
    pub fn state(&mut self) -> BreakerState {
        if let Some(forced_open) = self.forced {
            return if forced_open {
                BreakerState::Open
            } else {
                BreakerState::Closed
            };
        }
        if self.state == BreakerState::Open {
            if let Some(until) = self.open_until {
                if Instant::now() >= until {
                    self.state = BreakerState::HalfOpen;
                }
            }
        }
        self.state
    }

    /// True while the breaker refuses new work.
    pub fn is_open(&mut self) -> bool {
        self.state() == BreakerState::Open
    }

    /// Admission decision. In half-open state exactly one probe is allowed
    /// through; further requests are denied until the probe reports.
    pub fn check(&mut self) -> Admission {
        match self.state() {
            BreakerState::Closed => Admission::granted(),
            BreakerState::HalfOpen => {
                // Admit the single probe, then hold the line open-ish until
                // its outcome arrives.
                self.state = BreakerState::Open;
                self.open_until = Some(Instant::now() + self.current_cool_down);
                self.probe_inflight = true;
                Admission::granted()
            }
            BreakerState::Open => {
                let wait = self
                    .open_until
                    .map(|until| until.saturating_duration_since(Instant::now()))
                    .unwrap_or(self.current_cool_down);
                Admission::denied(wait)
            }
        }
    }

    /// Record a success. Closes the breaker and resets counters.
    pub fn record_success(&mut self) {
        self.consecutive_hard_failures = 0;
        self.state = BreakerState::Closed;
        self.open_until = None;
        self.current_cool_down = self.base_cool_down;
        self.probe_inflight = false;
    }

    /// Record a hard failure. Returns true if this failure opened (or
    /// reopened) the breaker.
    pub fn record_hard_failure(&mut self) -> bool {
        if self.probe_inflight {
            // Failed probe: reopen for double the cool-down, capped.
            self.probe_inflight = false;
            self.current_cool_down =
                (self.current_cool_down * 2).min(self.max_cool_down);
            self.state = BreakerState::Open;
            self.open_until = Some(Instant::now() + self.current_cool_down);
            return true;
        }
        self.consecutive_hard_failures = self.consecutive_hard_failures.saturating_add(1);
        if self.consecutive_hard_failures >= self.threshold
            && self.state == BreakerState::Closed
        {
            self.state = BreakerState::Open;
            self.open_until = Some(Instant::now() + self.current_cool_down);
            return true;
        }
        false
    }

    /// Record a soft failure: breaks the consecutive-hard-failure run
    /// without touching breaker state.
    pub fn record_soft_failure(&mut self) {
        self.consecutive_hard_failures = 0;
    }

    /// Decay one hard failure from the run (called by the registry's quiet
    /// period ticker).
    pub fn decay_failure(&mut self) {
        self.consecutive_hard_failures = self.consecutive_hard_failures.saturating_sub(1);
    }

    /// Operator override; `None` restores normal operation.
    pub fn force(&mut self, forced_open: Option<bool>) {
        self.forced = forced_open;
        if forced_open == Some(false) {
            self.record_success();
        }
    }

    /// Consecutive hard failures observed.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.consecutive_hard_failures
    }

    /// When the breaker will next admit a probe, if open.
    #[must_use]
    pub fn open_until(&self) -> Option<Instant> {
        self.open_until
    }
}

/// Per-hostname rate limiting for scrape workers, same bucket shape as
/// collector admission.
pub struct DomainRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    quota_per_minute: u64,
}

/// Maximum number of domains tracked before arbitrary pruning.
const MAX_DOMAIN_BUCKETS: usize = 10_000;
/// Number of entries to prune when over capacity.
const PRUNE_BATCH: usize = 1000;

impl DomainRateLimiter {
    /// Limiter with a shared per-domain per-minute quota.
    #[must_use]
    pub fn new(quota_per_minute: u64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            quota_per_minute,
        }
    }

    /// Admission check for a hostname.
    pub fn try_acquire(&self, host: &str) -> Admission {
        let mut buckets = self.buckets.lock();
        if !buckets.contains_key(host) && buckets.len() >= MAX_DOMAIN_BUCKETS {
            let keys: Vec<String> = buckets.keys().take(PRUNE_BATCH).cloned().collect();
            for key in keys {
                buckets.remove(&key);
            }
        }
        let bucket = buckets
            .entry(host.to_string())
            .or_insert_with(|| TokenBucket::per_minute(self.quota_per_minute));
        if bucket.try_consume() {
            Admission::granted()
        } else {
            Admission::denied(bucket.time_to_next_token())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            threshold,
            &BreakerConfig {
                cool_down: Duration::from_millis(50),
                max_cool_down: Duration::from_millis(400),
            },
        )
    }

    #[test]
    fn test_token_bucket_consume_and_exhaust() {
        let mut bucket = TokenBucket::new(3, 0.0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[tokio::test]
    async fn test_token_bucket_refill() {
        let mut bucket = TokenBucket::new(100, 10.0);
        while bucket.try_consume() {}
        tokio::time::sleep(Duration::from_secs(1)).await;
        let available = bucket.available();
        assert!(
            (9..=11).contains(&available),
            "expected ~10 tokens, got {available}"
        );
    }

    #[test]
    fn test_per_minute_quota_shape() {
        let mut bucket = TokenBucket::per_minute(60);
        assert_eq!(bucket.available(), 60);
    }

    #[test]
    fn test_breaker_opens_on_nth_failure_not_before() {
        let mut b = breaker(3);
        assert!(!b.record_hard_failure());
        assert!(!b.record_hard_failure());
        assert!(!b.is_open());
        assert!(b.record_hard_failure());
        assert!(b.is_open());
    }

    #[test]
    fn test_soft_failure_resets_consecutive_run() {
        let mut b = breaker(3);
        b.record_hard_failure();
        b.record_hard_failure();
        b.record_soft_failure();
        assert!(!b.record_hard_failure());
        assert!(!b.is_open());
    }

    #[test]
    fn test_open_breaker_denies_with_wait_hint() {
        let mut b = breaker(1);
        b.record_hard_failure();
        let admission = b.check();
        assert!(!admission.allowed);
        assert!(admission.wait_hint.is_some());
    }

    #[tokio::test]
    async fn test_half_open_probe_success_closes() {
        let mut b = breaker(1);
        b.record_hard_failure();
        assert!(!b.check().allowed);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // One probe is admitted after the cool-down...
        assert!(b.check().allowed);
        // ...but only one.
        assert!(!b.check().allowed);

        b.record_success();
        assert!(b.check().allowed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_probe_doubles_cool_down_with_cap() {
        let mut b = breaker(1);
        b.record_hard_failure();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(b.check().allowed); // probe
        b.record_hard_failure(); // probe fails

        // Reopened for 100ms now; not yet half-open at 60ms.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!b.check().allowed);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(b.check().allowed);

        // Cap: repeated failed probes never exceed max_cool_down.
        for _ in 0..5 {
            b.record_hard_failure();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(b.current_cool_down <= Duration::from_millis(400));
    }

    #[test]
    fn test_force_open_and_restore() {
        let mut b = breaker(5);
        b.force(Some(true));
        assert!(!b.check().allowed);
        b.force(None);
        assert!(b.check().allowed);
    }

    #[test]
    fn test_domain_limiter_isolates_hosts() {
        let limiter = DomainRateLimiter::new(2);
        assert!(limiter.try_acquire("a.example").allowed);
        assert!(limiter.try_acquire("a.example").allowed);
        assert!(!limiter.try_acquire("a.example").allowed);
        assert!(limiter.try_acquire("b.example").allowed);
    }
}
