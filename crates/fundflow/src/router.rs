//! Ingestion router: tiered bounded queues between the collectors and the
//! classifier.
//!
//! Admission is gated on the originating collector's circuit breaker and on
//! tier capacity; anything else is shed back to the producer with a
//! backpressure hint rather than buffered unboundedly. Dispatch always
//! drains high before normal before low, FIFO within a tier.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::health::SourceHealthRegistry;
use crate::metrics;
use crate::record::{CandidateRecord, Priority};

/// Producer-side handle given to collectors (and to the publisher for
/// requeues). Cheap to clone.
#[derive(Clone)]
pub struct RouterHandle {
    tx_high: mpsc::Sender<CandidateRecord>,
    tx_normal: mpsc::Sender<CandidateRecord>,
    tx_low: mpsc::Sender<CandidateRecord>,
    health: Arc<SourceHealthRegistry>,
    backpressure: watch::Sender<bool>,
}

impl RouterHandle {
    /// Submit a record for dispatch.
    ///
    /// Returns [`Error::BreakerOpen`] when the collector's breaker refuses
    /// intake and [`Error::QueueFull`] when the tier is at capacity; both
    /// are backpressure signals, not failures to log.
    pub fn submit(&self, record: CandidateRecord) -> Result<()> {
        if self.health.breaker_open(record.collector) {
            let snapshot = self.health.snapshot(record.collector);
            let wait_hint = snapshot
                .breaker_open_for_secs
                .map_or(Duration::from_secs(60), Duration::from_secs);
            metrics::ROUTER_SHED_TOTAL
                .with_label_values(&[record.priority.as_str(), "breaker_open"])
                .inc();
            return Err(Error::BreakerOpen {
                collector: record.collector.as_str().to_string(),
                wait_hint,
            });
        }

        let tier = record.priority;
        let tx = self.tier_sender(tier);
        match tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::ROUTER_SHED_TOTAL
                    .with_label_values(&[tier.as_str(), "queue_full"])
                    .inc();
                // Ask producers to slow down; cleared by the dispatcher once
                // capacity returns.
                let _ = self.backpressure.send(true);
                Err(Error::QueueFull { tier })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::InternalInvariant(
                "router dispatcher has shut down".to_string(),
            )),
        }
    }

    /// Subscribe to the router's suspend hint. `true` means "please slow
    /// down"; collectors should pause polling until it clears.
    #[must_use]
    pub fn suspend_hint(&self) -> watch::Receiver<bool> {
        self.backpressure.subscribe()
    }

    fn tier_sender(&self, tier: Priority) -> &mpsc::Sender<CandidateRecord> {
        match tier {
            Priority::High => &self.tx_high,
            Priority::Normal => &self.tx_normal,
            Priority::Low => &self.tx_low,
        }
    }
}

/// Consumer side: drains the tiers into the downstream stage.
pub struct RouterDispatcher {
    rx_high: mpsc::Receiver<CandidateRecord>,
    rx_normal: mpsc::Receiver<CandidateRecord>,
    rx_low: mpsc::Receiver<CandidateRecord>,
    tx_high: mpsc::Sender<CandidateRecord>,
    tx_normal: mpsc::Sender<CandidateRecord>,
    tx_low: mpsc::Sender<CandidateRecord>,
    tier_capacity: usize,
    backpressure: watch::Sender<bool>,
}

/// Build the router's handle/dispatcher pair.
#[must_use]
pub fn channel(
    config: &RouterConfig,
    health: Arc<SourceHealthRegistry>,
) -> (RouterHandle, RouterDispatcher) {
    let (tx_high, rx_high) = mpsc::channel(config.tier_capacity);
    let (tx_normal, rx_normal) = mpsc::channel(config.tier_capacity);
    let (tx_low, rx_low) = mpsc::channel(config.tier_capacity);
    let (backpressure, _) = watch::channel(false);

    let handle = RouterHandle {
        tx_high: tx_high.clone(),
        tx_normal: tx_normal.clone(),
        tx_low: tx_low.clone(),
        health,
        backpressure: backpressure.clone(),
    };
    let dispatcher = RouterDispatcher {
        rx_high,
        rx_normal,
        rx_low,
        tx_high,
        tx_normal,
        tx_low,
        tier_capacity: config.tier_capacity,
        backpressure,
    };
    (handle, dispatcher)
}

impl RouterDispatcher {
    /// Run the dispatch loop, forwarding records into `out` until shutdown.
    ///
    /// The `biased` select re-polls high before normal before low on every
    /// iteration, which is what gives strict tier priority; within a tier
    /// the mpsc channel preserves FIFO order.
    pub async fn run(
        mut self,
        out: mpsc::Sender<CandidateRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("router dispatcher shutting down");
                        break;
                    }
                }
                Some(record) = self.rx_high.recv() => {
                    self.forward(record, &out).await;
                }
                Some(record) = self.rx_normal.recv() => {
                    self.forward(record, &out).await;
                }
                Some(record) = self.rx_low.recv() => {
                    self.forward(record, &out).await;
                }
                else => break,
            }
        }
    }

    async fn forward(&self, record: CandidateRecord, out: &mpsc::Sender<CandidateRecord>) {
        debug!(
            content_hash = %record.content_hash,
            collector = %record.collector,
            priority = record.priority.as_str(),
            "routing record"
        );
        metrics::STAGE_RECORDS_TOTAL
            .with_label_values(&["router", "forwarded"])
            .inc();
        if out.send(record).await.is_err() {
            warn!("downstream stage closed; dropping routed record");
        }
        self.maybe_clear_backpressure();
    }

    /// Clear the suspend hint once every tier has drained to at least half
    /// capacity.
    fn maybe_clear_backpressure(&self) {
        if !*self.backpressure.borrow() {
            return;
        }
        let half = self.tier_capacity / 2;
        let relaxed = self.tx_high.capacity() >= half
            && self.tx_normal.capacity() >= half
            && self.tx_low.capacity() >= half;
        if relaxed {
            let _ = self.backpressure.send(false);
        }
    }
}
