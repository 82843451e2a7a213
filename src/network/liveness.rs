//! Presumed-dead inference from consecutive send failures.
//!
//! Advisory only: a notification does not close connections or blacklist the
//! peer. Whoever owns membership decides what to do with it.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::types::PkiId;

const NOTIFICATION_CAPACITY: usize = 1024;

struct FailureRecord {
    count: u32,
    window_start: Instant,
    reported: bool,
}

pub struct LivenessMonitor {
    threshold: u32,
    window: Duration,
    failures: DashMap<PkiId, FailureRecord>,
    notifier: broadcast::Sender<PkiId>,
}

impl LivenessMonitor {
    pub fn new(threshold: u32, window: Duration) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            threshold: threshold.max(1),
            window,
            failures: DashMap::new(),
            notifier,
        }
    }

    /// Stream of PKI-IDs presumed dead. Only notifications raised after
    /// subscribing are observed.
    pub fn subscribe(&self) -> broadcast::Receiver<PkiId> {
        self.notifier.subscribe()
    }

    /// Records a failed send. Returns true if this failure crossed the
    /// threshold and a notification was published.
    pub fn record_failure(&self, pki_id: &PkiId, reason: &str) -> bool {
        let now = Instant::now();
        let mut record = self
            .failures
            .entry(pki_id.clone())
            .or_insert(FailureRecord {
                count: 0,
                window_start: now,
                reported: false,
            });

        // Failures spread wider than the window don't add up
        if now.duration_since(record.window_start) > self.window {
            record.count = 0;
            record.window_start = now;
        }
        record.count += 1;

        tracing::debug!(
            "⚠️  Send failure #{} to {}: {}",
            record.count,
            pki_id,
            reason
        );

        if record.count >= self.threshold && !record.reported {
            record.reported = true;
            let count = record.count;
            drop(record);
            tracing::warn!(
                "💀 Peer {} presumed dead after {} consecutive failures",
                pki_id,
                count
            );
            // No subscribers is fine
            let _ = self.notifier.send(pki_id.clone());
            return true;
        }
        false
    }

    pub fn record_success(&self, pki_id: &PkiId) {
        if self.failures.remove(pki_id).is_some() {
            tracing::debug!("✅ Peer {} reachable again", pki_id);
        }
    }

    pub fn failure_count(&self, pki_id: &PkiId) -> u32 {
        self.failures.get(pki_id).map(|r| r.count).unwrap_or(0)
    }

    pub fn reset(&self) {
        self.failures.clear();
    }
}
