use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;

/// Per-session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    sent: AtomicU64,
    dropped_args: AtomicU64,
    delivered_events: AtomicU64,
    delivered_lifecycle: AtomicU64,
}

impl SessionStats {
    pub fn record_sent(&self, dropped_args: usize) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.dropped_args
            .fetch_add(dropped_args as u64, Ordering::Relaxed);
    }

    pub fn record_event_delivery(&self) {
        self.delivered_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lifecycle_delivery(&self) {
        self.delivered_lifecycle.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, suppressed: u64) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            dropped_args: self.dropped_args.load(Ordering::Relaxed),
            delivered_events: self.delivered_events.load(Ordering::Relaxed),
            delivered_lifecycle: self.delivered_lifecycle.load(Ordering::Relaxed),
            suppressed,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Emit statements queued.
    pub sent: u64,
    /// Outbound arguments dropped by the marshaler.
    pub dropped_args: u64,
    /// Subscribed-event handler invocations.
    pub delivered_events: u64,
    /// Lifecycle observer invocations.
    pub delivered_lifecycle: u64,
    /// Deliveries discarded because the session had closed.
    pub suppressed: u64,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "sent": self.sent,
            "droppedArgs": self.dropped_args,
            "deliveredEvents": self.delivered_events,
            "deliveredLifecycle": self.delivered_lifecycle,
            "suppressed": self.suppressed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = SessionStats::default();
        stats.record_sent(0);
        stats.record_sent(2);
        stats.record_event_delivery();
        stats.record_lifecycle_delivery();
        stats.record_lifecycle_delivery();

        let snapshot = stats.snapshot(3);
        assert_eq!(
            snapshot,
            StatsSnapshot {
                sent: 2,
                dropped_args: 2,
                delivered_events: 1,
                delivered_lifecycle: 2,
                suppressed: 3,
            }
        );
        assert_eq!(snapshot.to_json()["droppedArgs"], 2);
    }
}
