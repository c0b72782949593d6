// Broker-wide statistics. Only the pending gauge gates behavior; the rest
// feed the operator surface and the metrics facade.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct BrokerCounters {
    received: AtomicU64,
    delivered: AtomicU64,
    fanout_complete: AtomicU64,
    advisory: AtomicU64,
    undeliverable: AtomicU64,
    discarded_monitoring: AtomicU64,
    no_messages: AtomicU64,
    backlog_deferred: AtomicU64,
    queue_backlog_hits: AtomicU64,
    // Messages admitted and not yet fully drained.
    pending: AtomicUsize,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub fanout_complete: u64,
    pub advisory: u64,
    pub undeliverable: u64,
    pub discarded_monitoring: u64,
    pub no_messages: u64,
    pub backlog_deferred: u64,
    pub queue_backlog_hits: u64,
    pub pending: usize,
}

impl BrokerCounters {
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn pending_inc(&self) {
        let now = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("courier_pending_messages").set(now as f64);
    }

    pub(crate) fn pending_dec(&self) {
        if let Ok(prev) =
            self.pending
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
        {
            metrics::gauge!("courier_pending_messages").set(prev.saturating_sub(1) as f64);
            self.fanout_complete.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("courier_fanout_complete_total").increment(1);
        }
    }

    pub(crate) fn received_inc(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_messages_received_total").increment(1);
    }

    pub(crate) fn delivered_add(&self, n: u64) {
        self.delivered.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("courier_messages_delivered_total").increment(n);
    }

    pub(crate) fn advisory_inc(&self) {
        self.advisory.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_advisory_messages_total").increment(1);
    }

    pub(crate) fn undeliverable_inc(&self) {
        self.undeliverable.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_undeliverable_total").increment(1);
    }

    pub(crate) fn discarded_monitoring_inc(&self) {
        self.discarded_monitoring.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_discarded_monitoring_total").increment(1);
    }

    pub(crate) fn no_messages_inc(&self) {
        self.no_messages.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_empty_polls_total").increment(1);
    }

    pub(crate) fn backlog_deferred_inc(&self) {
        self.backlog_deferred.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_backlog_deferred_total").increment(1);
    }

    pub(crate) fn queue_backlog_hit_inc(&self) {
        self.queue_backlog_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("courier_queue_backlog_hits_total").increment(1);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            fanout_complete: self.fanout_complete.load(Ordering::Relaxed),
            advisory: self.advisory.load(Ordering::Relaxed),
            undeliverable: self.undeliverable.load(Ordering::Relaxed),
            discarded_monitoring: self.discarded_monitoring.load(Ordering::Relaxed),
            no_messages: self.no_messages.load(Ordering::Relaxed),
            backlog_deferred: self.backlog_deferred.load(Ordering::Relaxed),
            queue_backlog_hits: self.queue_backlog_hits.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}
