use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free producer counters
#[derive(Default)]
pub(crate) struct ProducerStats {
    pub(crate) records_sent: AtomicU64,
    pub(crate) records_delivered: AtomicU64,
    pub(crate) records_failed: AtomicU64,
    pub(crate) batches_sent: AtomicU64,
    pub(crate) retries: AtomicU64,
}

impl ProducerStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            records_sent: self.records_sent.load(Ordering::Relaxed),
            records_delivered: self.records_delivered.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Producer statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProducerStatsSnapshot {
    /// Records accepted by `send`
    pub records_sent: u64,
    /// Records resolved without error (including acks = 0 records)
    pub records_delivered: u64,
    /// Records resolved with an error
    pub records_failed: u64,
    /// Produce calls issued
    pub batches_sent: u64,
    /// Batches re-sent after a retriable failure
    pub retries: u64,
}

impl ProducerStatsSnapshot {
    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        if self.records_sent == 0 {
            1.0
        } else {
            self.records_delivered as f64 / self.records_sent as f64
        }
    }

    /// Get pending record count
    pub fn pending(&self) -> u64 {
        self.records_sent
            .saturating_sub(self.records_delivered + self.records_failed)
    }
}
