use crate::completion::Completer;
use crate::error::DeliveryError;
use crate::record::{RecordMetadata, SerializedRecord, TopicPartition, UNACKNOWLEDGED_OFFSET};
use crate::Error;
use std::time::{Duration, Instant};
use tracing::error;

/// A batch of records for a single topic-partition
///
/// Records and completers are kept in parallel vectors so the record slice can
/// be handed to the connector while the completers stay with the batch.
pub struct RecordBatch {
    tp: TopicPartition,
    records: Vec<SerializedRecord>,
    completers: Vec<Completer>,
    byte_size: usize,
    created_at: Instant,
    sealed: bool,
    attempts: u32,
    /// Set when the batch waits out a retry backoff
    retry_at: Option<Instant>,
}

impl RecordBatch {
    pub fn new(tp: TopicPartition, now: Instant) -> Self {
        Self {
            tp,
            records: Vec::new(),
            completers: Vec::new(),
            byte_size: 0,
            created_at: now,
            sealed: false,
            attempts: 0,
            retry_at: None,
        }
    }

    /// Whether `record_size` more bytes fit under both limits
    ///
    /// An empty batch always accepts, so an oversized record still gets sent.
    pub fn has_room_for(&self, record_size: usize, batch_size: usize, max_bytes: usize) -> bool {
        if self.sealed {
            return false;
        }
        if self.records.is_empty() {
            return true;
        }
        self.records.len() < batch_size && self.byte_size + record_size <= max_bytes
    }

    pub fn add(&mut self, record: SerializedRecord, completer: Completer) {
        self.byte_size += record.size();
        self.records.push(record);
        self.completers.push(completer);
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    #[cfg(test)]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Ready when sealed, lingered long enough, or the producer is closing
    ///
    /// A batch waiting out a retry backoff is never ready before `retry_at`,
    /// except when closing.
    pub fn is_ready(&self, now: Instant, linger: Duration, closing: bool) -> bool {
        if self.is_empty() {
            return false;
        }
        if closing {
            return true;
        }
        if let Some(retry_at) = self.retry_at {
            return now >= retry_at;
        }
        self.sealed || now.saturating_duration_since(self.created_at) >= linger
    }

    /// Instant at which this batch becomes ready without further appends
    pub fn ready_at(&self, linger: Duration) -> Instant {
        self.retry_at.unwrap_or(self.created_at + linger)
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn records(&self) -> &[SerializedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[cfg(test)]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[cfg(test)]
    pub(crate) fn all_resolved(&self) -> bool {
        self.completers.iter().all(Completer::is_resolved)
    }

    /// Record a failed attempt and hold the batch back until `retry_at`
    pub(crate) fn schedule_retry(&mut self, retry_at: Instant) {
        self.attempts += 1;
        self.retry_at = Some(retry_at);
        self.sealed = true;
    }

    /// Resolve record `i` with offset `base_offset + i`
    pub fn complete_acknowledged(&mut self, base_offset: i64, log_append_time: Option<i64>) {
        let tp = self.tp.clone();
        self.resolve_each(|i, record| {
            let timestamp = log_append_time.unwrap_or(record.timestamp);
            RecordMetadata::delivered(&tp, base_offset + i as i64, timestamp)
        });
    }

    /// Resolve every record with the acks = 0 sentinel offset
    pub fn complete_unacknowledged(&mut self) {
        let tp = self.tp.clone();
        self.resolve_each(|_, record| {
            RecordMetadata::delivered(&tp, UNACKNOWLEDGED_OFFSET, record.timestamp)
        });
    }

    /// Resolve every record with the same error
    pub fn fail_all(&mut self, err: DeliveryError) {
        let tp = self.tp.clone();
        self.resolve_each(|_, record| RecordMetadata::failed(&tp, record.timestamp, err.clone()));
    }

    fn resolve_each<F>(&mut self, mut metadata_for: F)
    where
        F: FnMut(usize, &SerializedRecord) -> RecordMetadata,
    {
        for (i, (record, completer)) in self
            .records
            .iter()
            .zip(self.completers.iter_mut())
            .enumerate()
        {
            if let Err(e) = completer.complete(metadata_for(i, record)) {
                report_violation(&self.tp, i, e);
            }
        }
    }
}

fn report_violation(tp: &TopicPartition, index: usize, e: Error) {
    error!(topic_partition = %tp, index, "completion invariant violated: {}", e);
    debug_assert!(false, "record {} of {} resolved twice", index, tp);
}

impl std::fmt::Debug for RecordBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBatch")
            .field("topic_partition", &self.tp)
            .field("records", &self.records.len())
            .field("byte_size", &self.byte_size)
            .field("sealed", &self.sealed)
            .field("attempts", &self.attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{completion_pair, CompletionHandle, PendingTracker};
    use crate::error::BrokerError;
    use bytes::Bytes;
    use std::sync::Arc;

    fn push(batch: &mut RecordBatch, tracker: &Arc<PendingTracker>, value: &str) -> CompletionHandle {
        let record = SerializedRecord::new(
            Some(Bytes::from("key")),
            Some(Bytes::from(value.to_string())),
        );
        let (completer, handle) = completion_pair(
            batch.topic_partition().clone(),
            record.timestamp,
            Arc::clone(tracker),
        );
        batch.add(record, completer);
        handle
    }

    #[test]
    fn test_record_batch() {
        let tracker = Arc::new(PendingTracker::new());
        let mut batch = RecordBatch::new(TopicPartition::new("test-topic", 0), Instant::now());
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);

        let _h = push(&mut batch, &tracker, "value");

        assert!(!batch.is_empty());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.byte_size(), 8); // "key" + "value"
    }

    #[test]
    fn test_has_room_for() {
        let tracker = Arc::new(PendingTracker::new());
        let mut batch = RecordBatch::new(TopicPartition::new("t", 0), Instant::now());

        // empty batch accepts oversized records
        assert!(batch.has_room_for(10_000, 2, 16));

        let _h1 = push(&mut batch, &tracker, "v1");
        assert!(batch.has_room_for(5, 2, 16));
        assert!(!batch.has_room_for(12, 2, 16));

        let _h2 = push(&mut batch, &tracker, "v2");
        assert!(!batch.has_room_for(1, 2, 16));

        let mut sealed = RecordBatch::new(TopicPartition::new("t", 0), Instant::now());
        sealed.seal();
        assert!(!sealed.has_room_for(1, 100, 100));
    }

    #[test]
    fn test_readiness() {
        let tracker = Arc::new(PendingTracker::new());
        let start = Instant::now();
        let linger = Duration::from_millis(500);
        let mut batch = RecordBatch::new(TopicPartition::new("t", 0), start);

        // empty batches are never ready
        assert!(!batch.is_ready(start + linger, linger, true));

        let _h = push(&mut batch, &tracker, "v");
        assert!(!batch.is_ready(start, linger, false));
        assert!(batch.is_ready(start, linger, true));
        assert!(batch.is_ready(start + linger, linger, false));
        assert_eq!(batch.ready_at(linger), start + linger);

        batch.seal();
        assert!(batch.is_ready(start, linger, false));
    }

    #[test]
    fn test_retry_backoff_holds_batch() {
        let tracker = Arc::new(PendingTracker::new());
        let start = Instant::now();
        let mut batch = RecordBatch::new(TopicPartition::new("t", 0), start);
        let _h = push(&mut batch, &tracker, "v");

        let retry_at = start + Duration::from_millis(100);
        batch.schedule_retry(retry_at);
        assert_eq!(batch.attempts(), 1);
        assert!(!batch.is_ready(start, Duration::ZERO, false));
        assert!(batch.is_ready(retry_at, Duration::ZERO, false));
        assert!(batch.is_ready(start, Duration::ZERO, true));
        assert_eq!(batch.ready_at(Duration::ZERO), retry_at);
    }

    #[tokio::test]
    async fn test_complete_acknowledged_assigns_sequential_offsets() {
        let tracker = Arc::new(PendingTracker::new());
        let mut batch = RecordBatch::new(TopicPartition::new("t", 3), Instant::now());
        let handles: Vec<_> = (0..3).map(|i| push(&mut batch, &tracker, &i.to_string())).collect();

        batch.complete_acknowledged(100, Some(7));
        assert!(batch.all_resolved());

        for (i, handle) in handles.into_iter().enumerate() {
            let metadata = handle.await;
            assert_eq!(metadata.offset, 100 + i as i64);
            assert_eq!(metadata.partition, 3);
            assert_eq!(metadata.timestamp, 7);
        }
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_shares_error() {
        let tracker = Arc::new(PendingTracker::new());
        let mut batch = RecordBatch::new(TopicPartition::new("t", 0), Instant::now());
        let h1 = push(&mut batch, &tracker, "a");
        let h2 = push(&mut batch, &tracker, "b");
        assert!(!batch.all_resolved());

        batch.fail_all(BrokerError::MessageTooLarge.into());

        let expected = Some(DeliveryError::Broker(BrokerError::MessageTooLarge));
        assert_eq!(h1.await.error, expected);
        assert_eq!(h2.await.error, expected);
    }

    #[tokio::test]
    async fn test_complete_unacknowledged() {
        let tracker = Arc::new(PendingTracker::new());
        let mut batch = RecordBatch::new(TopicPartition::new("t", 0), Instant::now());
        let handle = push(&mut batch, &tracker, "a");

        batch.complete_unacknowledged();
        let metadata = handle.await;
        assert_eq!(metadata.offset, UNACKNOWLEDGED_OFFSET);
        assert!(metadata.is_ok());
    }
}
