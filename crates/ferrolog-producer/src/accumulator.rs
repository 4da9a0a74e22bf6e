//! Per-partition record accumulation
//!
//! The accumulator keeps one FIFO of [`RecordBatch`]es per topic-partition.
//! Appends only ever touch the last batch of their own partition; the sender
//! only ever takes the first. Each partition queue sits behind its own mutex
//! in a concurrent map, so unrelated partitions never contend.
//!
//! # Readiness
//!
//! The front batch of a partition is drained when it is sealed (full), when it
//! has lingered for `linger`, or while a flush or close forces it out. A partition
//! with a batch in flight is skipped until the sender calls
//! [`complete`](RecordAccumulator::complete), which is what keeps batches of
//! one partition strictly ordered on the wire.

use crate::batch::RecordBatch;
use crate::completion::{completion_pair, Completer, CompletionHandle, PendingTracker};
use crate::error::DeliveryError;
use crate::record::{SerializedRecord, TopicPartition};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Default)]
struct PartitionQueue {
    batches: VecDeque<RecordBatch>,
    /// A batch of this partition is with the sender
    in_flight: bool,
}

/// Concurrent per-partition batch queues
pub struct RecordAccumulator {
    batch_size: usize,
    max_batch_bytes: usize,
    linger: Duration,
    /// Created lazily, never removed
    partitions: DashMap<TopicPartition, Arc<Mutex<PartitionQueue>>>,
    closing: AtomicBool,
    /// Number of `flush` calls currently forcing batches out
    flushing: AtomicUsize,
    tracker: Arc<PendingTracker>,
    /// Wakes the sender when a batch is created or sealed, or close begins
    wakeup: Notify,
}

impl RecordAccumulator {
    pub(crate) fn new(
        batch_size: usize,
        max_batch_bytes: usize,
        linger: Duration,
        tracker: Arc<PendingTracker>,
    ) -> Self {
        Self {
            batch_size,
            max_batch_bytes,
            linger,
            partitions: DashMap::new(),
            closing: AtomicBool::new(false),
            flushing: AtomicUsize::new(0),
            tracker,
            wakeup: Notify::new(),
        }
    }

    /// Add a record to its partition's open batch
    ///
    /// Seals the open batch first if the record would push it past
    /// `batch_size` records or `max_batch_bytes`. Never blocks on I/O.
    pub fn append(&self, tp: TopicPartition, record: SerializedRecord) -> CompletionHandle {
        let (completer, handle) = self.issue(tp.clone(), record.timestamp);
        self.append_with(tp, record, completer);
        handle
    }

    /// Register a not-yet-queued record with the pending count
    pub(crate) fn issue(
        &self,
        tp: TopicPartition,
        timestamp: i64,
    ) -> (Completer, CompletionHandle) {
        completion_pair(tp, timestamp, Arc::clone(&self.tracker))
    }

    /// [`append`](Self::append) for a record whose completer was issued earlier
    pub(crate) fn append_with(
        &self,
        tp: TopicPartition,
        record: SerializedRecord,
        completer: Completer,
    ) {
        let queue = self.queue_for(&tp);
        let size = record.size();
        let mut wake = false;

        {
            let mut queue = queue.lock();
            let open = queue
                .batches
                .back_mut()
                .filter(|b| b.has_room_for(size, self.batch_size, self.max_batch_bytes));

            match open {
                Some(batch) => {
                    batch.add(record, completer);
                    if batch.len() >= self.batch_size {
                        batch.seal();
                        wake = true;
                    }
                }
                None => {
                    if let Some(last) = queue.batches.back_mut() {
                        last.seal();
                    }
                    let mut batch = RecordBatch::new(tp.clone(), Instant::now());
                    batch.add(record, completer);
                    if batch.len() >= self.batch_size {
                        batch.seal();
                    }
                    queue.batches.push_back(batch);
                    wake = true;
                }
            }
        }

        if wake {
            trace!(topic_partition = %tp, "batch created or sealed");
            self.wakeup.notify_one();
        }
    }

    /// Take the front batch of every partition that is ready and not in flight
    ///
    /// Drained partitions are marked in flight until [`complete`](Self::complete)
    /// or [`reenqueue`](Self::reenqueue) is called for them.
    pub fn drain_ready(&self, now: Instant) -> Vec<RecordBatch> {
        let forced = self.is_forced();
        let mut ready = Vec::new();

        for queue in self.queues() {
            let mut queue = queue.lock();
            if queue.in_flight {
                continue;
            }
            let front_ready = queue
                .batches
                .front()
                .is_some_and(|b| b.is_ready(now, self.linger, forced));
            if !front_ready {
                continue;
            }
            if let Some(mut batch) = queue.batches.pop_front() {
                batch.seal();
                queue.in_flight = true;
                ready.push(batch);
            }
        }
        ready
    }

    /// Time until the earliest queued batch becomes ready by linger or backoff
    ///
    /// `None` when nothing is queued outside in-flight partitions.
    pub fn next_ready_in(&self, now: Instant) -> Option<Duration> {
        let forced = self.is_forced();
        self.queues()
            .iter()
            .filter_map(|queue| {
                let queue = queue.lock();
                if queue.in_flight {
                    return None;
                }
                let front = queue.batches.front()?;
                if front.is_ready(now, self.linger, forced) {
                    Some(Duration::ZERO)
                } else {
                    Some(front.ready_at(self.linger).saturating_duration_since(now))
                }
            })
            .min()
    }

    /// Allow the next batch of `tp` to be drained
    pub fn complete(&self, tp: &TopicPartition) {
        if let Some(queue) = self.partitions.get(tp) {
            queue.lock().in_flight = false;
        }
    }

    /// Put a batch back at the front of its partition queue
    ///
    /// Used for retries; keeps the batch ahead of everything appended since.
    pub fn reenqueue(&self, batch: RecordBatch) {
        let queue = self.queue_for(batch.topic_partition());
        let mut queue = queue.lock();
        queue.batches.push_front(batch);
        queue.in_flight = false;
    }

    /// Force every queued batch to be ready regardless of size or age
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Treat every queued batch as ready until the matching [`end_flush`](Self::end_flush)
    pub fn begin_flush(&self) {
        self.flushing.fetch_add(1, Ordering::AcqRel);
        self.wakeup.notify_one();
    }

    pub fn end_flush(&self) {
        self.flushing.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_forced(&self) -> bool {
        self.is_closing() || self.flushing.load(Ordering::Acquire) > 0
    }

    /// Resolve every queued (not in-flight) record with `err`
    pub fn abort_all(&self, err: DeliveryError) -> usize {
        let mut aborted = 0;
        for queue in self.queues() {
            let batches: Vec<RecordBatch> = queue.lock().batches.drain(..).collect();
            for mut batch in batches {
                aborted += batch.len();
                batch.fail_all(err.clone());
            }
        }
        aborted
    }

    /// No queued batches and nothing in flight
    pub fn is_empty(&self) -> bool {
        self.queues().iter().all(|queue| {
            let queue = queue.lock();
            queue.batches.is_empty() && !queue.in_flight
        })
    }

    /// Number of batches waiting in the queue of `tp`
    #[cfg(test)]
    pub fn queued_batches(&self, tp: &TopicPartition) -> usize {
        self.partitions
            .get(tp)
            .map(|queue| queue.lock().batches.len())
            .unwrap_or(0)
    }

    /// Records accepted but not yet resolved, including in-flight ones
    #[cfg(test)]
    pub fn pending_records(&self) -> u64 {
        self.tracker.pending()
    }

    pub(crate) fn wakeup(&self) -> Notified<'_> {
        self.wakeup.notified()
    }

    /// Wake the sender for work that is not a batch yet
    pub(crate) fn wake_sender(&self) {
        self.wakeup.notify_one();
    }

    fn queue_for(&self, tp: &TopicPartition) -> Arc<Mutex<PartitionQueue>> {
        if let Some(queue) = self.partitions.get(tp) {
            return Arc::clone(queue.value());
        }
        Arc::clone(self.partitions.entry(tp.clone()).or_default().value())
    }

    /// Snapshot of the partition queues so no map shard stays locked while a
    /// partition mutex is held
    fn queues(&self) -> Vec<Arc<Mutex<PartitionQueue>>> {
        self.partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::thread;

    fn accumulator(batch_size: usize, linger: Duration) -> RecordAccumulator {
        RecordAccumulator::new(
            batch_size,
            1024 * 1024,
            linger,
            Arc::new(PendingTracker::new()),
        )
    }

    fn record(value: &str) -> SerializedRecord {
        SerializedRecord::new(None, Some(Bytes::from(value.to_string())))
    }

    fn value_of(record: &SerializedRecord) -> String {
        String::from_utf8(record.value.as_ref().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_append_seals_full_batches() {
        let acc = accumulator(3, Duration::from_secs(60));
        let tp = TopicPartition::new("t", 0);
        let _handles: Vec<_> = (0..7)
            .map(|i| acc.append(tp.clone(), record(&i.to_string())))
            .collect();

        // ceil(7 / 3) batches
        assert_eq!(acc.queued_batches(&tp), 3);
        assert_eq!(acc.pending_records(), 7);
    }

    #[test]
    fn test_byte_limit_seals_batch() {
        let acc = RecordAccumulator::new(
            100,
            10,
            Duration::from_secs(60),
            Arc::new(PendingTracker::new()),
        );
        let tp = TopicPartition::new("t", 0);
        let _a = acc.append(tp.clone(), record("123456"));
        let _b = acc.append(tp.clone(), record("123456"));
        assert_eq!(acc.queued_batches(&tp), 2);

        // the first batch was sealed by the overflow and is ready immediately
        let drained = acc.drain_ready(Instant::now());
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].len(), 1);
    }

    #[test]
    fn test_linger_gates_readiness() {
        let acc = accumulator(100, Duration::from_millis(500));
        let tp = TopicPartition::new("t", 0);
        let _h = acc.append(tp.clone(), record("a"));

        let now = Instant::now();
        assert!(acc.drain_ready(now).is_empty());
        let wait = acc.next_ready_in(now).unwrap();
        assert!(wait > Duration::from_millis(400) && wait <= Duration::from_millis(500));

        let drained = acc.drain_ready(now + Duration::from_millis(500));
        assert_eq!(drained.len(), 1);
    }

    #[test]
    fn test_zero_linger_is_ready_immediately() {
        let acc = accumulator(100, Duration::ZERO);
        let tp = TopicPartition::new("t", 0);
        let _h = acc.append(tp.clone(), record("a"));

        assert_eq!(acc.next_ready_in(Instant::now()), Some(Duration::ZERO));
        assert_eq!(acc.drain_ready(Instant::now()).len(), 1);
    }

    #[test]
    fn test_one_batch_in_flight_per_partition() {
        let acc = accumulator(1, Duration::ZERO);
        let tp = TopicPartition::new("t", 0);
        let _handles: Vec<_> = (0..3).map(|i| acc.append(tp.clone(), record(&i.to_string()))).collect();

        let first = acc.drain_ready(Instant::now());
        assert_eq!(first.len(), 1);
        assert_eq!(value_of(&first[0].records()[0]), "0");

        // partition is busy until complete() is called
        assert!(acc.drain_ready(Instant::now()).is_empty());
        assert_eq!(acc.next_ready_in(Instant::now()), None);

        acc.complete(&tp);
        let second = acc.drain_ready(Instant::now());
        assert_eq!(value_of(&second[0].records()[0]), "1");
    }

    #[test]
    fn test_partitions_drain_independently() {
        let acc = accumulator(1, Duration::ZERO);
        let _a = acc.append(TopicPartition::new("t", 0), record("a"));
        let _b = acc.append(TopicPartition::new("t", 1), record("b"));
        let _c = acc.append(TopicPartition::new("u", 0), record("c"));

        let mut drained: Vec<_> = acc
            .drain_ready(Instant::now())
            .iter()
            .map(|b| b.topic_partition().clone())
            .collect();
        drained.sort();
        assert_eq!(
            drained,
            vec![
                TopicPartition::new("t", 0),
                TopicPartition::new("t", 1),
                TopicPartition::new("u", 0)
            ]
        );
    }

    #[test]
    fn test_close_forces_flush() {
        let acc = accumulator(100, Duration::from_secs(3600));
        let tp = TopicPartition::new("t", 0);
        let _h = acc.append(tp.clone(), record("a"));
        assert!(acc.drain_ready(Instant::now()).is_empty());

        acc.begin_close();
        assert!(acc.is_closing());
        let drained = acc.drain_ready(Instant::now());
        assert_eq!(drained.len(), 1);
        assert!(drained[0].is_sealed());
        assert!(!acc.is_empty());

        acc.complete(&tp);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_flush_forces_lingering_batches() {
        let acc = accumulator(100, Duration::from_secs(3600));
        let _h = acc.append(TopicPartition::new("t", 0), record("a"));

        acc.begin_flush();
        assert_eq!(acc.drain_ready(Instant::now()).len(), 1);
        acc.end_flush();
        assert!(!acc.is_closing());

        let _h = acc.append(TopicPartition::new("t", 1), record("b"));
        assert!(acc.drain_ready(Instant::now()).is_empty());
    }

    #[test]
    fn test_reenqueue_goes_to_front() {
        let acc = accumulator(1, Duration::ZERO);
        let tp = TopicPartition::new("t", 0);
        let _h1 = acc.append(tp.clone(), record("first"));
        let _h2 = acc.append(tp.clone(), record("second"));

        let mut batch = acc.drain_ready(Instant::now()).pop().unwrap();
        batch.schedule_retry(Instant::now());
        acc.reenqueue(batch);

        let retried = acc.drain_ready(Instant::now());
        assert_eq!(value_of(&retried[0].records()[0]), "first");
        assert_eq!(retried[0].attempts(), 1);
    }

    #[tokio::test]
    async fn test_abort_all_resolves_queued_records() {
        let acc = accumulator(100, Duration::from_secs(60));
        let h1 = acc.append(TopicPartition::new("t", 0), record("a"));
        let h2 = acc.append(TopicPartition::new("t", 1), record("b"));

        assert_eq!(acc.abort_all(DeliveryError::FlushTimeout), 2);
        assert_eq!(h1.await.error, Some(DeliveryError::FlushTimeout));
        assert_eq!(h2.await.error, Some(DeliveryError::FlushTimeout));
        assert_eq!(acc.pending_records(), 0);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_concurrent_appends_keep_per_thread_order() {
        let acc = Arc::new(accumulator(16, Duration::ZERO));
        let tp = TopicPartition::new("t", 0);

        let workers: Vec<_> = (0..8)
            .map(|w| {
                let acc = Arc::clone(&acc);
                let tp = tp.clone();
                thread::spawn(move || {
                    (0..250)
                        .map(|i| acc.append(tp.clone(), record(&format!("{}-{}", w, i))))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let handles: Vec<_> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        assert_eq!(handles.len(), 2000);

        // drain everything in order and check each writer's records stay ordered
        let mut last_seen = [-1i64; 8];
        let mut total = 0;
        loop {
            let drained = acc.drain_ready(Instant::now());
            if drained.is_empty() {
                break;
            }
            for batch in drained {
                assert!(batch.len() <= 16);
                for r in batch.records() {
                    let value = value_of(r);
                    let (w, i) = value.split_once('-').unwrap();
                    let (w, i): (usize, i64) = (w.parse().unwrap(), i.parse().unwrap());
                    assert!(i > last_seen[w]);
                    last_seen[w] = i;
                    total += 1;
                }
                acc.complete(batch.topic_partition());
            }
        }
        assert_eq!(total, 2000);
    }
}
