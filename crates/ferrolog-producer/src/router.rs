//! Topic to partition routing
//!
//! When a topic's partition count is cached, `send` picks the partition and
//! appends to the accumulator on the spot. Otherwise the record is parked,
//! still unpartitioned, in a per-topic backlog and the sender is woken to look
//! the topic up. While a topic has a backlog, later records for it queue
//! behind it, so one caller's records never overtake each other.
//!
//! A failed lookup fails the whole backlog through the records' handles.

use crate::accumulator::RecordAccumulator;
use crate::completion::{Completer, CompletionHandle};
use crate::connector::TopicMetadata;
use crate::error::{BrokerError, DeliveryError};
use crate::metadata::MetadataCache;
use crate::partitioner::Partitioner;
use crate::record::{SerializedRecord, TopicPartition};
use crate::stats::ProducerStats;
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Partition placeholder for records whose topic has not been looked up yet
const UNASSIGNED_PARTITION: i32 = -1;

struct Parked {
    /// Explicit partition, or one chosen while the count was cached
    partition: Option<i32>,
    record: SerializedRecord,
    completer: Completer,
}

#[derive(Default)]
struct Backlog {
    records: VecDeque<Parked>,
    /// A lookup task owns this topic
    resolving: bool,
}

pub(crate) struct RecordRouter {
    partitioner: Box<dyn Partitioner>,
    metadata: Arc<MetadataCache>,
    accumulator: Arc<RecordAccumulator>,
    stats: Arc<ProducerStats>,
    backlogs: DashMap<String, Backlog>,
}

impl RecordRouter {
    pub(crate) fn new(
        partitioner: Box<dyn Partitioner>,
        metadata: Arc<MetadataCache>,
        accumulator: Arc<RecordAccumulator>,
        stats: Arc<ProducerStats>,
    ) -> Self {
        Self {
            partitioner,
            metadata,
            accumulator,
            stats,
            backlogs: DashMap::new(),
        }
    }

    /// Queue a record for delivery without waiting on the connector
    ///
    /// Rejects an explicit partition synchronously only when the topic's
    /// partition count is already cached.
    pub(crate) fn route(
        &self,
        topic: String,
        explicit: Option<i32>,
        record: SerializedRecord,
    ) -> Result<CompletionHandle> {
        let chosen = match self.metadata.cached(&topic) {
            Some(metadata) => Some(self.partitioner.partition(
                &topic,
                explicit,
                record.key.as_deref(),
                metadata.partition_count(),
            )?),
            None => None,
        };

        if let Some(mut backlog) = self.backlogs.get_mut(&topic) {
            let handle = self.park(&mut backlog, &topic, chosen.or(explicit), record);
            if !backlog.resolving {
                self.accumulator.wake_sender();
            }
            return Ok(handle);
        }

        match chosen {
            Some(partition) => Ok(self
                .accumulator
                .append(TopicPartition::new(topic, partition), record)),
            None => {
                let handle = {
                    let mut backlog = self.backlogs.entry(topic.clone()).or_default();
                    self.park(&mut backlog, &topic, explicit, record)
                };
                trace!(topic = %topic, "Topic metadata not cached, parking record");
                self.accumulator.wake_sender();
                Ok(handle)
            }
        }
    }

    fn park(
        &self,
        backlog: &mut Backlog,
        topic: &str,
        partition: Option<i32>,
        record: SerializedRecord,
    ) -> CompletionHandle {
        let tp = TopicPartition::new(topic, partition.unwrap_or(UNASSIGNED_PARTITION));
        let (completer, handle) = self.accumulator.issue(tp, record.timestamp);
        backlog.records.push_back(Parked {
            partition,
            record,
            completer,
        });
        handle
    }

    /// Topics with parked records and no lookup running, now marked as resolving
    pub(crate) fn claim_unresolved(&self) -> Vec<String> {
        self.backlogs
            .iter_mut()
            .filter_map(|mut entry| {
                if entry.resolving || entry.records.is_empty() {
                    return None;
                }
                entry.resolving = true;
                Some(entry.key().clone())
            })
            .collect()
    }

    /// Look `topic` up and move its parked records into the accumulator
    pub(crate) async fn resolve(&self, topic: String) {
        let lookup = self.metadata.fetch(&topic).await;

        if let Some(mut backlog) = self.backlogs.get_mut(&topic) {
            backlog.resolving = false;
            let parked: Vec<Parked> = backlog.records.drain(..).collect();
            match lookup {
                Ok(metadata) => {
                    debug!(topic = %topic, records = parked.len(), "Routing parked records");
                    // placed under the backlog guard so concurrent sends stay behind them
                    for p in parked {
                        self.place(&topic, &metadata, p);
                    }
                }
                Err(err) => {
                    warn!(
                        topic = %topic,
                        records = parked.len(),
                        error = %err,
                        "Topic lookup failed"
                    );
                    ProducerStats::add(&self.stats.records_failed, parked.len() as u64);
                    for mut p in parked {
                        let _ = p.completer.fail(err.clone().into());
                    }
                }
            }
        }

        self.backlogs.remove_if(&topic, |_, backlog| {
            backlog.records.is_empty() && !backlog.resolving
        });
    }

    fn place(&self, topic: &str, metadata: &TopicMetadata, parked: Parked) {
        let Parked {
            partition,
            record,
            mut completer,
        } = parked;

        let chosen = self.partitioner.partition(
            topic,
            partition,
            record.key.as_deref(),
            metadata.partition_count(),
        );
        match chosen {
            Ok(partition) => {
                let tp = TopicPartition::new(topic, partition);
                completer.assign(tp.clone());
                self.accumulator.append_with(tp, record, completer);
            }
            Err(e) => {
                let unknown = match e {
                    Error::UnknownPartition { partition, .. } => {
                        format!("{}/{}", topic, partition)
                    }
                    other => other.to_string(),
                };
                ProducerStats::add(&self.stats.records_failed, 1);
                let _ = completer.fail(BrokerError::UnknownTopicOrPartition(unknown).into());
            }
        }
    }

    /// Fail every parked record; returns how many there were
    pub(crate) fn abort_all(&self, err: DeliveryError) -> usize {
        let mut aborted = 0;
        for mut backlog in self.backlogs.iter_mut() {
            for mut p in backlog.records.drain(..) {
                aborted += 1;
                let _ = p.completer.fail(err.clone());
            }
        }
        aborted
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.backlogs.iter().all(|backlog| backlog.records.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::PendingTracker;
    use crate::connector::InMemoryConnector;
    use crate::partitioner::RoundRobinPartitioner;
    use bytes::Bytes;
    use std::time::{Duration, Instant};

    struct Fixture {
        broker: Arc<InMemoryConnector>,
        accumulator: Arc<RecordAccumulator>,
        router: RecordRouter,
    }

    fn fixture(broker: InMemoryConnector) -> Fixture {
        let broker = Arc::new(broker);
        let accumulator = Arc::new(RecordAccumulator::new(
            100,
            1024 * 1024,
            Duration::ZERO,
            Arc::new(PendingTracker::new()),
        ));
        let metadata = Arc::new(MetadataCache::new(
            broker.clone(),
            Duration::from_secs(60),
            Duration::from_millis(200),
        ));
        let router = RecordRouter::new(
            Box::new(RoundRobinPartitioner::new()),
            metadata,
            Arc::clone(&accumulator),
            Arc::new(ProducerStats::default()),
        );
        Fixture {
            broker,
            accumulator,
            router,
        }
    }

    fn value(v: &str) -> SerializedRecord {
        SerializedRecord::new(None, Some(Bytes::copy_from_slice(v.as_bytes())))
    }

    fn drained_values(accumulator: &RecordAccumulator) -> Vec<(i32, Bytes)> {
        let mut out = Vec::new();
        for batch in accumulator.drain_ready(Instant::now()) {
            let partition = batch.topic_partition().partition();
            for record in batch.records() {
                out.push((partition, record.value.clone().unwrap_or_default()));
            }
        }
        out.sort_by_key(|(partition, _)| *partition);
        out
    }

    #[tokio::test]
    async fn test_cold_topic_parks_without_lookup() {
        let f = fixture(InMemoryConnector::new());

        let _handle = f.router.route("t".into(), None, value("a")).unwrap();

        assert_eq!(f.broker.leader_lookups(), 0);
        assert!(!f.router.is_empty());
        assert!(f.accumulator.is_empty());
        assert_eq!(f.router.claim_unresolved(), vec!["t".to_string()]);
        // already claimed
        assert!(f.router.claim_unresolved().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_places_parked_records_in_order() {
        let f = fixture(InMemoryConnector::new().with_default_partitions(2));

        let _handles: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|v| f.router.route("t".into(), None, value(v)).unwrap())
            .collect();
        for topic in f.router.claim_unresolved() {
            f.router.resolve(topic).await;
        }

        assert!(f.router.is_empty());
        let placed: Vec<Bytes> = drained_values(&f.accumulator)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        // round robin alternates from a random start partition
        assert!(
            placed == ["a", "c", "b", "d"] || placed == ["b", "d", "a", "c"],
            "unexpected placement {:?}",
            placed
        );
    }

    #[tokio::test]
    async fn test_warm_topic_goes_straight_to_accumulator() {
        let f = fixture(InMemoryConnector::new().with_default_partitions(3));
        let _first = f.router.route("t".into(), Some(2), value("a")).unwrap();
        f.router.resolve("t".into()).await;

        let _second = f.router.route("t".into(), Some(2), value("b")).unwrap();
        assert!(f.router.is_empty());
        assert!(f.router.claim_unresolved().is_empty());

        let bad = f.router.route("t".into(), Some(3), value("c"));
        assert!(matches!(
            bad,
            Err(Error::UnknownPartition {
                partition: 3,
                partition_count: 3,
                ..
            })
        ));
        assert_eq!(
            drained_values(&f.accumulator),
            vec![(2, Bytes::from("a")), (2, Bytes::from("b"))]
        );
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_parked_handles() {
        let f = fixture(InMemoryConnector::new().without_auto_create());

        let first = f.router.route("missing".into(), None, value("a")).unwrap();
        let second = f.router.route("missing".into(), Some(0), value("b")).unwrap();
        f.router.resolve("missing".into()).await;

        for handle in [first, second] {
            let metadata = handle.await;
            assert_eq!(metadata.topic, "missing");
            assert!(matches!(
                metadata.error,
                Some(DeliveryError::Broker(BrokerError::UnknownTopicOrPartition(_)))
            ));
        }
        assert!(f.router.is_empty());
        assert_eq!(f.router.stats.snapshot().records_failed, 2);
    }

    #[tokio::test]
    async fn test_out_of_range_partition_on_cold_topic_fails_its_handle() {
        let f = fixture(InMemoryConnector::new().with_default_partitions(2));

        let bad = f.router.route("t".into(), Some(5), value("bad")).unwrap();
        let _good = f.router.route("t".into(), Some(1), value("good")).unwrap();
        f.router.resolve("t".into()).await;

        assert_eq!(
            bad.await.error,
            Some(DeliveryError::Broker(BrokerError::UnknownTopicOrPartition(
                "t/5".to_string()
            )))
        );
        assert_eq!(drained_values(&f.accumulator), vec![(1, Bytes::from("good"))]);
    }

    #[tokio::test]
    async fn test_abort_all_fails_parked_records() {
        let f = fixture(InMemoryConnector::new());
        let handle = f.router.route("t".into(), None, value("a")).unwrap();

        assert_eq!(f.router.abort_all(DeliveryError::FlushTimeout), 1);
        assert_eq!(handle.await.error, Some(DeliveryError::FlushTimeout));
        assert!(f.router.is_empty());
    }
}
