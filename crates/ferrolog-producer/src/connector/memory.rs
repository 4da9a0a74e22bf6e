use super::{
    BrokerId, Connector, PartitionLeader, ProduceRequest, ProduceResponse, TopicMetadata,
};
use crate::config::RequiredAcks;
use crate::error::BrokerError;
use crate::record::{SerializedRecord, TopicPartition};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

const DEFAULT_BROKER_ID: BrokerId = 1;

/// Produce call observed by the in-memory broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedBatch {
    pub topic_partition: TopicPartition,
    pub required_acks: RequiredAcks,
    pub record_count: usize,
    /// Offset of the first record, `None` if the call failed
    pub base_offset: Option<i64>,
}

#[derive(Default)]
struct BrokerState {
    /// topic -> one log per partition
    topics: HashMap<String, Vec<Vec<SerializedRecord>>>,
    leaderless: HashSet<TopicPartition>,
    injected_failures: VecDeque<BrokerError>,
    produced: Vec<ProducedBatch>,
}

/// Single-node broker kept entirely in memory
///
/// Assigns sequential offsets per partition, auto-creates topics on first
/// lookup (unless disabled), and lets tests inject failures, latency and
/// leaderless partitions.
pub struct InMemoryConnector {
    broker_id: BrokerId,
    default_partitions: i32,
    auto_create_topics: bool,
    latency: Mutex<Duration>,
    lookup_latency: Mutex<Duration>,
    state: Mutex<BrokerState>,
    leader_lookups: AtomicU64,
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self {
            broker_id: DEFAULT_BROKER_ID,
            default_partitions: 1,
            auto_create_topics: true,
            latency: Mutex::new(Duration::ZERO),
            lookup_latency: Mutex::new(Duration::ZERO),
            state: Mutex::new(BrokerState::default()),
            leader_lookups: AtomicU64::new(0),
        }
    }

    /// Partition count for auto-created topics
    pub fn with_default_partitions(mut self, partitions: i32) -> Self {
        self.default_partitions = partitions.max(1);
        self
    }

    /// Fail lookups for topics that were not declared with [`with_topic`](Self::with_topic)
    pub fn without_auto_create(mut self) -> Self {
        self.auto_create_topics = false;
        self
    }

    /// Declare a topic up front
    pub fn with_topic(self, topic: impl Into<String>, partitions: i32) -> Self {
        self.state
            .lock()
            .topics
            .insert(topic.into(), vec![Vec::new(); partitions.max(1) as usize]);
        self
    }

    /// Delay applied to every produce call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Delay applied to every `get_leader` call
    pub fn set_lookup_latency(&self, latency: Duration) {
        *self.lookup_latency.lock() = latency;
    }

    /// Make the next produce call (on any partition) fail with `error`
    pub fn fail_next_produce(&self, error: BrokerError) {
        self.state.lock().injected_failures.push_back(error);
    }

    /// Mark a partition as having no leader, or restore its leader
    pub fn set_leaderless(&self, tp: TopicPartition, leaderless: bool) {
        let mut state = self.state.lock();
        if leaderless {
            state.leaderless.insert(tp);
        } else {
            state.leaderless.remove(&tp);
        }
    }

    /// Records stored in a partition log, in offset order
    pub fn records(&self, tp: &TopicPartition) -> Vec<SerializedRecord> {
        self.state
            .lock()
            .topics
            .get(tp.topic())
            .and_then(|logs| logs.get(tp.partition() as usize))
            .cloned()
            .unwrap_or_default()
    }

    /// Every produce call seen so far, in arrival order
    pub fn produced_batches(&self) -> Vec<ProducedBatch> {
        self.state.lock().produced.clone()
    }

    pub fn leader_lookups(&self) -> u64 {
        self.leader_lookups.load(Ordering::Relaxed)
    }

    fn metadata_for(&self, state: &mut BrokerState, topic: &str) -> Option<TopicMetadata> {
        if !state.topics.contains_key(topic) {
            if !self.auto_create_topics {
                return None;
            }
            state.topics.insert(
                topic.to_string(),
                vec![Vec::new(); self.default_partitions as usize],
            );
        }

        let count = state.topics.get(topic).map(Vec::len).unwrap_or(0);
        let partitions = (0..count as i32)
            .map(|partition| {
                let tp = TopicPartition::new(topic, partition);
                PartitionLeader {
                    partition,
                    leader: (!state.leaderless.contains(&tp)).then_some(self.broker_id),
                }
            })
            .collect();

        Some(TopicMetadata {
            topic: topic.to_string(),
            partitions,
        })
    }

    fn append(&self, request: &ProduceRequest) -> Result<ProduceResponse, BrokerError> {
        let mut state = self.state.lock();
        let tp = &request.topic_partition;

        let result = if let Some(error) = state.injected_failures.pop_front() {
            Err(error)
        } else if state.leaderless.contains(tp) {
            Err(BrokerError::LeaderNotAvailable {
                topic: tp.topic().to_string(),
                partition: tp.partition(),
            })
        } else if request.leader != self.broker_id {
            Err(BrokerError::NotLeaderForPartition {
                topic: tp.topic().to_string(),
                partition: tp.partition(),
            })
        } else {
            match state
                .topics
                .get_mut(tp.topic())
                .and_then(|logs| logs.get_mut(tp.partition() as usize))
            {
                Some(log) => {
                    let base_offset = log.len() as i64;
                    log.extend(request.records.iter().cloned());
                    Ok(ProduceResponse {
                        base_offset,
                        log_append_time: None,
                    })
                }
                None => Err(BrokerError::UnknownTopicOrPartition(tp.to_string())),
            }
        };

        state.produced.push(ProducedBatch {
            topic_partition: tp.clone(),
            required_acks: request.required_acks,
            record_count: request.records.len(),
            base_offset: result.as_ref().ok().map(|r| r.base_offset),
        });
        result
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn get_leader(&self, topic: &str) -> Result<TopicMetadata, BrokerError> {
        self.leader_lookups.fetch_add(1, Ordering::Relaxed);
        let latency = *self.lookup_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        self.metadata_for(&mut state, topic)
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition(topic.to_string()))
    }

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse, BrokerError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = self.append(&request);
        trace!(
            topic_partition = %request.topic_partition,
            records = request.records.len(),
            ok = result.is_ok(),
            "in-memory produce"
        );
        result
    }
}
