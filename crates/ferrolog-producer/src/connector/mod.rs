//! Broker capability consumed by the producer
//!
//! The producer never speaks the wire protocol itself. Anything that can look
//! up partition leadership and perform a produce call can drive it, which is
//! what [`Connector`] captures. [`InMemoryConnector`] is a complete in-process
//! implementation used by the test suite.

mod memory;

pub use memory::{InMemoryConnector, ProducedBatch};

use crate::config::RequiredAcks;
use crate::error::BrokerError;
use crate::record::{SerializedRecord, TopicPartition};
use async_trait::async_trait;
use std::time::Duration;

/// Identity of a broker node
pub type BrokerId = i32;

/// Leadership of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLeader {
    pub partition: i32,
    /// `None` while the partition has no elected leader
    pub leader: Option<BrokerId>,
}

/// Result of a leader lookup for a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub topic: String,
    pub partitions: Vec<PartitionLeader>,
}

impl TopicMetadata {
    pub fn partition_count(&self) -> i32 {
        self.partitions.len() as i32
    }

    /// Leader of `partition`, if the partition exists and has one
    pub fn leader(&self, partition: i32) -> Option<BrokerId> {
        self.partitions
            .iter()
            .find(|p| p.partition == partition)
            .and_then(|p| p.leader)
    }
}

/// One batch on its way to a partition leader
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub topic_partition: TopicPartition,
    pub leader: BrokerId,
    pub required_acks: RequiredAcks,
    /// How long the broker may wait for replicas before answering
    pub timeout: Duration,
    pub records: Vec<SerializedRecord>,
}

/// Broker answer to a produce call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProduceResponse {
    /// Offset assigned to the first record of the batch
    pub base_offset: i64,
    /// Broker timestamp when the topic uses log-append time
    pub log_append_time: Option<i64>,
}

/// Leader lookup and produce, as seen by the sender
///
/// Both calls may block for as long as the network needs; the sender bounds
/// `produce` with the configured request timeout.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Partition count and per-partition leader for `topic`
    async fn get_leader(&self, topic: &str) -> Result<TopicMetadata, BrokerError>;

    /// Append the request's records to its partition
    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse, BrokerError>;
}
