use thiserror::Error;

/// Errors returned synchronously by the producer API
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Unknown partition {partition} for topic '{topic}' ({partition_count} partitions)")]
    UnknownPartition {
        topic: String,
        partition: i32,
        partition_count: i32,
    },

    #[error("Producer is closed")]
    ProducerClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Flush timed out with {unresolved} records still pending")]
    FlushTimeout { unresolved: u64 },

    #[error("Completion already resolved")]
    AlreadyResolved,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by (or on the way to) the broker
///
/// Only ever reaches callers wrapped in [`DeliveryError::Broker`] on a
/// record's completion handle. Cloneable so that a single failed produce call can be fanned out to every
/// record of the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Leader not available for {topic}/{partition}")]
    LeaderNotAvailable { topic: String, partition: i32 },

    #[error("Broker is not the leader for {topic}/{partition}")]
    NotLeaderForPartition { topic: String, partition: i32 },

    #[error("Unknown topic or partition: {0}")]
    UnknownTopicOrPartition(String),

    #[error("Request timed out")]
    RequestTimedOut,

    #[error("Message too large")]
    MessageTooLarge,

    #[error("Not enough in-sync replicas")]
    NotEnoughReplicas,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Broker returned error code {0}")]
    Code(i16),
}

impl BrokerError {
    /// Kafka protocol error code for this failure
    pub fn code(&self) -> i16 {
        match self {
            BrokerError::LeaderNotAvailable { .. } => 5,
            BrokerError::NotLeaderForPartition { .. } => 6,
            BrokerError::UnknownTopicOrPartition(_) => 3,
            BrokerError::RequestTimedOut => 7,
            BrokerError::MessageTooLarge => 10,
            BrokerError::NotEnoughReplicas => 19,
            BrokerError::Network(_) => -1,
            BrokerError::Code(code) => *code,
        }
    }

    /// Whether re-sending the same batch may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BrokerError::LeaderNotAvailable { .. }
                | BrokerError::NotLeaderForPartition { .. }
                | BrokerError::RequestTimedOut
                | BrokerError::NotEnoughReplicas
                | BrokerError::Network(_)
        )
    }

    /// Whether cached leadership for the topic should be dropped
    pub fn invalidates_metadata(&self) -> bool {
        matches!(
            self,
            BrokerError::LeaderNotAvailable { .. }
                | BrokerError::NotLeaderForPartition { .. }
                | BrokerError::UnknownTopicOrPartition(_)
                | BrokerError::Network(_)
        )
    }
}

/// Per-record delivery failure, carried in [`RecordMetadata::error`](crate::RecordMetadata)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Record was not delivered before the close deadline")]
    FlushTimeout,

    #[error("Producer shut down before the record was delivered")]
    Aborted,
}
