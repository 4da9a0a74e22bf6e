use crate::error::DeliveryError;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Offset reported for records sent with `RequiredAcks::None`
pub const UNACKNOWLEDGED_OFFSET: i64 = -1;

/// Addressing key for batch queues
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: Arc<str>,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A record submitted by the application
#[derive(Debug, Clone)]
pub struct ProducerRecord<K, V> {
    /// Topic name
    pub topic: String,
    /// Optional partition (if None, the partitioner decides)
    pub partition: Option<i32>,
    /// Optional key, also used for hash partitioning
    pub key: Option<K>,
    /// Message value
    pub value: V,
}

impl<K, V> ProducerRecord<K, V> {
    pub fn new(topic: impl Into<String>, value: V) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value,
        }
    }

    pub fn with_key(mut self, key: K) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

/// Key and value after serialization, ready for the accumulator
#[derive(Debug, Clone)]
pub struct SerializedRecord {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// Creation time in milliseconds since the epoch
    pub timestamp: i64,
    /// When the record entered the producer
    pub enqueued_at: Instant,
}

impl SerializedRecord {
    pub fn new(key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            key,
            value,
            timestamp: chrono::Utc::now().timestamp_millis(),
            enqueued_at: Instant::now(),
        }
    }

    /// Key + value bytes, the unit of `max_batch_bytes`
    pub fn size(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}

/// Outcome of a single record, delivered through its completion handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    /// Topic name
    pub topic: String,
    /// Partition
    pub partition: i32,
    /// Offset within partition, [`UNACKNOWLEDGED_OFFSET`] when acks = 0 or on failure
    pub offset: i64,
    /// Broker log-append time if reported, otherwise the record's creation time
    pub timestamp: i64,
    /// `None` when the record was delivered
    pub error: Option<DeliveryError>,
}

impl RecordMetadata {
    pub(crate) fn delivered(tp: &TopicPartition, offset: i64, timestamp: i64) -> Self {
        Self {
            topic: tp.topic().to_string(),
            partition: tp.partition(),
            offset,
            timestamp,
            error: None,
        }
    }

    pub(crate) fn failed(tp: &TopicPartition, timestamp: i64, error: DeliveryError) -> Self {
        Self {
            topic: tp.topic().to_string(),
            partition: tp.partition(),
            offset: UNACKNOWLEDGED_OFFSET,
            timestamp,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a `Result`, for callers that prefer `?`
    pub fn into_result(self) -> std::result::Result<RecordMetadata, DeliveryError> {
        match self.error.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;

    #[test]
    fn test_topic_partition_ordering_and_display() {
        let a = TopicPartition::new("alpha", 1);
        let b = TopicPartition::new("alpha", 2);
        let c = TopicPartition::new("beta", 0);
        assert!(a < b && b < c);
        assert_eq!(a, TopicPartition::new(String::from("alpha"), 1));
        assert_eq!(c.to_string(), "beta/0");
    }

    #[test]
    fn test_serialized_record_size() {
        let record = SerializedRecord::new(Some(Bytes::from("key")), Some(Bytes::from("value")));
        assert_eq!(record.size(), 8);

        let tombstone = SerializedRecord::new(Some(Bytes::from("key")), None);
        assert_eq!(tombstone.size(), 3);
    }

    #[test]
    fn test_record_builder() {
        let record: ProducerRecord<String, &str> = ProducerRecord::new("events", "payload")
            .with_key("user-1".to_string())
            .with_partition(3);
        assert_eq!(record.topic, "events");
        assert_eq!(record.partition, Some(3));
        assert_eq!(record.key.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_metadata_into_result() {
        let tp = TopicPartition::new("t", 0);
        assert!(RecordMetadata::delivered(&tp, 5, 0).into_result().is_ok());

        let failed = RecordMetadata::failed(&tp, 0, BrokerError::RequestTimedOut.into());
        assert_eq!(failed.offset, UNACKNOWLEDGED_OFFSET);
        assert_eq!(
            failed.into_result().unwrap_err(),
            DeliveryError::Broker(BrokerError::RequestTimedOut)
        );
    }
}
