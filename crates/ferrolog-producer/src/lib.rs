//! # ferrolog-producer
//!
//! Asynchronous batching producer for partitioned, Kafka-style append-only
//! logs.
//!
//! Records are serialized, assigned a partition and appended to a
//! per-partition batch queue without `send` ever waiting on the network;
//! records for a topic whose metadata is not cached yet are routed by the
//! sender once it has looked the topic up. A single background sender
//! drains batches that are full or have lingered long enough and hands them
//! to a [`Connector`],
//! keeping at most one batch per partition in flight so that offsets follow
//! send order. Every `send` returns a [`CompletionHandle`] that resolves
//! exactly once with the record's [`RecordMetadata`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ferrolog_producer::{InMemoryConnector, Producer, ProducerConfig, ProducerRecord, StringSerializer};
//! use std::sync::Arc;
//!
//! let producer = Producer::new(
//!     ProducerConfig::default(),
//!     StringSerializer,
//!     StringSerializer,
//!     Arc::new(InMemoryConnector::new()),
//! )?;
//!
//! let handle = producer.send(ProducerRecord::new("events", "hello".to_string()))?;
//! let metadata = handle.await;
//! assert!(metadata.is_ok());
//!
//! producer.close().await?;
//! ```

mod accumulator;
mod batch;
mod completion;
pub mod config;
pub mod connector;
pub mod error;
mod metadata;
pub mod partitioner;
pub mod producer;
pub mod record;
mod router;
mod sender;
pub mod serializer;
mod stats;

pub use completion::CompletionHandle;
pub use config::{ProducerConfig, ProducerConfigBuilder, RequiredAcks};
pub use connector::{
    BrokerId, Connector, InMemoryConnector, PartitionLeader, ProduceRequest, ProduceResponse,
    ProducedBatch, TopicMetadata,
};
pub use error::{BrokerError, DeliveryError, Error, Result};
pub use partitioner::{
    murmur2, murmur2_partition, DefaultPartitioner, Partitioner, RoundRobinPartitioner,
    StickyPartitioner,
};
pub use producer::{Producer, ProducerState};
pub use record::{
    ProducerRecord, RecordMetadata, SerializedRecord, TopicPartition, UNACKNOWLEDGED_OFFSET,
};
pub use serializer::{
    ByteSerializer, FnSerializer, JsonSerializer, NullableSerializer, Serializer, StringSerializer,
};
pub use stats::ProducerStatsSnapshot;
