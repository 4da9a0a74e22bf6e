//! Shared helpers for the producer integration tests

#![allow(dead_code)]

use ferrolog_producer::{
    ByteSerializer, InMemoryConnector, Producer, ProducerConfig, StringSerializer,
};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single delivery in these tests
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (safe to call from every test)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ferrolog_producer=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Single-partition broker, the shape most tests need
pub fn test_connector() -> Arc<InMemoryConnector> {
    Arc::new(InMemoryConnector::new())
}

/// Byte keys and string values over the given connector
pub fn string_producer(
    config: ProducerConfig,
    connector: &Arc<InMemoryConnector>,
) -> Producer<Vec<u8>, String> {
    Producer::new(config, ByteSerializer, StringSerializer, Arc::clone(connector))
        .expect("producer should start")
}

/// Build a unique topic name for a test
pub fn unique_topic_name(prefix: &str) -> String {
    format!("{}-{}", prefix, rand::random::<u32>())
}
