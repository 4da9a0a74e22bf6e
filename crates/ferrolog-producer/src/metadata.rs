//! Topic metadata shared by `send` and the sender task
//!
//! `send` only ever peeks at what is already here and never waits on the
//! connector. Lookups happen on the sender task, each one bounded by the
//! request timeout. An entry counts as absent once it is older than
//! `metadata_max_age`, and a leadership error evicts it straight away.

use crate::connector::{Connector, TopicMetadata};
use crate::error::BrokerError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry {
    metadata: Arc<TopicMetadata>,
    fetched_at: Instant,
}

impl Entry {
    fn is_fresh(&self, max_age: Duration) -> bool {
        self.fetched_at.elapsed() < max_age
    }
}

pub(crate) struct MetadataCache {
    connector: Arc<dyn Connector>,
    entries: RwLock<HashMap<String, Entry>>,
    max_age: Duration,
    lookup_timeout: Duration,
}

impl MetadataCache {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        max_age: Duration,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            entries: RwLock::new(HashMap::new()),
            max_age,
            lookup_timeout,
        }
    }

    /// Metadata known for `topic` right now, without asking the connector
    pub(crate) fn cached(&self, topic: &str) -> Option<Arc<TopicMetadata>> {
        self.entries
            .read()
            .get(topic)
            .filter(|entry| entry.is_fresh(self.max_age))
            .map(|entry| Arc::clone(&entry.metadata))
    }

    /// Like [`cached`](Self::cached), falling back to `get_leader`
    ///
    /// A lookup that outlives `lookup_timeout` fails with `RequestTimedOut`.
    /// Failed lookups leave no trace in the cache.
    pub(crate) async fn fetch(&self, topic: &str) -> Result<Arc<TopicMetadata>, BrokerError> {
        if let Some(metadata) = self.cached(topic) {
            return Ok(metadata);
        }

        let lookup = self.connector.get_leader(topic);
        let metadata = match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(result) => Arc::new(result?),
            Err(_) => return Err(BrokerError::RequestTimedOut),
        };
        debug!(
            topic,
            partitions = metadata.partition_count(),
            "Looked up topic metadata"
        );

        self.entries.write().insert(
            topic.to_string(),
            Entry {
                metadata: Arc::clone(&metadata),
                fetched_at: Instant::now(),
            },
        );
        Ok(metadata)
    }

    pub(crate) fn invalidate(&self, topic: &str) {
        self.entries.write().remove(topic);
    }

    /// Forget every topic whose entry has outlived `max_age`
    pub(crate) fn evict_expired(&self) {
        let max_age = self.max_age;
        self.entries.write().retain(|_, entry| entry.is_fresh(max_age));
    }
}
