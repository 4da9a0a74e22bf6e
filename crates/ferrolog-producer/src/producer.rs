//! Asynchronous batching producer
//!
//! [`Producer`] is the entry point of the crate. `send` serializes a record,
//! hands it to the accumulator and returns a [`CompletionHandle`] without
//! ever waiting on the connector; a background sender task looks topics up,
//! delivers the batches and resolves the handles.
//!
//! # Example
//!
//! ```rust,ignore
//! use ferrolog_producer::{
//!     InMemoryConnector, Producer, ProducerConfig, ProducerRecord, StringSerializer,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> ferrolog_producer::Result<()> {
//! let config = ProducerConfig::builder()
//!     .batch_size(500)
//!     .linger_ms(5)
//!     .build();
//!
//! let producer = Producer::new(
//!     config,
//!     StringSerializer,
//!     StringSerializer,
//!     Arc::new(InMemoryConnector::new()),
//! )?;
//!
//! // Share across tasks
//! for i in 0..1000 {
//!     let producer = producer.clone();
//!     tokio::spawn(async move {
//!         let record = ProducerRecord::new("events", format!("msg-{}", i));
//!         if let Ok(handle) = producer.send(record) {
//!             let metadata = handle.await;
//!             println!("{}/{} @ {}", metadata.topic, metadata.partition, metadata.offset);
//!         }
//!     });
//! }
//!
//! producer.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::accumulator::RecordAccumulator;
use crate::completion::{CompletionHandle, PendingTracker};
use crate::config::ProducerConfig;
use crate::connector::Connector;
use crate::error::DeliveryError;
use crate::metadata::MetadataCache;
use crate::partitioner::{DefaultPartitioner, Partitioner};
use crate::record::{ProducerRecord, SerializedRecord};
use crate::router::RecordRouter;
use crate::sender::Sender;
use crate::serializer::Serializer;
use crate::stats::{ProducerStats, ProducerStatsSnapshot};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of a producer; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    /// Accepting records
    Open,
    /// `close` has begun; queued records are being delivered
    Closing,
    /// Every accepted record is resolved and the sender has stopped
    Closed,
}

impl fmt::Display for ProducerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerState::Open => write!(f, "open"),
            ProducerState::Closing => write!(f, "closing"),
            ProducerState::Closed => write!(f, "closed"),
        }
    }
}

/// Asynchronous batching producer
///
/// Cheap to clone; all clones share one accumulator and one sender task.
pub struct Producer<K, V> {
    inner: Arc<ProducerInner<K, V>>,
}

impl<K, V> Clone for Producer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ProducerInner<K, V> {
    config: Arc<ProducerConfig>,
    key_serializer: Box<dyn Serializer<K>>,
    value_serializer: Box<dyn Serializer<V>>,
    router: Arc<RecordRouter>,
    accumulator: Arc<RecordAccumulator>,
    tracker: Arc<PendingTracker>,
    stats: Arc<ProducerStats>,
    /// Held for reading across the state check and the hand-off in `send`
    state: RwLock<ProducerState>,
    sender: Mutex<Option<JoinHandle<()>>>,
    abort_tx: watch::Sender<Option<DeliveryError>>,
    /// Flipped by the close task once the producer is `Closed`
    closed_tx: watch::Sender<bool>,
}

impl<K, V> Producer<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create a producer using the [`DefaultPartitioner`]
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<KS, VS, C>(
        config: ProducerConfig,
        key_serializer: KS,
        value_serializer: VS,
        connector: Arc<C>,
    ) -> Result<Self>
    where
        KS: Serializer<K> + 'static,
        VS: Serializer<V> + 'static,
        C: Connector,
    {
        Self::with_partitioner(
            config,
            key_serializer,
            value_serializer,
            connector,
            DefaultPartitioner::new(),
        )
    }

    /// Create a producer with a custom partitioning policy
    pub fn with_partitioner<KS, VS, C, P>(
        config: ProducerConfig,
        key_serializer: KS,
        value_serializer: VS,
        connector: Arc<C>,
        partitioner: P,
    ) -> Result<Self>
    where
        KS: Serializer<K> + 'static,
        VS: Serializer<V> + 'static,
        C: Connector,
        P: Partitioner + 'static,
    {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("producer requires a tokio runtime: {}", e)))?;

        let config = Arc::new(config);
        let connector: Arc<dyn Connector> = connector;
        let tracker = Arc::new(PendingTracker::new());
        let stats = Arc::new(ProducerStats::default());
        let metadata = Arc::new(MetadataCache::new(
            Arc::clone(&connector),
            config.metadata_max_age,
            config.request_timeout,
        ));
        let accumulator = Arc::new(RecordAccumulator::new(
            config.batch_size,
            config.max_batch_bytes,
            config.linger,
            Arc::clone(&tracker),
        ));
        let router = Arc::new(RecordRouter::new(
            Box::new(partitioner),
            Arc::clone(&metadata),
            Arc::clone(&accumulator),
            Arc::clone(&stats),
        ));

        let (abort_tx, abort_rx) = watch::channel(None);
        let (closed_tx, _) = watch::channel(false);

        let sender = Sender::new(
            Arc::clone(&config),
            Arc::clone(&accumulator),
            Arc::clone(&router),
            metadata,
            connector,
            Arc::clone(&stats),
        );
        let handle = runtime.spawn(sender.run(abort_rx));

        info!(
            batch_size = config.batch_size,
            linger = ?config.linger,
            acks = %config.required_acks,
            "Producer started"
        );

        Ok(Self {
            inner: Arc::new(ProducerInner {
                config,
                key_serializer: Box::new(key_serializer),
                value_serializer: Box::new(value_serializer),
                router,
                accumulator,
                tracker,
                stats,
                state: RwLock::new(ProducerState::Open),
                sender: Mutex::new(Some(handle)),
                abort_tx,
                closed_tx,
            }),
        })
    }

    /// Enqueue a record for delivery
    ///
    /// Never waits on the connector. With the topic's partition count cached
    /// the record goes straight into its partition's batch; otherwise it is
    /// parked until the sender has looked the topic up. Broker-side failures,
    /// an unknown topic included, reach the caller through the returned
    /// handle only.
    pub fn send(&self, record: ProducerRecord<K, V>) -> Result<CompletionHandle> {
        let inner = &self.inner;
        if record.topic.is_empty() {
            return Err(Error::InvalidRecord("topic must not be empty".to_string()));
        }
        if *inner.state.read() != ProducerState::Open {
            return Err(Error::ProducerClosed);
        }

        let key = match &record.key {
            Some(key) => inner.key_serializer.serialize(&record.topic, key)?,
            None => None,
        };
        let value = inner.value_serializer.serialize(&record.topic, &record.value)?;
        let serialized = SerializedRecord::new(key, value);

        // Close cannot slip in between the check and the hand-off
        let handle = {
            let state = inner.state.read();
            if *state != ProducerState::Open {
                return Err(Error::ProducerClosed);
            }
            inner
                .router
                .route(record.topic, record.partition, serialized)?
        };
        ProducerStats::add(&inner.stats.records_sent, 1);
        Ok(handle)
    }

    /// Deliver everything queued so far, ignoring linger, and wait for it
    pub async fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        // Fast path: no pending records
        if inner.tracker.pending() == 0 {
            return Ok(());
        }

        let _forcing = ForcedFlush::begin(&inner.accumulator);
        inner.tracker.wait_drained().await;
        Ok(())
    }

    /// Deliver every accepted record, then stop the sender
    ///
    /// Idempotent. A call made while another close is running waits for it.
    /// The work runs on its own task, so dropping this future does not leave
    /// the producer stuck in `Closing`. With `close_timeout` set, records
    /// still unresolved when it elapses fail with
    /// [`DeliveryError::FlushTimeout`] and this returns [`Error::FlushTimeout`].
    pub async fn close(&self) -> Result<()> {
        let first = {
            let mut state = self.inner.state.write();
            let first = *state == ProducerState::Open;
            if first {
                *state = ProducerState::Closing;
            }
            first
        };

        if !first {
            let mut closed = self.inner.closed_tx.subscribe();
            let _ = closed.wait_for(|closed| *closed).await;
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        match tokio::spawn(async move { inner.shut_down().await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                error!("Close task failed: {}", e);
                Ok(())
            }
        }
    }
}

impl<K, V> Producer<K, V> {
    pub fn stats(&self) -> ProducerStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn state(&self) -> ProducerState {
        *self.inner.state.read()
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    /// Records accepted but not yet resolved
    pub fn pending(&self) -> u64 {
        self.inner.tracker.pending()
    }
}

impl<K, V> ProducerInner<K, V> {
    /// Drain, stop the sender and publish `Closed`
    async fn shut_down(&self) -> Result<()> {
        info!(
            pending = self.tracker.pending(),
            "Closing producer, delivering queued records"
        );
        self.accumulator.begin_close();

        let sender = self.sender.lock().take();
        let result = match sender {
            Some(sender) => self.await_sender(sender).await,
            None => Ok(()),
        };

        let leftover = self.tracker.pending();
        if leftover > 0 && result.is_ok() {
            warn!(leftover, "Sender stopped with unresolved records");
        }

        *self.state.write() = ProducerState::Closed;
        self.closed_tx.send_replace(true);
        info!("Producer closed");
        result
    }

    async fn await_sender(&self, mut sender: JoinHandle<()>) -> Result<()> {
        let Some(limit) = self.config.close_timeout else {
            if let Err(e) = sender.await {
                error!("Sender task failed: {}", e);
            }
            return Ok(());
        };

        match tokio::time::timeout(limit, &mut sender).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    error!("Sender task failed: {}", e);
                }
                Ok(())
            }
            Err(_) => {
                let unresolved = self.tracker.pending();
                warn!(
                    unresolved,
                    timeout = ?limit,
                    "Close timed out, failing undelivered records"
                );
                self.tracker.set_abandon_reason(DeliveryError::FlushTimeout);
                ProducerStats::add(&self.stats.records_failed, unresolved);

                let _ = self.abort_tx.send(Some(DeliveryError::FlushTimeout));
                if let Err(e) = sender.await {
                    error!("Sender task failed: {}", e);
                }
                Err(Error::FlushTimeout { unresolved })
            }
        }
    }
}

/// Keeps batches forced out for as long as a `flush` call is waiting
struct ForcedFlush<'a>(&'a RecordAccumulator);

impl<'a> ForcedFlush<'a> {
    fn begin(accumulator: &'a RecordAccumulator) -> Self {
        accumulator.begin_flush();
        Self(accumulator)
    }
}

impl Drop for ForcedFlush<'_> {
    fn drop(&mut self) {
        self.0.end_flush();
    }
}

impl<K, V> Drop for ProducerInner<K, V> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if *state == ProducerState::Open {
            debug!("Producer dropped while open, draining in background");
            *state = ProducerState::Closing;
            self.accumulator.begin_close();
        }
    }
}

impl<K, V> fmt::Debug for Producer<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("state", &self.state())
            .field("pending", &self.inner.tracker.pending())
            .finish()
    }
}
