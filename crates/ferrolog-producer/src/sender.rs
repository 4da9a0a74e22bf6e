//! Background delivery task
//!
//! One sender runs per producer. It drains ready batches from the
//! accumulator and hands each to its own dispatch task, so partitions make
//! progress independently while the accumulator's in-flight flag keeps at
//! most one batch per partition on the wire. Topic lookups for records that
//! `send` could not partition yet run as tasks of the same set.

use crate::accumulator::RecordAccumulator;
use crate::batch::RecordBatch;
use crate::config::{ProducerConfig, RequiredAcks};
use crate::connector::{Connector, ProduceRequest, ProduceResponse};
use crate::error::{BrokerError, DeliveryError};
use crate::metadata::MetadataCache;
use crate::record::TopicPartition;
use crate::router::RecordRouter;
use crate::stats::ProducerStats;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Handles shared between the sender loop and its dispatch tasks
#[derive(Clone)]
pub(crate) struct Sender {
    config: Arc<ProducerConfig>,
    accumulator: Arc<RecordAccumulator>,
    router: Arc<RecordRouter>,
    metadata: Arc<MetadataCache>,
    connector: Arc<dyn Connector>,
    stats: Arc<ProducerStats>,
}

impl Sender {
    pub(crate) fn new(
        config: Arc<ProducerConfig>,
        accumulator: Arc<RecordAccumulator>,
        router: Arc<RecordRouter>,
        metadata: Arc<MetadataCache>,
        connector: Arc<dyn Connector>,
        stats: Arc<ProducerStats>,
    ) -> Self {
        Self {
            config,
            accumulator,
            router,
            metadata,
            connector,
            stats,
        }
    }

    /// Deliver batches until the accumulator is closing and fully drained
    ///
    /// Publishing an error on `abort` cancels every task still running and
    /// fails whatever is still queued or parked with it. Records of cancelled
    /// dispatches resolve with the tracker's abandon reason.
    pub(crate) async fn run(self, mut abort: watch::Receiver<Option<DeliveryError>>) {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut last_cleanup = Instant::now();
        debug!("Sender started");

        loop {
            let aborted = abort.borrow().clone();
            if let Some(reason) = aborted {
                in_flight.abort_all();
                while in_flight.join_next().await.is_some() {}
                let failed = self.router.abort_all(reason.clone())
                    + self.accumulator.abort_all(reason);
                warn!(failed, "Sender aborted, undelivered records failed");
                break;
            }

            for topic in self.router.claim_unresolved() {
                trace!(topic = %topic, "Looking up topic for parked records");
                let router = Arc::clone(&self.router);
                in_flight.spawn(async move { router.resolve(topic).await });
            }

            for batch in self.accumulator.drain_ready(Instant::now()) {
                trace!(
                    topic_partition = %batch.topic_partition(),
                    records = batch.len(),
                    "Dispatching batch"
                );
                let sender = self.clone();
                in_flight.spawn(async move { sender.dispatch(batch).await });
            }

            if self.accumulator.is_closing()
                && in_flight.is_empty()
                && self.router.is_empty()
                && self.accumulator.is_empty()
            {
                break;
            }

            if last_cleanup.elapsed() >= self.config.metadata_max_age {
                self.metadata.evict_expired();
                last_cleanup = Instant::now();
            }

            let idle = self
                .accumulator
                .next_ready_in(Instant::now())
                .map_or(self.config.idle_tick, |d| d.min(self.config.idle_tick));

            tokio::select! {
                _ = self.accumulator.wakeup() => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Sender task panicked: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep(idle) => {}
                Ok(()) = abort.changed() => {}
            }
        }

        info!("Sender stopped");
    }

    /// Deliver one batch and resolve its records
    async fn dispatch(self, mut batch: RecordBatch) {
        let tp = batch.topic_partition().clone();
        let guard = InFlight::new(Arc::clone(&self.accumulator), tp.clone());

        let err = match self.send_batch(&mut batch).await {
            Ok(()) => return,
            Err(err) => err,
        };

        if err.invalidates_metadata() {
            self.metadata.invalidate(tp.topic());
        }

        if err.is_retriable() && batch.attempts() < self.config.retries {
            warn!(
                topic_partition = %tp,
                attempt = batch.attempts() + 1,
                error = %err,
                "Retrying batch"
            );
            ProducerStats::add(&self.stats.retries, 1);
            batch.schedule_retry(Instant::now() + self.config.retry_backoff);
            guard.requeue(batch);
            return;
        }

        warn!("Failed to send batch to {}: {}", tp, err);
        ProducerStats::add(&self.stats.records_failed, batch.len() as u64);
        batch.fail_all(err.into());
    }

    /// Look up the leader and perform the produce call
    ///
    /// On `Ok` every record of the batch is resolved. On `Err` none are.
    async fn send_batch(&self, batch: &mut RecordBatch) -> Result<(), BrokerError> {
        let tp = batch.topic_partition().clone();
        let metadata = self.metadata.fetch(tp.topic()).await?;
        let leader =
            metadata
                .leader(tp.partition())
                .ok_or_else(|| BrokerError::LeaderNotAvailable {
                    topic: tp.topic().to_string(),
                    partition: tp.partition(),
                })?;

        let request = ProduceRequest {
            topic_partition: tp.clone(),
            leader,
            required_acks: self.config.required_acks,
            timeout: self.config.request_timeout,
            records: batch.records().to_vec(),
        };
        let records = batch.len() as u64;
        ProducerStats::add(&self.stats.batches_sent, 1);

        if self.config.required_acks == RequiredAcks::None {
            // Callers are released before the broker is heard from
            batch.complete_unacknowledged();
            ProducerStats::add(&self.stats.records_delivered, records);
            if let Err(e) = self.produce(request).await {
                debug!("Unacknowledged batch to {} failed: {}", tp, e);
                if e.invalidates_metadata() {
                    self.metadata.invalidate(tp.topic());
                }
            }
            return Ok(());
        }

        let response = self.produce(request).await?;
        batch.complete_acknowledged(response.base_offset, response.log_append_time);
        ProducerStats::add(&self.stats.records_delivered, records);
        trace!(
            topic_partition = %tp,
            base_offset = response.base_offset,
            records,
            "Batch acknowledged"
        );
        Ok(())
    }

    async fn produce(&self, request: ProduceRequest) -> Result<ProduceResponse, BrokerError> {
        tokio::time::timeout(self.config.request_timeout, self.connector.produce(request))
            .await
            .map_err(|_| BrokerError::RequestTimedOut)?
    }
}

/// Releases a partition's in-flight flag when its dispatch ends, even when
/// the dispatch is cancelled or panics
struct InFlight {
    accumulator: Arc<RecordAccumulator>,
    tp: TopicPartition,
    released: bool,
}

impl InFlight {
    fn new(accumulator: Arc<RecordAccumulator>, tp: TopicPartition) -> Self {
        Self {
            accumulator,
            tp,
            released: false,
        }
    }

    /// Hand the batch back to its queue; reenqueue clears the flag itself
    fn requeue(mut self, batch: RecordBatch) {
        self.accumulator.reenqueue(batch);
        self.released = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.released {
            self.accumulator.complete(&self.tp);
        }
    }
}
