//! Single-use delivery slots connecting `send` callers to the sender task
//!
//! Every accepted record gets a [`Completer`] (kept in its batch) and a
//! [`CompletionHandle`] (returned to the caller). The completer resolves
//! exactly once; a second attempt reports [`Error::AlreadyResolved`]. A
//! completer dropped without resolving still resolves its handle, using the
//! tracker's abandon reason, so no handle is left dangling.
//!
//! All completers of one producer share a [`PendingTracker`], which is what
//! `flush` and `close` wait on.

use crate::error::DeliveryError;
use crate::record::{RecordMetadata, TopicPartition};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Notify};

/// Count of issued-but-unresolved completers
pub(crate) struct PendingTracker {
    pending: AtomicU64,
    /// Notified when pending reaches zero
    drained: Notify,
    /// Error given to completers dropped before resolution
    abandon_reason: Mutex<DeliveryError>,
}

impl PendingTracker {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            drained: Notify::new(),
            abandon_reason: Mutex::new(DeliveryError::Aborted),
        }
    }

    pub(crate) fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_abandon_reason(&self, reason: DeliveryError) {
        *self.abandon_reason.lock() = reason;
    }

    /// Wait until every completer issued so far has resolved
    pub(crate) async fn wait_drained(&self) {
        loop {
            // Registered before the check so a concurrent release is not missed
            let notified = self.drained.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn register(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Create a linked completer/handle pair for one record
pub(crate) fn completion_pair(
    tp: TopicPartition,
    timestamp: i64,
    tracker: Arc<PendingTracker>,
) -> (Completer, CompletionHandle) {
    let (tx, rx) = oneshot::channel();
    tracker.register();
    let completer = Completer {
        tx: Some(tx),
        tp: tp.clone(),
        timestamp,
        tracker,
    };
    let handle = CompletionHandle { rx, tp, timestamp };
    (completer, handle)
}

/// Sender-side half of a record's completion slot
pub struct Completer {
    tx: Option<oneshot::Sender<RecordMetadata>>,
    tp: TopicPartition,
    timestamp: i64,
    tracker: Arc<PendingTracker>,
}

impl Completer {
    /// Deliver the record's outcome
    ///
    /// Succeeds even if the caller dropped the handle. Fails only when this
    /// completer was already resolved.
    pub fn complete(&mut self, metadata: RecordMetadata) -> Result<()> {
        let tx = self.tx.take().ok_or(Error::AlreadyResolved)?;
        let _ = tx.send(metadata);
        self.tracker.release();
        Ok(())
    }

    pub fn fail(&mut self, error: DeliveryError) -> Result<()> {
        let metadata = RecordMetadata::failed(&self.tp, self.timestamp, error);
        self.complete(metadata)
    }

    /// Point the completer at the partition its record was finally routed to
    pub(crate) fn assign(&mut self, tp: TopicPartition) {
        self.tp = tp;
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }

    #[cfg(test)]
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let reason = self.tracker.abandon_reason.lock().clone();
            let _ = self.fail(reason);
        }
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("topic_partition", &self.tp)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Caller-side half: resolves to the record's [`RecordMetadata`]
///
/// Await it, poll it with [`try_take`](Self::try_take), or block on it from
/// synchronous code with [`blocking_wait`](Self::blocking_wait). Check
/// `metadata.error` even on the happy path: broker failures are reported here,
/// never from `send`.
#[derive(Debug)]
#[must_use = "the handle is the only way to learn whether the record was delivered"]
pub struct CompletionHandle {
    rx: oneshot::Receiver<RecordMetadata>,
    tp: TopicPartition,
    timestamp: i64,
}

impl CompletionHandle {
    /// Non-blocking check; returns the metadata once resolved
    pub fn try_take(&mut self) -> Option<RecordMetadata> {
        match self.rx.try_recv() {
            Ok(metadata) => Some(metadata),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(self.aborted()),
        }
    }

    /// Block the current thread until resolved; must not be called from async code
    pub fn blocking_wait(self) -> RecordMetadata {
        let aborted = self.aborted();
        self.rx.blocking_recv().unwrap_or(aborted)
    }

    fn aborted(&self) -> RecordMetadata {
        RecordMetadata::failed(&self.tp, self.timestamp, DeliveryError::Aborted)
    }
}

impl Future for CompletionHandle {
    type Output = RecordMetadata;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.rx).poll(cx);
        match polled {
            Poll::Ready(Ok(metadata)) => Poll::Ready(metadata),
            Poll::Ready(Err(_)) => Poll::Ready(self.aborted()),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use std::time::Duration;

    fn pair(tracker: &Arc<PendingTracker>) -> (Completer, CompletionHandle) {
        completion_pair(TopicPartition::new("t", 0), 1_000, Arc::clone(tracker))
    }

    #[tokio::test]
    async fn test_complete_delivers_metadata() {
        let tracker = Arc::new(PendingTracker::new());
        let (mut completer, handle) = pair(&tracker);
        assert_eq!(tracker.pending(), 1);

        let tp = completer.topic_partition().clone();
        completer
            .complete(RecordMetadata::delivered(&tp, 42, 1_000))
            .unwrap();

        let metadata = handle.await;
        assert_eq!(metadata.offset, 42);
        assert!(metadata.is_ok());
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_double_resolution_is_detected() {
        let tracker = Arc::new(PendingTracker::new());
        let (mut completer, handle) = pair(&tracker);

        completer.fail(BrokerError::RequestTimedOut.into()).unwrap();
        let second = completer.fail(BrokerError::RequestTimedOut.into());
        assert!(matches!(second, Err(Error::AlreadyResolved)));

        // first resolution wins, counter released exactly once
        assert!(handle.await.error.is_some());
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_resolving_after_handle_dropped_is_noop() {
        let tracker = Arc::new(PendingTracker::new());
        let (mut completer, handle) = pair(&tracker);
        drop(handle);

        assert!(completer.fail(DeliveryError::Aborted).is_ok());
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_dropped_completer_resolves_with_abandon_reason() {
        let tracker = Arc::new(PendingTracker::new());
        tracker.set_abandon_reason(DeliveryError::FlushTimeout);
        let (completer, handle) = pair(&tracker);
        drop(completer);

        let metadata = handle.await;
        assert_eq!(metadata.error, Some(DeliveryError::FlushTimeout));
        assert_eq!(metadata.offset, -1);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_try_take() {
        let tracker = Arc::new(PendingTracker::new());
        let (mut completer, mut handle) = pair(&tracker);
        assert!(handle.try_take().is_none());

        let tp = completer.topic_partition().clone();
        completer.complete(RecordMetadata::delivered(&tp, 0, 0)).unwrap();
        assert_eq!(handle.try_take().map(|m| m.offset), Some(0));
    }

    #[tokio::test]
    async fn test_wait_drained() {
        let tracker = Arc::new(PendingTracker::new());
        let (mut c1, _h1) = pair(&tracker);
        let (mut c2, _h2) = pair(&tracker);

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait_drained().await })
        };

        c1.fail(DeliveryError::Aborted).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        c2.fail(DeliveryError::Aborted).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish once pending reaches zero")
            .unwrap();
    }
}
