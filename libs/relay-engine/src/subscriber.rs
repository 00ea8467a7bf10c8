//! Streaming pull over a `PullSource` with flow control.
//!
//! Every delivered message holds one semaphore permit until it is acked,
//! nacked or its `AckHandle` is dropped, so the number of outstanding
//! deliveries never exceeds `max_outstanding`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use relay_api::{ConnectorError, PullSource, ReceivedMessage};

use crate::config::{DispatchMode, PipelineConfig};
use crate::stats::PipelineStats;

// ═══════════════════════════════════════════════════════════════
//  Settings / outcome
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    pub max_outstanding: usize,
    pub max_per_pull: usize,
    pub dispatch: DispatchMode,
    pub retry_backoff: Duration,
}

impl From<&PipelineConfig> for SubscriberSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_outstanding: config.flow_control.max_messages,
            max_per_pull: config.pull.max_messages_per_pull,
            dispatch: config.flow_control.dispatch,
            retry_backoff: config.pull.retry_backoff(),
        }
    }
}

/// How a streaming pull ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The source reported end of stream.
    Completed,
    /// The caller's wait timed out (the pull itself may still be running).
    TimedOut,
    /// Cancelled through the pull's token.
    Cancelled,
    Failed(String),
}

// ═══════════════════════════════════════════════════════════════
//  Ack handle
// ═══════════════════════════════════════════════════════════════

/// Settles a single delivery. Owns one flow-control slot.
///
/// Dropping the handle without calling `ack`/`nack` frees the slot and
/// leaves the message to the source's redelivery (ack deadline expiry).
/// Holders that mean to leave a message unsettled keep the handle until
/// that deadline, so the slot stays counted while the source still sees
/// the message as outstanding.
pub struct AckHandle {
    ack_id: String,
    message_id: String,
    source: Arc<dyn PullSource>,
    stats: Arc<PipelineStats>,
    settled: bool,
    _permit: OwnedSemaphorePermit,
}

impl AckHandle {
    pub(crate) fn new(
        ack_id: String,
        message_id: String,
        source: Arc<dyn PullSource>,
        stats: Arc<PipelineStats>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            ack_id,
            message_id,
            source,
            stats,
            settled: false,
            _permit: permit,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub async fn ack(mut self) -> Result<(), ConnectorError> {
        self.settled = true;
        self.source.acknowledge(vec![self.ack_id.clone()]).await?;
        self.stats.record_acked();
        tracing::debug!(message_id = %self.message_id, "acked");
        Ok(())
    }

    pub async fn nack(mut self) -> Result<(), ConnectorError> {
        self.settled = true;
        self.source.nack(vec![self.ack_id.clone()]).await?;
        self.stats.record_nacked();
        tracing::debug!(message_id = %self.message_id, "nacked");
        Ok(())
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(message_id = %self.message_id, "released without ack, left for redelivery");
        }
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("ack_id", &self.ack_id)
            .field("message_id", &self.message_id)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Per-message callback.
pub trait MessageHandler: Send + Sync {
    fn on_message(
        &self,
        message: ReceivedMessage,
        ack: AckHandle,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

// ═══════════════════════════════════════════════════════════════
//  Streaming pull handle
// ═══════════════════════════════════════════════════════════════

/// Live pull operation: awaitable, cancellable.
pub struct StreamingPull {
    subscription: String,
    token: CancellationToken,
    handle: Option<JoinHandle<PullOutcome>>,
    finished: Option<PullOutcome>,
}

impl StreamingPull {
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Request cancellation. The pull loop stops at its next await point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the pull to end, optionally bounded by `timeout`.
    ///
    /// `TimedOut` does not cancel anything; the caller decides what to do.
    pub async fn result(&mut self, timeout: Option<Duration>) -> PullOutcome {
        if let Some(outcome) = &self.finished {
            return outcome.clone();
        }
        let Some(handle) = self.handle.as_mut() else {
            return PullOutcome::Cancelled;
        };
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => return PullOutcome::TimedOut,
            },
            None => handle.await,
        };
        self.handle = None;
        let outcome = joined.unwrap_or_else(|e| PullOutcome::Failed(format!("pull task: {e}")));
        self.finished = Some(outcome.clone());
        outcome
    }

    /// Cancel and wait until the loop and every in-flight callback are done.
    pub async fn stop(mut self) -> PullOutcome {
        self.cancel();
        self.result(None).await
    }
}

/// Open a streaming pull: fetch from `source` and dispatch each delivery to
/// `handler`, never holding more than `settings.max_outstanding` unsettled
/// messages.
pub fn subscribe(
    source: Arc<dyn PullSource>,
    settings: SubscriberSettings,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<PipelineStats>,
) -> StreamingPull {
    let subscription = source.subscription().to_string();
    let token = CancellationToken::new();
    let handle = tokio::spawn(run_pull_loop(
        source,
        settings,
        handler,
        stats,
        token.clone(),
    ));
    StreamingPull {
        subscription,
        token,
        handle: Some(handle),
        finished: None,
    }
}

async fn run_pull_loop(
    source: Arc<dyn PullSource>,
    settings: SubscriberSettings,
    handler: Arc<dyn MessageHandler>,
    stats: Arc<PipelineStats>,
    token: CancellationToken,
) -> PullOutcome {
    let subscription = source.subscription().to_string();
    let permits = Arc::new(Semaphore::new(settings.max_outstanding));
    let batch_limit = settings.max_per_pull.min(settings.max_outstanding).max(1);
    let callbacks = TaskTracker::new();

    tracing::info!(
        %subscription,
        max_outstanding = settings.max_outstanding,
        dispatch = ?settings.dispatch,
        "streaming pull started"
    );

    let outcome = loop {
        // Block until at least one flow-control slot is free.
        let first = tokio::select! {
            biased;
            _ = token.cancelled() => break PullOutcome::Cancelled,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break PullOutcome::Failed("flow control closed".into()),
            },
        };
        let mut slots = vec![first];
        while slots.len() < batch_limit {
            match permits.clone().try_acquire_owned() {
                Ok(p) => slots.push(p),
                Err(_) => break,
            }
        }

        let pulled = tokio::select! {
            biased;
            _ = token.cancelled() => break PullOutcome::Cancelled,
            pulled = source.pull(slots.len()) => pulled,
        };

        let messages = match pulled {
            Ok(Some(messages)) => messages,
            Ok(None) => {
                tracing::info!(%subscription, "source closed");
                break PullOutcome::Completed;
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(%subscription, error = %e, "pull error, retrying");
                drop(slots);
                tokio::select! {
                    _ = tokio::time::sleep(settings.retry_backoff) => continue,
                    _ = token.cancelled() => break PullOutcome::Cancelled,
                }
            }
            Err(e) => {
                tracing::error!(%subscription, error = %e, "pull failed");
                break PullOutcome::Failed(e.to_string());
            }
        };

        // Extras from an over-delivering source, and anything that arrives
        // after cancellation, go straight back.
        let mut returned = Vec::new();
        for message in messages {
            if token.is_cancelled() {
                returned.push(message.ack_id);
                continue;
            }
            let Some(permit) = slots.pop() else {
                returned.push(message.ack_id);
                continue;
            };
            stats.record_received();
            tracing::debug!(message_id = %message.message_id, bytes = message.data.len(), "received message");

            let ack = AckHandle::new(
                message.ack_id.clone(),
                message.message_id.clone(),
                source.clone(),
                stats.clone(),
                permit,
            );
            match settings.dispatch {
                DispatchMode::Ordered => handler.on_message(message, ack).await,
                DispatchMode::Concurrent => {
                    let handler = handler.clone();
                    callbacks.spawn(async move { handler.on_message(message, ack).await });
                }
            }
        }

        if !returned.is_empty() {
            tracing::warn!(%subscription, count = returned.len(), "nacking undispatched deliveries");
            if let Err(e) = source.nack(returned).await {
                tracing::warn!(%subscription, error = %e, "nack of undispatched deliveries failed");
            }
        }
        // Unused slots in `slots` are released here.
    };

    callbacks.close();
    callbacks.wait().await;
    tracing::info!(%subscription, outcome = ?outcome, "streaming pull stopped");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_storage_memory::MemorySource;
    use std::sync::Mutex;

    /// Acks everything, remembering payloads in arrival order.
    struct Collect {
        seen: Mutex<Vec<String>>,
    }

    impl MessageHandler for Collect {
        fn on_message(
            &self,
            message: ReceivedMessage,
            ack: AckHandle,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                self.seen
                    .lock()
                    .unwrap()
                    .push(String::from_utf8(message.data).unwrap());
                ack.ack().await.unwrap();
            })
        }
    }

    /// Never settles: handles are parked so their slots stay taken.
    struct Hold {
        parked: Mutex<Vec<AckHandle>>,
    }

    impl MessageHandler for Hold {
        fn on_message(
            &self,
            _message: ReceivedMessage,
            ack: AckHandle,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                self.parked.lock().unwrap().push(ack);
            })
        }
    }

    fn settings(max_outstanding: usize, dispatch: DispatchMode) -> SubscriberSettings {
        SubscriberSettings {
            max_outstanding,
            max_per_pull: max_outstanding,
            dispatch,
            retry_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_ordered_dispatch_preserves_arrival_order() {
        let source = Arc::new(MemorySource::new("projects/p/subscriptions/s"));
        for i in 0..25 {
            source.publish(format!("m{i}"));
        }
        source.close();

        let handler = Arc::new(Collect { seen: Mutex::new(Vec::new()) });
        let stats = Arc::new(PipelineStats::default());
        let mut pull = subscribe(
            source.clone(),
            settings(10, DispatchMode::Ordered),
            handler.clone(),
            stats.clone(),
        );

        assert_eq!(pull.result(None).await, PullOutcome::Completed);
        let expected: Vec<String> = (0..25).map(|i| format!("m{i}")).collect();
        assert_eq!(*handler.seen.lock().unwrap(), expected);
        assert_eq!(stats.snapshot().acked, 25);
        assert_eq!(source.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_outstanding_never_exceeds_cap() {
        let source = Arc::new(MemorySource::new("projects/p/subscriptions/s"));
        for i in 0..50 {
            source.publish(format!("m{i}"));
        }

        let handler = Arc::new(Hold { parked: Mutex::new(Vec::new()) });
        let stats = Arc::new(PipelineStats::default());
        let pull = subscribe(
            source.clone(),
            settings(10, DispatchMode::Concurrent),
            handler.clone(),
            stats.clone(),
        );

        // Let the loop run until it is starved of permits.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(source.outstanding(), 10);
        assert_eq!(source.max_outstanding_seen(), 10);
        assert_eq!(stats.snapshot().received, 10);

        // Acking frees slots and lets the next deliveries through, still capped.
        let settled: Vec<AckHandle> = handler.parked.lock().unwrap().drain(..3).collect();
        for ack in settled {
            ack.ack().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.snapshot().received, 13);
        assert_eq!(source.outstanding(), 10);
        assert_eq!(source.max_outstanding_seen(), 10);

        assert_eq!(pull.stop().await, PullOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_timeout_then_stop() {
        let source = Arc::new(MemorySource::new("projects/p/subscriptions/idle"));
        let handler = Arc::new(Collect { seen: Mutex::new(Vec::new()) });
        let mut pull = subscribe(
            source,
            settings(10, DispatchMode::Concurrent),
            handler,
            Arc::new(PipelineStats::default()),
        );

        assert_eq!(
            pull.result(Some(Duration::from_millis(30))).await,
            PullOutcome::TimedOut
        );
        assert_eq!(pull.stop().await, PullOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_retryable_error_is_retried_fatal_error_fails() {
        let source = Arc::new(MemorySource::new("projects/p/subscriptions/s"));
        source.fail_next_pull(ConnectorError::io("unavailable"));
        source.publish("after-retry");

        let handler = Arc::new(Collect { seen: Mutex::new(Vec::new()) });
        let mut pull = subscribe(
            source.clone(),
            settings(10, DispatchMode::Ordered),
            handler.clone(),
            Arc::new(PipelineStats::default()),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*handler.seen.lock().unwrap(), vec!["after-retry".to_string()]);

        source.fail_next_pull(ConnectorError::not_found("subscription deleted"));
        let outcome = pull.result(Some(Duration::from_secs(5))).await;
        assert!(matches!(outcome, PullOutcome::Failed(reason) if reason.contains("subscription deleted")));
    }

    #[tokio::test]
    async fn test_dropped_handle_leaves_message_for_redelivery() {
        let source = Arc::new(MemorySource::new("projects/p/subscriptions/s"));
        source.publish("once");
        source.close();

        struct DropIt;
        impl MessageHandler for DropIt {
            fn on_message(
                &self,
                _message: ReceivedMessage,
                _ack: AckHandle,
            ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
                Box::pin(async {})
            }
        }

        let mut pull = subscribe(
            source.clone(),
            settings(1, DispatchMode::Ordered),
            Arc::new(DropIt),
            Arc::new(PipelineStats::default()),
        );
        assert_eq!(pull.result(None).await, PullOutcome::Completed);
        assert!(source.acked().is_empty());
        assert!(source.nacked().is_empty());
        assert_eq!(source.outstanding(), 1);
    }
}
