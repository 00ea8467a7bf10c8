use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use relay_api::{ConnectorError, PullSource, ReceivedMessage};

// ═══════════════════════════════════════════════════════════════
//  MemorySource
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    data: Vec<u8>,
    attempt: u32,
}

#[derive(Debug, Default)]
struct SourceState {
    backlog: VecDeque<Stored>,
    /// Delivered, not yet settled. Keyed by ack id.
    outstanding: HashMap<String, Stored>,
    max_outstanding_seen: usize,
    acked: Vec<String>,
    nacked: Vec<String>,
    failures: VecDeque<ConnectorError>,
    closed: bool,
    next_message: u64,
    next_ack: u64,
    pulls: u64,
}

/// Subscription backed by an in-memory backlog.
///
/// Every delivery gets a fresh ack id. Nacked messages go back to the end of
/// the backlog; unsettled ones stay outstanding until `expire_outstanding`
/// simulates the ack deadline passing. `pull` waits while the backlog is
/// empty and returns `None` once the source is closed and drained.
pub struct MemorySource {
    subscription: String,
    state: Mutex<SourceState>,
    wakeup: Notify,
}

impl MemorySource {
    pub fn new(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            state: Mutex::new(SourceState::default()),
            wakeup: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message to the backlog. Returns its message id.
    pub fn publish(&self, data: impl Into<Vec<u8>>) -> String {
        let message_id = {
            let mut state = self.state();
            state.next_message += 1;
            let message_id = state.next_message.to_string();
            state.backlog.push_back(Stored {
                message_id: message_id.clone(),
                data: data.into(),
                attempt: 0,
            });
            message_id
        };
        self.wakeup.notify_one();
        message_id
    }

    pub fn publish_json(&self, value: &serde_json::Value) -> String {
        self.publish(value.to_string())
    }

    /// End of stream: once the backlog is empty, `pull` returns `None`.
    pub fn close(&self) {
        self.state().closed = true;
        self.wakeup.notify_one();
    }

    /// Make the next `pull` fail with `err`. Errors queue up in order.
    pub fn fail_next_pull(&self, err: ConnectorError) {
        self.state().failures.push_back(err);
        self.wakeup.notify_one();
    }

    /// Move every unsettled delivery back to the backlog, as if its ack
    /// deadline had expired.
    pub fn expire_outstanding(&self) -> usize {
        let expired = {
            let mut state = self.state();
            let mut expired: Vec<Stored> = state.outstanding.drain().map(|(_, m)| m).collect();
            expired.sort_by_key(|m| m.message_id.parse::<u64>().unwrap_or(u64::MAX));
            let count = expired.len();
            state.backlog.extend(expired);
            count
        };
        if expired > 0 {
            self.wakeup.notify_one();
        }
        expired
    }

    pub fn outstanding(&self) -> usize {
        self.state().outstanding.len()
    }

    pub fn max_outstanding_seen(&self) -> usize {
        self.state().max_outstanding_seen
    }

    /// Messages waiting for delivery.
    pub fn backlog(&self) -> usize {
        self.state().backlog.len()
    }

    /// Message ids in acknowledgement order.
    pub fn acked(&self) -> Vec<String> {
        self.state().acked.clone()
    }

    /// Message ids in nack order.
    pub fn nacked(&self) -> Vec<String> {
        self.state().nacked.clone()
    }

    /// Number of `pull` calls made so far.
    pub fn pulls(&self) -> u64 {
        self.state().pulls
    }

    /// `Some(batch)` when something could be delivered, `None` when the
    /// source is closed and drained, `Err` for an injected failure.
    /// Waiting is the caller's job.
    fn try_pull(&self, max_messages: usize) -> Option<Result<Option<Vec<ReceivedMessage>>, ConnectorError>> {
        let mut state = self.state();
        if let Some(err) = state.failures.pop_front() {
            return Some(Err(err));
        }
        if state.backlog.is_empty() {
            return state.closed.then_some(Ok(None));
        }

        let take = max_messages.min(state.backlog.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            let Some(mut stored) = state.backlog.pop_front() else {
                break;
            };
            stored.attempt += 1;
            state.next_ack += 1;
            let ack_id = format!("ack-{}", state.next_ack);

            let mut message = ReceivedMessage::new(ack_id.clone(), stored.message_id.clone(), stored.data.clone());
            message.delivery_attempt = Some(stored.attempt);
            batch.push(message);
            state.outstanding.insert(ack_id, stored);
        }
        state.max_outstanding_seen = state.max_outstanding_seen.max(state.outstanding.len());
        Some(Ok(Some(batch)))
    }

    fn settle(&self, ack_ids: Vec<String>, requeue: bool) {
        let mut state = self.state();
        for ack_id in ack_ids {
            let Some(stored) = state.outstanding.remove(&ack_id) else {
                tracing::debug!(%ack_id, "unknown or expired ack id");
                continue;
            };
            if requeue {
                state.nacked.push(stored.message_id.clone());
                state.backlog.push_back(stored);
            } else {
                state.acked.push(stored.message_id);
            }
        }
    }
}

impl PullSource for MemorySource {
    fn subscription(&self) -> &str {
        &self.subscription
    }

    fn pull(
        &self,
        max_messages: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<ReceivedMessage>>, ConnectorError>> + Send + '_>> {
        Box::pin(async move {
            self.state().pulls += 1;
            loop {
                if let Some(result) = self.try_pull(max_messages) {
                    return result;
                }
                self.wakeup.notified().await;
            }
        })
    }

    fn acknowledge(
        &self,
        ack_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + '_>> {
        Box::pin(async move {
            self.settle(ack_ids, false);
            Ok(())
        })
    }

    fn nack(
        &self,
        ack_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + '_>> {
        Box::pin(async move {
            self.settle(ack_ids, true);
            self.wakeup.notify_one();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pull_respects_max_and_tracks_outstanding() {
        let source = MemorySource::new("projects/p/subscriptions/s");
        for i in 0..5 {
            source.publish(format!("m{i}"));
        }

        let batch = source.pull(3).await.unwrap().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].data, b"m0");
        assert_eq!(batch[0].delivery_attempt, Some(1));
        assert_eq!(source.outstanding(), 3);
        assert_eq!(source.backlog(), 2);

        source.acknowledge(vec![batch[0].ack_id.clone()]).await.unwrap();
        assert_eq!(source.acked(), vec![batch[0].message_id.clone()]);
        assert_eq!(source.outstanding(), 2);
        assert_eq!(source.max_outstanding_seen(), 3);
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_new_ack_id() {
        let source = MemorySource::new("s");
        let id = source.publish("x");

        let first = source.pull(1).await.unwrap().unwrap().remove(0);
        source.nack(vec![first.ack_id.clone()]).await.unwrap();
        let second = source.pull(1).await.unwrap().unwrap().remove(0);

        assert_eq!(second.message_id, id);
        assert_ne!(second.ack_id, first.ack_id);
        assert_eq!(second.delivery_attempt, Some(2));
        assert_eq!(source.nacked(), vec![id]);

        // The first ack id is stale now.
        source.acknowledge(vec![first.ack_id]).await.unwrap();
        assert!(source.acked().is_empty());
    }

    #[tokio::test]
    async fn test_expire_outstanding_redelivers() {
        let source = MemorySource::new("s");
        source.publish("a");
        source.publish("b");
        source.pull(10).await.unwrap().unwrap();

        assert_eq!(source.expire_outstanding(), 2);
        let again = source.pull(10).await.unwrap().unwrap();
        let data: Vec<&[u8]> = again.iter().map(|m| m.data.as_slice()).collect();
        assert_eq!(data, vec![b"a".as_slice(), b"b".as_slice()]);
    }

    #[tokio::test]
    async fn test_closed_source_ends_after_backlog() {
        let source = MemorySource::new("s");
        source.publish("last");
        source.close();

        assert_eq!(source.pull(10).await.unwrap().unwrap().len(), 1);
        assert!(source.pull(10).await.unwrap().is_none());
        assert_eq!(source.pulls(), 2);
    }

    #[tokio::test]
    async fn test_pull_waits_for_publish() {
        let source = std::sync::Arc::new(MemorySource::new("s"));
        let waiting = {
            let source = source.clone();
            tokio::spawn(async move { source.pull(1).await })
        };
        tokio::task::yield_now().await;
        source.publish("late");

        let batch = waiting.await.unwrap().unwrap().unwrap();
        assert_eq!(batch[0].data, b"late");
    }

    #[tokio::test]
    async fn test_injected_failure_comes_first() {
        let source = MemorySource::new("s");
        source.publish("x");
        source.fail_next_pull(ConnectorError::io("unavailable"));

        assert!(source.pull(1).await.unwrap_err().is_retryable());
        assert_eq!(source.pull(1).await.unwrap().unwrap().len(), 1);
    }
}
