use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay_api::ReceivedMessage;

use crate::config::{MalformedPolicy, PullConfig};
use crate::error::RelayError;
use crate::normalize::parse_record;
use crate::queue::RelayProducer;
use crate::stats::PipelineStats;
use crate::subscriber::{AckHandle, MessageHandler};

/// Per-message callback: parse → normalize → enqueue → ack.
///
/// The ack is sent right after the record is queued, not after the
/// warehouse write: a crash between the two loses the record, a crash
/// before the enqueue gets it redelivered.
///
/// A malformed delivery left unsettled is parked until its ack deadline,
/// holding its flow-control slot for as long as the source counts it as
/// outstanding. Dropping the receiver lets go of every parked delivery.
pub struct Receiver {
    queue: RelayProducer,
    malformed: MalformedPolicy,
    ack_deadline: Duration,
    stats: Arc<PipelineStats>,
    parked: CancellationToken,
}

impl Receiver {
    pub fn new(queue: RelayProducer, config: &PullConfig, stats: Arc<PipelineStats>) -> Self {
        Self {
            queue,
            malformed: config.malformed,
            ack_deadline: config.ack_deadline(),
            stats,
            parked: CancellationToken::new(),
        }
    }

    /// Handle one delivery.
    ///
    /// `Err(Malformed)` means nothing was queued and nothing was acked.
    /// `Err(QueueClosed)` means the writer is gone; the delivery was nacked.
    pub async fn handle(&self, message: ReceivedMessage, ack: AckHandle) -> Result<(), RelayError> {
        let record = match parse_record(&message.message_id, &message.data) {
            Ok(record) => record,
            Err(e) => {
                self.stats.record_malformed();
                tracing::warn!(
                    message_id = %message.message_id,
                    error = %e,
                    policy = ?self.malformed,
                    "malformed message"
                );
                match self.malformed {
                    MalformedPolicy::Nack => {
                        if let Err(nack_err) = ack.nack().await {
                            tracing::warn!(message_id = %message.message_id, error = %nack_err, "nack failed");
                        }
                    }
                    MalformedPolicy::Ignore => self.park(ack),
                }
                return Err(e.into());
            }
        };

        if let Err(closed) = self.queue.push(record) {
            tracing::error!(message_id = %closed.0.message_id, "relay queue closed, nacking");
            if let Err(nack_err) = ack.nack().await {
                tracing::warn!(message_id = %message.message_id, error = %nack_err, "nack failed");
            }
            return Err(RelayError::QueueClosed);
        }
        self.stats.record_enqueued();
        tracing::debug!(message_id = %message.message_id, depth = self.queue.depth(), "enqueued");

        ack.ack().await?;
        Ok(())
    }

    /// Hold `ack` unsettled until the ack deadline passes or the receiver
    /// is dropped.
    fn park(&self, ack: AckHandle) {
        let deadline = self.ack_deadline;
        let released = self.parked.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    tracing::debug!(message_id = %ack.message_id(), "ack deadline passed, slot released");
                }
                _ = released.cancelled() => {}
            }
            drop(ack);
        });
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.parked.cancel();
    }
}

impl MessageHandler for Receiver {
    fn on_message(
        &self,
        message: ReceivedMessage,
        ack: AckHandle,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let message_id = message.message_id.clone();
            match self.handle(message, ack).await {
                Ok(()) | Err(RelayError::Malformed(_)) | Err(RelayError::QueueClosed) => {}
                Err(e) => {
                    tracing::warn!(%message_id, error = %e, "ack failed, message may be redelivered");
                }
            }
        })
    }
}
