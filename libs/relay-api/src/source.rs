use std::future::Future;
use std::pin::Pin;

use crate::error::ConnectorError;
use crate::message::ReceivedMessage;

/// Pull-based message source (a single subscription).
///
/// The engine owns flow control and callback dispatch; a source only knows
/// how to fetch a batch and how to settle individual deliveries.
pub trait PullSource: Send + Sync {
    /// Fully qualified subscription name, used for logging.
    fn subscription(&self) -> &str;

    /// Fetch up to `max_messages` messages.
    ///
    /// May wait for messages to arrive; an empty batch is a valid answer.
    /// `Ok(None)` means the source is closed and will never deliver again.
    fn pull(
        &self,
        max_messages: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<ReceivedMessage>>, ConnectorError>> + Send + '_>>;

    /// Acknowledge deliveries: the source must not redeliver them.
    fn acknowledge(
        &self,
        ack_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + '_>>;

    /// Negative acknowledge: make the deliveries available for redelivery now.
    fn nack(
        &self,
        ack_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + '_>>;
}
