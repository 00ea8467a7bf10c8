use std::collections::HashMap;

/// A message delivered by a `PullSource`, not yet acknowledged.
///
/// The source keeps ownership of the delivery until `ack_id` is acknowledged;
/// an unacknowledged message is redelivered once its ack deadline expires.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    /// Opaque handle used to ack / nack this particular delivery.
    pub ack_id: String,
    /// Server-assigned message id (stable across redeliveries).
    pub message_id: String,
    /// Raw payload bytes.
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// RFC 3339 publish time as reported by the source, if any.
    pub publish_time: Option<String>,
    /// Delivery attempt counter (only set when the source tracks it).
    pub delivery_attempt: Option<u32>,
}

impl ReceivedMessage {
    pub fn new(ack_id: impl Into<String>, message_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            ack_id: ack_id.into(),
            message_id: message_id.into(),
            data,
            attributes: HashMap::new(),
            publish_time: None,
            delivery_attempt: None,
        }
    }
}
