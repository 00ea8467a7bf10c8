use relay_api::ConnectorError;

/// Why an inbound payload could not be turned into a `Record`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessageError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("field 'timestamp' is missing")]
    MissingTimestamp,

    #[error("field 'timestamp' is not numeric (got {0})")]
    NonNumericTimestamp(&'static str),

    #[error("timestamp {0} is outside the supported calendar range")]
    TimestampOutOfRange(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedMessageError),

    #[error("append of message {message_id} failed after {attempts} attempt(s): {source}")]
    Write {
        message_id: String,
        attempts: u32,
        source: ConnectorError,
    },

    #[error("relay queue closed")]
    QueueClosed,

    #[error("writer task failed: {0}")]
    WriterPanicked(String),

    #[error("writer did not drain within {0:?}")]
    DrainTimeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Add context to the error.
    ///
    /// For `Connector` variant, context is added to the inner `ConnectorError`.
    /// For `Config`, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            RelayError::Connector(e) => RelayError::Connector(e.with_context(ctx)),
            RelayError::Config(msg) => RelayError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}
