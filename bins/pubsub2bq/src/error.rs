#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("{0}")]
    Relay(#[from] relay_engine::RelayError),

    #[error("connector: {0}")]
    Connector(#[from] relay_api::ConnectorError),
}
