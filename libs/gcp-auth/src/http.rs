use std::time::Duration;

use reqwest::StatusCode;

use relay_api::ConnectorError;

/// Shared HTTP client with a per-request timeout.
pub fn build_client(request_timeout: Duration) -> Result<reqwest::Client, ConnectorError> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| ConnectorError::config(format!("HTTP client: {e}")))
}

/// Transport-level failure (connect, timeout, body read).
pub fn send_error(ctx: &str, e: reqwest::Error) -> ConnectorError {
    ConnectorError::io(format!("{ctx}: {e}"))
}

/// Classify a non-success response.
///
/// 401/403 → `Auth`, 404 → `NotFound`, 408/429/5xx → `Io` (retryable),
/// 400/409/412 → `Config`, anything else → `Logic`.
pub fn check_status(ctx: &str, status: StatusCode, body: &str) -> Result<(), ConnectorError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("{ctx}: HTTP {status}: {}", error_message(body));
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectorError::auth(message),
        StatusCode::NOT_FOUND => ConnectorError::not_found(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ConnectorError::io(message),
        s if s.is_server_error() => ConnectorError::io(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            ConnectorError::config(message)
        }
        _ => ConnectorError::logic(message),
    })
}

/// Google APIs wrap errors as `{"error": {"message": ..}}`; fall back to the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_owned())
}
