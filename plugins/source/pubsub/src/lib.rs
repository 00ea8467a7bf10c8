use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use relay_api::{ConnectorError, PullSource, ReceivedMessage};
use relay_gcp_auth::{TokenProvider, build_client, check_status, send_error};

/// Env var set by `gcloud beta emulators pubsub env-init`.
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

// ═══════════════════════════════════════════════════════════════
//  PubSubConfig
// ═══════════════════════════════════════════════════════════════

/// `[pubsub]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PubSubConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Upper bound for one HTTP call, including the long-polling `pull`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String {
    "https://pubsub.googleapis.com".into()
}
fn default_request_timeout_secs() -> u64 {
    90
}

impl PubSubConfig {
    /// Point at a local emulator (`host:port`). Emulators speak plain HTTP.
    pub fn with_emulator(mut self, host: &str) -> Self {
        let host = host.trim().trim_end_matches('/');
        self.endpoint = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_owned()
        } else {
            format!("http://{host}")
        };
        self
    }
}

/// Full subscription resource name. Names already in
/// `projects/{p}/subscriptions/{s}` form are kept as they are.
pub fn subscription_path(project: &str, subscription: &str) -> String {
    if subscription.starts_with("projects/") {
        subscription.to_owned()
    } else {
        format!("projects/{project}/subscriptions/{subscription}")
    }
}

// ═══════════════════════════════════════════════════════════════
//  Wire types
// ═══════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    message: WireMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: String,
    message_id: String,
    #[serde(default)]
    publish_time: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// Decode a `subscriptions.pull` response body.
///
/// A payload that is not valid base64 is passed through undecoded; the
/// receiver then rejects it as malformed.
fn decode_pull_response(body: &str) -> Result<Vec<ReceivedMessage>, ConnectorError> {
    let response: PullResponse = serde_json::from_str(body)
        .map_err(|e| ConnectorError::format(format!("pull response: {e}")))?;

    Ok(response
        .received_messages
        .into_iter()
        .map(|wire| {
            let data = match base64::engine::general_purpose::STANDARD.decode(&wire.message.data) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(message_id = %wire.message.message_id, error = %e, "payload is not base64");
                    wire.message.data.into_bytes()
                }
            };
            ReceivedMessage {
                ack_id: wire.ack_id,
                message_id: wire.message.message_id,
                data,
                attributes: wire.message.attributes,
                publish_time: wire.message.publish_time,
                delivery_attempt: wire.delivery_attempt,
            }
        })
        .collect())
}

// ═══════════════════════════════════════════════════════════════
//  PubSubSource
// ═══════════════════════════════════════════════════════════════

/// Pub/Sub subscription over the v1 REST API.
///
/// `pull` never reports end of stream: a subscription has no end.
pub struct PubSubSource {
    http: reqwest::Client,
    endpoint: String,
    subscription: String,
    tokens: Arc<TokenProvider>,
}

impl PubSubSource {
    pub fn new(
        config: &PubSubConfig,
        subscription: String,
        tokens: Arc<TokenProvider>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            http: build_client(Duration::from_secs(config.request_timeout_secs))?,
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
            subscription,
            tokens,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/v1/{}:{method}", self.endpoint, self.subscription)
    }

    /// POST a JSON body to `{subscription}:{method}` and return the response body.
    async fn call(&self, method: &str, body: serde_json::Value) -> Result<String, ConnectorError> {
        let ctx = format!("{}:{method}", self.subscription);
        let request = self.tokens.authorize(self.http.post(self.method_url(method))).await?;
        let resp = request
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(&ctx, e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| send_error(&ctx, e))?;
        check_status(&ctx, status, &text)?;
        Ok(text)
    }
}

impl PullSource for PubSubSource {
    fn subscription(&self) -> &str {
        &self.subscription
    }

    fn pull(
        &self,
        max_messages: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<ReceivedMessage>>, ConnectorError>> + Send + '_>> {
        Box::pin(async move {
            let body = self.call("pull", json!({ "maxMessages": max_messages })).await?;
            let messages = decode_pull_response(&body)?;
            tracing::debug!(subscription = %self.subscription, count = messages.len(), "pulled");
            Ok(Some(messages))
        })
    }

    fn acknowledge(
        &self,
        ack_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + '_>> {
        Box::pin(async move {
            if ack_ids.is_empty() {
                return Ok(());
            }
            self.call("acknowledge", json!({ "ackIds": ack_ids })).await?;
            Ok(())
        })
    }

    /// Deadline 0 makes the messages immediately available for redelivery.
    fn nack(
        &self,
        ack_ids: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectorError>> + Send + '_>> {
        Box::pin(async move {
            if ack_ids.is_empty() {
                return Ok(());
            }
            self.call(
                "modifyAckDeadline",
                json!({ "ackIds": ack_ids, "ackDeadlineSeconds": 0 }),
            )
            .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_api::ErrorKind;
    use relay_gcp_auth::TokenSource;

    #[test]
    fn test_subscription_path() {
        assert_eq!(
            subscription_path("proj", "events-sub"),
            "projects/proj/subscriptions/events-sub"
        );
        assert_eq!(
            subscription_path("proj", "projects/other/subscriptions/s"),
            "projects/other/subscriptions/s"
        );
    }

    #[test]
    fn test_emulator_endpoint() {
        let config = PubSubConfig::default().with_emulator("localhost:8085");
        assert_eq!(config.endpoint, "http://localhost:8085");
        let config = PubSubConfig::default().with_emulator("https://emu.local/");
        assert_eq!(config.endpoint, "https://emu.local");
    }

    #[test]
    fn test_method_url() {
        let tokens = Arc::new(TokenProvider::new(TokenSource::Anonymous, reqwest::Client::new()));
        let source = PubSubSource::new(
            &PubSubConfig::default(),
            subscription_path("proj", "sub"),
            tokens,
        )
        .unwrap();
        assert_eq!(
            source.method_url("pull"),
            "https://pubsub.googleapis.com/v1/projects/proj/subscriptions/sub:pull"
        );
        assert_eq!(source.subscription(), "projects/proj/subscriptions/sub");
    }

    #[test]
    fn test_decode_pull_response() {
        // {"timestamp": 1700000000} in base64.
        let body = r#"{
            "receivedMessages": [{
                "ackId": "A1",
                "message": {
                    "data": "eyJ0aW1lc3RhbXAiOiAxNzAwMDAwMDAwfQ==",
                    "messageId": "42",
                    "publishTime": "2023-11-14T22:13:21.000Z",
                    "attributes": {"origin": "sensor"}
                },
                "deliveryAttempt": 2
            }]
        }"#;
        let messages = decode_pull_response(body).unwrap();
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.ack_id, "A1");
        assert_eq!(m.message_id, "42");
        assert_eq!(m.data, br#"{"timestamp": 1700000000}"#);
        assert_eq!(m.attributes["origin"], "sensor");
        assert_eq!(m.publish_time.as_deref(), Some("2023-11-14T22:13:21.000Z"));
        assert_eq!(m.delivery_attempt, Some(2));
    }

    #[test]
    fn test_empty_pull_response() {
        assert!(decode_pull_response("{}").unwrap().is_empty());
    }

    #[test]
    fn test_message_without_data() {
        let body = r#"{"receivedMessages": [{"ackId": "A", "message": {"messageId": "1"}}]}"#;
        let messages = decode_pull_response(body).unwrap();
        assert!(messages[0].data.is_empty());
        assert_eq!(messages[0].delivery_attempt, None);
    }

    #[test]
    fn test_invalid_response_is_format_error() {
        let err = decode_pull_response("<html>").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Format);
    }

    #[tokio::test]
    async fn test_empty_ack_is_noop() {
        let tokens = Arc::new(TokenProvider::new(TokenSource::Anonymous, reqwest::Client::new()));
        // Unroutable endpoint: any real request would fail.
        let config = PubSubConfig {
            endpoint: "http://127.0.0.1:9".into(),
            request_timeout_secs: 1,
        };
        let source = PubSubSource::new(&config, "projects/p/subscriptions/s".into(), tokens).unwrap();
        source.acknowledge(Vec::new()).await.unwrap();
        source.nack(Vec::new()).await.unwrap();
    }
}
