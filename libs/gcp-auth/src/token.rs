use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use relay_api::ConnectorError;

use crate::http::{check_status, send_error};

const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// ═══════════════════════════════════════════════════════════════
//  AuthConfig
// ═══════════════════════════════════════════════════════════════

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Fixed bearer token. Takes precedence over the metadata server.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Send requests without credentials (local emulators).
    #[serde(default)]
    pub anonymous: bool,

    #[serde(default = "default_metadata_endpoint")]
    pub metadata_endpoint: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            anonymous: false,
            metadata_endpoint: default_metadata_endpoint(),
        }
    }
}

fn default_metadata_endpoint() -> String {
    "http://metadata.google.internal".into()
}

// ═══════════════════════════════════════════════════════════════
//  TokenProvider
// ═══════════════════════════════════════════════════════════════

/// Where bearer tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Anonymous,
    Static(String),
    /// GCE / GKE / Cloud Run metadata server.
    Metadata { endpoint: String },
}

impl TokenSource {
    /// `anonymous` wins, then an explicit token, then the metadata server.
    pub fn from_config(config: &AuthConfig) -> Self {
        if config.anonymous {
            return TokenSource::Anonymous;
        }
        match config.access_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => TokenSource::Static(token.to_owned()),
            _ => TokenSource::Metadata {
                endpoint: config.metadata_endpoint.trim_end_matches('/').to_owned(),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

/// Hands out bearer tokens, caching metadata-server tokens until shortly
/// before they expire.
pub struct TokenProvider {
    source: TokenSource,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(source: TokenSource, http: reqwest::Client) -> Self {
        Self {
            source,
            http,
            cached: Mutex::new(None),
        }
    }

    /// Current token, `None` for anonymous access.
    pub async fn token(&self) -> Result<Option<String>, ConnectorError> {
        match &self.source {
            TokenSource::Anonymous => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Metadata { endpoint } => {
                let mut cached = self.cached.lock().await;
                if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
                    return Ok(Some(token.value.clone()));
                }
                let fresh = self.fetch_metadata_token(endpoint).await?;
                let value = fresh.value.clone();
                *cached = Some(fresh);
                Ok(Some(value))
            }
        }
    }

    /// Attach the bearer token (if any) to `request`.
    pub async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ConnectorError> {
        Ok(match self.token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn fetch_metadata_token(&self, endpoint: &str) -> Result<CachedToken, ConnectorError> {
        let url = format!("{endpoint}{METADATA_TOKEN_PATH}");
        let resp = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| send_error("metadata token", e).with_context("no credentials available"))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| send_error("metadata token", e))?;
        check_status("metadata token", status, &body)
            .map_err(|e| ConnectorError::auth(e.message))?;

        let token: MetadataToken = serde_json::from_str(&body)
            .map_err(|e| ConnectorError::auth(format!("metadata token: {e}")))?;
        tracing::debug!(expires_in = token.expires_in, "fetched access token from metadata server");
        Ok(CachedToken {
            value: token.access_token,
            refresh_at: refresh_deadline(Instant::now(), token.expires_in),
        })
    }
}

fn refresh_deadline(now: Instant, expires_in_secs: u64) -> Instant {
    now + Duration::from_secs(expires_in_secs).saturating_sub(EXPIRY_MARGIN)
}
