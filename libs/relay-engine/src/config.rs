use std::time::Duration;

use serde::Deserialize;

use crate::error::RelayError;

/// Pipeline tuning, parsed from TOML. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub flow_control: FlowControlConfig,

    #[serde(default)]
    pub pull: PullConfig,

    #[serde(default)]
    pub writer: WriterConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

// ═══════════════════════════════════════════════════════════════
//  Flow control
// ═══════════════════════════════════════════════════════════════

/// How received messages are handed to the receiver callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One task per message, at most `max_messages` at a time.
    #[default]
    Concurrent,
    /// Inline, in arrival order.
    Ordered,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowControlConfig {
    /// Ceiling on delivered-but-unacknowledged messages.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default)]
    pub dispatch: DispatchMode,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            dispatch: DispatchMode::default(),
        }
    }
}

fn default_max_messages() -> usize {
    10
}

// ═══════════════════════════════════════════════════════════════
//  Pull loop
// ═══════════════════════════════════════════════════════════════

/// What the receiver does with a payload it cannot parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPolicy {
    /// Neither ack nor nack; the source redelivers after the ack deadline.
    #[default]
    Ignore,
    /// Nack right away so the source redelivers immediately.
    Nack,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullConfig {
    /// Upper bound for a single pull request (never above `max_messages`).
    #[serde(default = "default_max_messages_per_pull")]
    pub max_messages_per_pull: usize,
    /// Pause after a retryable pull error.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub malformed: MalformedPolicy,
    /// Ack deadline of the subscription. An ignored delivery keeps its
    /// flow-control slot this long.
    #[serde(default = "default_ack_deadline_secs")]
    pub ack_deadline_secs: u64,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            max_messages_per_pull: default_max_messages_per_pull(),
            retry_backoff_ms: default_retry_backoff_ms(),
            malformed: MalformedPolicy::default(),
            ack_deadline_secs: default_ack_deadline_secs(),
        }
    }
}

impl PullConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_secs)
    }
}

fn default_max_messages_per_pull() -> usize {
    10
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_ack_deadline_secs() -> u64 {
    10
}

// ═══════════════════════════════════════════════════════════════
//  Writer
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Attempts per record, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl WriterConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    5000
}

// ═══════════════════════════════════════════════════════════════
//  Shutdown
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long the controller waits for the writer to drain before aborting it.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl PipelineConfig {
    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, RelayError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if self.flow_control.max_messages == 0 {
            return Err(RelayError::Config(
                "flow_control.max_messages must be at least 1".into(),
            ));
        }
        if self.pull.max_messages_per_pull == 0 {
            return Err(RelayError::Config(
                "pull.max_messages_per_pull must be at least 1".into(),
            ));
        }
        if self.pull.ack_deadline_secs == 0 {
            return Err(RelayError::Config(
                "pull.ack_deadline_secs must be at least 1".into(),
            ));
        }
        if self.writer.max_attempts == 0 {
            return Err(RelayError::Config(
                "writer.max_attempts must be at least 1".into(),
            ));
        }
        if self.writer.initial_backoff_ms > self.writer.max_backoff_ms {
            return Err(RelayError::Config(format!(
                "writer.initial_backoff_ms ({}) exceeds writer.max_backoff_ms ({})",
                self.writer.initial_backoff_ms, self.writer.max_backoff_ms
            )));
        }
        Ok(())
    }
}
