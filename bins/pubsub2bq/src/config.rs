use std::path::Path;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use relay_engine::PipelineConfig;
use relay_gcp_auth::AuthConfig;
use relay_source_pubsub::{PubSubConfig, subscription_path};
use relay_storage_bigquery::BigQueryConfig;

use crate::error::AppError;

/// Config file picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "pubsub2bq.toml";

#[derive(Parser, Debug)]
#[command(name = "pubsub2bq", about = "Relay Pub/Sub messages into a BigQuery table")]
pub struct Cli {
    /// Google Cloud project ID
    pub project_id: String,

    /// Pub/Sub subscription name
    pub subscription_name: String,

    /// BigQuery dataset ID
    pub dataset_id: String,

    /// BigQuery table ID
    pub table_id: String,

    /// TOML config file (default: ./pubsub2bq.toml when present)
    #[arg(long, env = "PUBSUB2BQ_CONFIG")]
    pub config: Option<String>,

    /// Stop listening after this many seconds (default: run until interrupted)
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<f64>,

    /// Ceiling on outstanding unacknowledged messages
    #[arg(long)]
    pub max_messages: Option<usize>,

    /// OAuth2 access token for both APIs
    #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,
}

// ---- TOML Config ----

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub bigquery: BigQueryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl FileConfig {
    pub fn load(path: &str) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path).map_err(|e| AppError::Config {
            context: "read",
            detail: format!("'{path}': {e}"),
        })?;
        toml::from_str(&content).map_err(|e| AppError::Config {
            context: "parse",
            detail: format!("'{path}': {e}"),
        })
    }

    /// An explicit path must exist; the default one is optional.
    pub fn discover(explicit: Option<&str>) -> Result<(Self, Option<String>), AppError> {
        match explicit {
            Some(path) => Ok((Self::load(path)?, Some(path.to_owned()))),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Ok((Self::load(DEFAULT_CONFIG_PATH)?, Some(DEFAULT_CONFIG_PATH.to_owned())))
            }
            None => Ok((Self::default(), None)),
        }
    }
}

// ---- Effective settings ----

/// Everything a run needs, after defaults < file < environment < flags.
#[derive(Debug)]
pub struct Settings {
    pub project: String,
    /// Full `projects/{p}/subscriptions/{s}` name.
    pub subscription: String,
    pub dataset: String,
    pub table: String,
    pub timeout: Option<Duration>,
    pub pipeline: PipelineConfig,
    pub pubsub: PubSubConfig,
    pub bigquery: BigQueryConfig,
    pub auth: AuthConfig,
    /// Pub/Sub goes to a local emulator without credentials.
    pub emulator: bool,
}

impl Settings {
    pub fn resolve(cli: Cli, file: FileConfig, emulator_host: Option<&str>) -> Result<Self, AppError> {
        let FileConfig {
            mut pipeline,
            mut pubsub,
            bigquery,
            mut auth,
        } = file;

        if let Some(max) = cli.max_messages {
            pipeline.flow_control.max_messages = max;
        }
        pipeline.validate().map_err(|e| AppError::Config {
            context: "validate",
            detail: e.to_string(),
        })?;

        if let Some(token) = cli.access_token {
            auth.access_token = Some(token);
        }

        let emulator = match emulator_host.map(str::trim) {
            Some(host) if !host.is_empty() => {
                pubsub = pubsub.with_emulator(host);
                true
            }
            _ => false,
        };

        let timeout = cli.timeout.map(parse_timeout).transpose()?;

        Ok(Self {
            subscription: subscription_path(&cli.project_id, &cli.subscription_name),
            project: cli.project_id,
            dataset: cli.dataset_id,
            table: cli.table_id,
            timeout,
            pipeline,
            pubsub,
            bigquery,
            auth,
            emulator,
        })
    }
}

fn parse_timeout(secs: f64) -> Result<Duration, AppError> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| AppError::Config {
            context: "timeout",
            detail: format!("expected a positive number of seconds, got {secs}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_engine::config::{DispatchMode, MalformedPolicy};
    use std::io::Write;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["pubsub2bq", "proj", "events-sub", "events", "raw"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_four_positionals_only() {
        let settings = Settings::resolve(cli(&[]), FileConfig::default(), None).unwrap();
        assert_eq!(settings.project, "proj");
        assert_eq!(settings.subscription, "projects/proj/subscriptions/events-sub");
        assert_eq!(settings.dataset, "events");
        assert_eq!(settings.table, "raw");
        assert_eq!(settings.timeout, None);
        assert_eq!(settings.pipeline.flow_control.max_messages, 10);
        assert!(!settings.emulator);
    }

    #[test]
    fn test_missing_positional_rejected() {
        assert!(Cli::try_parse_from(["pubsub2bq", "proj", "sub", "dataset"]).is_err());
    }

    #[test]
    fn test_file_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [flow_control]
            max_messages = 4
            dispatch = "ordered"

            [pull]
            malformed = "nack"

            [pubsub]
            endpoint = "http://localhost:8085"

            [bigquery]
            poll_interval_ms = 100
            location = "EU"

            [auth]
            access_token = "from-file"
            "#
        )
        .unwrap();

        let config = FileConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.pipeline.flow_control.max_messages, 4);
        assert_eq!(config.pipeline.flow_control.dispatch, DispatchMode::Ordered);
        assert_eq!(config.pipeline.pull.malformed, MalformedPolicy::Nack);
        assert_eq!(config.pubsub.endpoint, "http://localhost:8085");
        assert_eq!(config.bigquery.poll_interval_ms, 100);
        assert_eq!(config.bigquery.location.as_deref(), Some("EU"));
        assert_eq!(config.auth.access_token.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = FileConfig::default();
        file.pipeline.flow_control.max_messages = 4;
        file.auth.access_token = Some("from-file".into());

        let settings = Settings::resolve(
            cli(&["--max-messages", "7", "--access-token", "from-flag", "--timeout", "2.5"]),
            file,
            None,
        )
        .unwrap();
        assert_eq!(settings.pipeline.flow_control.max_messages, 7);
        assert_eq!(settings.auth.access_token.as_deref(), Some("from-flag"));
        assert_eq!(settings.timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Settings::resolve(cli(&["--max-messages", "0"]), FileConfig::default(), None)
            .unwrap_err();
        assert!(matches!(err, AppError::Config { context: "validate", .. }));

        let err = Settings::resolve(cli(&["--timeout", "0"]), FileConfig::default(), None)
            .unwrap_err();
        assert!(matches!(err, AppError::Config { context: "timeout", .. }));

        let err = Settings::resolve(cli(&["--timeout=-1"]), FileConfig::default(), None)
            .unwrap_err();
        assert!(matches!(err, AppError::Config { context: "timeout", .. }));
    }

    #[test]
    fn test_emulator_host() {
        let settings =
            Settings::resolve(cli(&[]), FileConfig::default(), Some("localhost:8085")).unwrap();
        assert!(settings.emulator);
        assert_eq!(settings.pubsub.endpoint, "http://localhost:8085");

        let settings = Settings::resolve(cli(&[]), FileConfig::default(), Some("  ")).unwrap();
        assert!(!settings.emulator);
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let err = FileConfig::discover(Some("/nonexistent/pubsub2bq.toml")).unwrap_err();
        assert!(matches!(err, AppError::Config { context: "read", .. }));
    }

    #[test]
    fn test_unparsable_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[flow_control]\nmax_messages = \"ten\"\n").unwrap();
        let err = FileConfig::load(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, AppError::Config { context: "parse", .. }));
    }
}
