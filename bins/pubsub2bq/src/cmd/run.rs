use std::sync::Arc;
use std::time::Duration;

use relay_engine::Controller;
use relay_gcp_auth::{TokenProvider, TokenSource, build_client};
use relay_source_pubsub::{EMULATOR_HOST_ENV, PubSubSource};
use relay_storage_bigquery::BigQueryWarehouse;

use crate::config::{Cli, FileConfig, Settings};
use crate::error::AppError;

/// Timeout for metadata-server token requests.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(cli: Cli) -> Result<(), AppError> {
    // --- Load config ---
    let (file, config_path) = FileConfig::discover(cli.config.as_deref())?;
    if let Some(path) = &config_path {
        tracing::info!(config = %path, "loaded config");
    }
    let emulator_host = std::env::var(EMULATOR_HOST_ENV).ok();
    let settings = Settings::resolve(cli, file, emulator_host.as_deref())?;

    // --- Credentials ---
    let token_http = build_client(TOKEN_REQUEST_TIMEOUT)?;
    let warehouse_tokens = Arc::new(TokenProvider::new(
        TokenSource::from_config(&settings.auth),
        token_http.clone(),
    ));
    let source_tokens = if settings.emulator {
        tracing::info!(endpoint = %settings.pubsub.endpoint, "using Pub/Sub emulator");
        Arc::new(TokenProvider::new(TokenSource::Anonymous, token_http))
    } else {
        warehouse_tokens.clone()
    };

    // --- Connectors ---
    let source = Arc::new(PubSubSource::new(
        &settings.pubsub,
        settings.subscription.clone(),
        source_tokens,
    )?);
    let warehouse = Arc::new(BigQueryWarehouse::new(
        &settings.bigquery,
        settings.project.clone(),
        warehouse_tokens,
    )?);

    tracing::info!(
        subscription = %settings.subscription,
        table = %format!("{}.{}.{}", settings.project, settings.dataset, settings.table),
        max_messages = settings.pipeline.flow_control.max_messages,
        timeout = ?settings.timeout,
        "pubsub2bq starting"
    );

    let controller = Controller::new(
        source,
        warehouse,
        settings.dataset,
        settings.table,
        settings.pipeline,
    )
    .with_timeout(settings.timeout);

    // --- Ctrl+C → drain ---
    let shutdown = controller.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, draining...");
            shutdown.cancel();
        }
    });

    let report = controller.run().await?;
    tracing::info!(
        outcome = ?report.outcome,
        written = report.written,
        malformed = report.stats.malformed,
        "shutdown complete"
    );
    Ok(())
}
