//! Run lifecycle: `Idle → Subscribed → Draining → Stopped`.
//!
//! The controller owns every long-lived piece of a run (streaming pull,
//! relay queue, writer task) and tears them down in order: stop pulling,
//! let in-flight callbacks finish, drain the queue, join the writer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use relay_api::{PullSource, Warehouse};

use crate::config::PipelineConfig;
use crate::error::RelayError;
use crate::queue::relay_queue;
use crate::receiver::Receiver;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::subscriber::{PullOutcome, SubscriberSettings, subscribe};
use crate::writer::Writer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Subscribed,
    Draining,
    Stopped,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: PullOutcome,
    /// Rows appended by the writer.
    pub written: u64,
    pub stats: StatsSnapshot,
    /// Every phase the run went through, in order.
    pub phases: Vec<Phase>,
}

pub struct Controller {
    source: Arc<dyn PullSource>,
    warehouse: Arc<dyn Warehouse>,
    dataset: String,
    table: String,
    config: PipelineConfig,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
    stats: Arc<PipelineStats>,
    phase_tx: watch::Sender<Phase>,
    phases: Vec<Phase>,
}

impl Controller {
    pub fn new(
        source: Arc<dyn PullSource>,
        warehouse: Arc<dyn Warehouse>,
        dataset: impl Into<String>,
        table: impl Into<String>,
        config: PipelineConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            source,
            warehouse,
            dataset: dataset.into(),
            table: table.into(),
            config,
            timeout: None,
            shutdown: CancellationToken::new(),
            stats: Arc::new(PipelineStats::default()),
            phase_tx,
            phases: vec![Phase::Idle],
        }
    }

    /// Bound the Subscribed phase. `None` runs until the source closes,
    /// the pull fails or shutdown is requested.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cancelling this token moves a running controller to Draining.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Watch phase changes from outside the run.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    fn enter(&mut self, phase: Phase) {
        let from = *self.phase_tx.borrow();
        tracing::info!(?from, to = ?phase, "phase change");
        self.phase_tx.send_replace(phase);
        self.phases.push(phase);
    }

    /// Run to completion.
    ///
    /// `Ok` for every normal end of the subscription (source closed, timeout,
    /// shutdown, failed pull). `Err` when the table cannot be resolved or the
    /// writer could not persist a record.
    pub async fn run(mut self) -> Result<RunReport, RelayError> {
        let table = self
            .warehouse
            .resolve_table(&self.dataset, &self.table)
            .await
            .map_err(|e| {
                RelayError::from(e).with_context(format!("resolve '{}.{}'", self.dataset, self.table))
            })?;
        tracing::info!(%table, path = %table.path(), "inserting rows into table");

        // --- Writer ---
        let (producer, consumer) = relay_queue();
        let writer_token = CancellationToken::new();
        let mut writer = Writer::new(
            self.warehouse.clone(),
            table,
            self.config.writer.clone(),
            self.stats.clone(),
        )
        .spawn(consumer, writer_token.clone());

        // --- Subscription ---
        let receiver = Arc::new(Receiver::new(
            producer,
            &self.config.pull,
            self.stats.clone(),
        ));
        let mut pull = subscribe(
            self.source.clone(),
            SubscriberSettings::from(&self.config),
            receiver,
            self.stats.clone(),
        );
        tracing::info!(
            subscription = %pull.subscription(),
            timeout = ?self.timeout,
            "listening for messages"
        );
        self.enter(Phase::Subscribed);

        let mut writer_done = None;
        let outcome = tokio::select! {
            outcome = pull.result(self.timeout) => outcome,
            _ = self.shutdown.cancelled() => {
                tracing::info!("shutdown requested");
                PullOutcome::Cancelled
            }
            joined = &mut writer => {
                writer_done = Some(joined);
                PullOutcome::Failed("writer stopped".into())
            }
        };
        match &outcome {
            PullOutcome::Failed(reason) => tracing::error!(%reason, "subscription ended"),
            other => tracing::info!(outcome = ?other, "subscription ended"),
        }

        // --- Drain ---
        // Nothing is pulled or dispatched once Draining is visible.
        pull.cancel();
        self.enter(Phase::Draining);
        pull.stop().await;
        // Every producer is gone once the pull loop has finished; the writer
        // sees the end of the queue after the last queued record.
        writer_token.cancel();

        let drain_timeout = self.config.shutdown.drain_timeout();
        let joined = match writer_done {
            Some(joined) => joined,
            None => match tokio::time::timeout(drain_timeout, &mut writer).await {
                Ok(joined) => joined,
                Err(_) => {
                    writer.abort();
                    tracing::error!(?drain_timeout, "writer did not drain, aborted");
                    self.enter(Phase::Stopped);
                    return Err(RelayError::DrainTimeout(drain_timeout));
                }
            },
        };
        let written = joined.map_err(|e| RelayError::WriterPanicked(e.to_string()));

        self.enter(Phase::Stopped);
        let stats = self.stats.snapshot();
        tracing::info!(
            received = stats.received,
            malformed = stats.malformed,
            acked = stats.acked,
            written = stats.written,
            write_failures = stats.write_failures,
            "stopped"
        );

        let written = written??;
        Ok(RunReport {
            outcome,
            written,
            stats,
            phases: self.phases,
        })
    }
}
