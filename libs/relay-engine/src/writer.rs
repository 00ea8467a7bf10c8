use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_api::{ConnectorError, JobId, JobStatus, Record, TableRef, Warehouse};

use crate::config::WriterConfig;
use crate::error::RelayError;
use crate::queue::RelayConsumer;
use crate::stats::PipelineStats;

// ═══════════════════════════════════════════════════════════════
//  Writer task: relay queue → warehouse append jobs
// ═══════════════════════════════════════════════════════════════

/// Single background consumer of the relay queue.
///
/// Each record becomes its own append job and the writer waits for that job
/// to finish before taking the next record, so rows land in queue order.
pub struct Writer {
    warehouse: Arc<dyn Warehouse>,
    table: TableRef,
    config: WriterConfig,
    stats: Arc<PipelineStats>,
}

impl Writer {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        table: TableRef,
        config: WriterConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            warehouse,
            table,
            config,
            stats,
        }
    }

    /// Run the writer on its own task.
    ///
    /// Ends with `Ok(rows written)` once the queue is closed and empty, or
    /// once `token` is cancelled and the records already queued are written.
    /// A record that cannot be written ends the task with `Err` and closes
    /// the queue so that further pushes fail.
    pub fn spawn(
        self,
        queue: RelayConsumer,
        token: CancellationToken,
    ) -> JoinHandle<Result<u64, RelayError>> {
        tokio::spawn(self.run(queue, token))
    }

    async fn run(self, mut queue: RelayConsumer, token: CancellationToken) -> Result<u64, RelayError> {
        tracing::info!(table = %self.table, "writer started");
        let mut written = 0u64;

        loop {
            let record = tokio::select! {
                biased;
                record = queue.pop() => match record {
                    Some(record) => record,
                    None => break,
                },
                _ = token.cancelled() => match queue.try_pop() {
                    Some(record) => record,
                    None => break,
                },
            };

            if let Err(e) = self.append(record).await {
                queue.close();
                tracing::error!(
                    table = %self.table,
                    error = %e,
                    dropped = queue.len(),
                    "writer stopped on failed append"
                );
                return Err(e);
            }
            written += 1;
        }

        tracing::info!(table = %self.table, written, "writer drained");
        Ok(written)
    }

    /// Append one record, retrying transient failures with exponential backoff.
    ///
    /// A failed submission or a job that reports `Failed` is submitted
    /// again. A job that cannot be polled is polled again, never
    /// resubmitted: it may already have appended the row.
    async fn append(&self, record: Record) -> Result<(), RelayError> {
        let mut backoff = self.config.initial_backoff();
        let mut attempt = 1u32;

        loop {
            let result = match self
                .warehouse
                .submit_append(&self.table, vec![record.clone()])
                .await
            {
                Ok(job) => {
                    tracing::debug!(message_id = %record.message_id, job = %job, "append job submitted");
                    match self.poll_job(&record, &job).await {
                        Ok(JobStatus::Done) => Ok(()),
                        Ok(JobStatus::Failed(e)) => Err(e.with_context(format!("job {job}"))),
                        Ok(status) => Err(ConnectorError::logic(format!(
                            "job {job} reported non-terminal status {status:?}"
                        ))),
                        Err(e) => {
                            return Err(self.give_up(record, attempt, e.with_context(format!("poll job {job}"))));
                        }
                    }
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.stats.record_written();
                    tracing::debug!(message_id = %record.message_id, attempt, "row appended");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    self.stats.record_write_retry();
                    tracing::warn!(
                        message_id = %record.message_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "append failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, self.config.max_backoff());
                    attempt += 1;
                }
                Err(e) => return Err(self.give_up(record, attempt, e)),
            }
        }
    }

    /// Wait for `job` to finish, polling the same job again after transient
    /// poll failures.
    async fn poll_job(&self, record: &Record, job: &JobId) -> Result<JobStatus, ConnectorError> {
        let mut backoff = self.config.initial_backoff();
        let mut polls = 1u32;

        loop {
            match self.warehouse.await_job(job).await {
                Err(e) if e.is_retryable() && polls < self.config.max_attempts => {
                    self.stats.record_write_retry();
                    tracing::warn!(
                        message_id = %record.message_id,
                        job = %job,
                        polls,
                        error = %e,
                        "job poll failed, polling again"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, self.config.max_backoff());
                    polls += 1;
                }
                other => return other,
            }
        }
    }

    fn give_up(&self, record: Record, attempts: u32, source: ConnectorError) -> RelayError {
        self.stats.record_write_failure();
        RelayError::Write {
            message_id: record.message_id,
            attempts,
            source,
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
