use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;

use relay_api::{ConnectorError, ErrorKind, JobId, JobStatus, Record, TableRef, Warehouse};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ═══════════════════════════════════════════════════════════════
//  MemoryWarehouse
// ═══════════════════════════════════════════════════════════════

type Row = Map<String, Value>;

#[derive(Debug)]
struct Job {
    table_key: String,
    ready_at: Instant,
    /// Rows waiting to be committed; taken when the job completes.
    rows: Vec<Row>,
    failure: Option<ConnectorError>,
}

#[derive(Debug, Default)]
struct WarehouseState {
    /// `dataset.table` → appended rows.
    tables: HashMap<String, Vec<Row>>,
    jobs: HashMap<String, Job>,
    next_job: u64,
    fail_appends: Vec<ErrorKind>,
    /// `await_job` calls that fail after the job reached its terminal state.
    fail_polls: usize,
    append_delay: Duration,
}

/// Warehouse that keeps tables as row vectors.
///
/// Append jobs behave like the real thing: `submit_append` returns at once,
/// rows become visible when the job completes, and a failed job appends
/// nothing. A job is forgotten once `await_job` has reported its outcome.
pub struct MemoryWarehouse {
    project: String,
    state: Mutex<WarehouseState>,
}

impl MemoryWarehouse {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: Mutex::new(WarehouseState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, WarehouseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_table(&self, dataset: &str, table: &str) {
        self.state()
            .tables
            .entry(format!("{dataset}.{table}"))
            .or_default();
    }

    /// Jobs take `delay` to complete from now on.
    pub fn with_append_delay(self, delay: Duration) -> Self {
        self.state().append_delay = delay;
        self
    }

    /// The next `count` append jobs fail with `kind`.
    pub fn fail_next_appends(&self, count: usize, kind: ErrorKind) {
        let mut state = self.state();
        state.fail_appends.extend(std::iter::repeat_n(kind, count));
    }

    /// The next `count` calls to `await_job` fail with an `Io` error after
    /// the job has finished (its rows, if any, are already committed).
    pub fn fail_next_polls(&self, count: usize) {
        self.state().fail_polls += count;
    }

    /// Jobs submitted and not yet reported by `await_job`.
    pub fn jobs_tracked(&self) -> usize {
        self.state().jobs.len()
    }

    /// Rows of `dataset.table` in append order. Empty for unknown tables.
    pub fn rows(&self, dataset: &str, table: &str) -> Vec<Row> {
        self.state()
            .tables
            .get(&format!("{dataset}.{table}"))
            .cloned()
            .unwrap_or_default()
    }

    pub fn jobs_submitted(&self) -> u64 {
        self.state().next_job
    }
}

impl Warehouse for MemoryWarehouse {
    fn resolve_table<'a>(
        &'a self,
        dataset: &'a str,
        table: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TableRef, ConnectorError>> + Send + 'a>> {
        Box::pin(async move {
            if self.state().tables.contains_key(&format!("{dataset}.{table}")) {
                Ok(TableRef::new(self.project.clone(), dataset, table))
            } else {
                Err(ConnectorError::not_found(format!(
                    "table {}.{dataset}.{table}",
                    self.project
                )))
            }
        })
    }

    fn submit_append<'a>(
        &'a self,
        table: &'a TableRef,
        rows: Vec<Record>,
    ) -> Pin<Box<dyn Future<Output = Result<JobId, ConnectorError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state();
            let table_key = format!("{}.{}", table.dataset, table.table);
            if !state.tables.contains_key(&table_key) {
                return Err(ConnectorError::not_found(format!("table {table}")));
            }

            state.next_job += 1;
            let id = format!("job-{}", state.next_job);
            let failure = if state.fail_appends.is_empty() {
                None
            } else {
                let kind = state.fail_appends.remove(0);
                Some(ConnectorError {
                    kind,
                    message: format!("load job {id}: injected {kind:?} failure"),
                })
            };
            let job = Job {
                table_key,
                ready_at: Instant::now() + state.append_delay,
                rows: rows.into_iter().map(|r| r.fields).collect(),
                failure,
            };
            state.jobs.insert(id.clone(), job);
            Ok(JobId::new(id))
        })
    }

    fn job_status<'a>(
        &'a self,
        job: &'a JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, ConnectorError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state();
            let state = &mut *state;
            let Some(entry) = state.jobs.get_mut(&job.id) else {
                return Err(ConnectorError::not_found(format!("job {job}")));
            };
            if Instant::now() < entry.ready_at {
                return Ok(JobStatus::Running);
            }
            if let Some(failure) = &entry.failure {
                return Ok(JobStatus::Failed(failure.clone()));
            }
            if !entry.rows.is_empty() {
                let rows = std::mem::take(&mut entry.rows);
                state.tables.entry(entry.table_key.clone()).or_default().extend(rows);
            }
            Ok(JobStatus::Done)
        })
    }

    fn await_job<'a>(
        &'a self,
        job: &'a JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, ConnectorError>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let status = self.job_status(job).await?;
                if !status.is_terminal() {
                    tokio::time::sleep(POLL_INTERVAL).await;
                    continue;
                }
                let mut state = self.state();
                if state.fail_polls > 0 {
                    state.fail_polls -= 1;
                    return Err(ConnectorError::io(format!("jobs.get {job}: injected poll failure")));
                }
                state.jobs.remove(&job.id);
                return Ok(status);
            }
        })
    }
}
