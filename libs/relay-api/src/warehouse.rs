use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::error::ConnectorError;
use crate::record::Record;

/// Resolved reference to a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
    /// Dataset location (region), when the warehouse reports one.
    pub location: Option<String>,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
            location: None,
        }
    }

    /// REST-style resource path: `projects/{p}/datasets/{d}/tables/{t}`.
    pub fn path(&self) -> String {
        format!(
            "projects/{}/datasets/{}/tables/{}",
            self.project, self.dataset, self.table
        )
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Handle of a submitted append job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobId {
    pub id: String,
    pub location: Option<String>,
}

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), location: None }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Job state as reported by the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    /// The job ran and appended nothing. The error kind says whether
    /// submitting the rows again may help.
    Failed(ConnectorError),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed(_))
    }
}

/// Columnar warehouse that accepts row-append jobs.
pub trait Warehouse: Send + Sync {
    /// Resolve `dataset.table` into a reference usable by `submit_append`.
    /// Fails with `ErrorKind::NotFound` when the table does not exist.
    fn resolve_table<'a>(
        &'a self,
        dataset: &'a str,
        table: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TableRef, ConnectorError>> + Send + 'a>>;

    /// Submit an append job for `rows`. Returns as soon as the job is accepted.
    fn submit_append<'a>(
        &'a self,
        table: &'a TableRef,
        rows: Vec<Record>,
    ) -> Pin<Box<dyn Future<Output = Result<JobId, ConnectorError>> + Send + 'a>>;

    /// Current status of a submitted job.
    fn job_status<'a>(
        &'a self,
        job: &'a JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, ConnectorError>> + Send + 'a>>;

    /// Poll until the job is terminal and return that status (`Done` or
    /// `Failed`). `Err` means the job could not be polled; it may well have
    /// finished, so the caller polls the same job again rather than
    /// submitting the rows a second time.
    fn await_job<'a>(
        &'a self,
        job: &'a JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, ConnectorError>> + Send + 'a>>;
}
