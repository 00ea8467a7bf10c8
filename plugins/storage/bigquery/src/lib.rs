use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use relay_api::{ConnectorError, JobId, JobStatus, Record, TableRef, Warehouse};
use relay_gcp_auth::{TokenProvider, build_client, check_status, send_error};

const BOUNDARY: &str = "relay_load_job_boundary";

// ═══════════════════════════════════════════════════════════════
//  BigQueryConfig
// ═══════════════════════════════════════════════════════════════

/// `[bigquery]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BigQueryConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Interval between `jobs.get` calls while a load job runs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Job location; by default the dataset's own location is used.
    #[serde(default)]
    pub location: Option<String>,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            location: None,
        }
    }
}

fn default_endpoint() -> String {
    "https://bigquery.googleapis.com".into()
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_request_timeout_secs() -> u64 {
    30
}

// ═══════════════════════════════════════════════════════════════
//  Wire types
// ═══════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct WireTable {
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJob {
    job_reference: WireJobReference,
    #[serde(default)]
    status: WireJobStatus,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireJobStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error_result: Option<WireErrorProto>,
}

#[derive(Deserialize)]
struct WireErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl WireErrorProto {
    /// Transient reasons are retryable; everything else is a data or schema problem.
    fn into_error(self, job: &JobId) -> ConnectorError {
        let message = format!("load job {job} failed: {}: {}", self.reason, self.message);
        match self.reason.as_str() {
            "backendError" | "internalError" | "rateLimitExceeded" | "jobBackendError"
            | "jobInternalError" => ConnectorError::io(message),
            "notFound" => ConnectorError::not_found(message),
            "accessDenied" => ConnectorError::auth(message),
            _ => ConnectorError::format(message),
        }
    }
}

impl WireJob {
    fn into_status(self, job: &JobId) -> JobStatus {
        match (self.status.state.as_str(), self.status.error_result) {
            ("DONE", Some(err)) => JobStatus::Failed(err.into_error(job)),
            ("DONE", None) => JobStatus::Done,
            ("RUNNING", _) => JobStatus::Running,
            _ => JobStatus::Pending,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Request building
// ═══════════════════════════════════════════════════════════════

/// Rows as newline-delimited JSON.
fn ndjson(rows: &[Record]) -> Result<String, ConnectorError> {
    let mut body = String::new();
    for row in rows {
        body.push_str(&row.to_json_line()?);
        body.push('\n');
    }
    Ok(body)
}

/// `jobs.insert` metadata for an append-only NDJSON load into `table`.
fn load_job(table: &TableRef, job_id: &str, location: Option<&str>) -> Value {
    let mut reference = json!({ "projectId": table.project, "jobId": job_id });
    if let Some(location) = location {
        reference["location"] = json!(location);
    }
    json!({
        "jobReference": reference,
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": table.project,
                    "datasetId": table.dataset,
                    "tableId": table.table,
                },
                "sourceFormat": "NEWLINE_DELIMITED_JSON",
                "writeDisposition": "WRITE_APPEND",
            }
        }
    })
}

/// `multipart/related` body: job metadata part followed by the data part.
fn multipart_body(metadata: &Value, data: &str) -> String {
    format!(
        "--{BOUNDARY}\r\n\
         Content-Type: application/json; charset=UTF-8\r\n\r\n\
         {metadata}\r\n\
         --{BOUNDARY}\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         {data}\r\n\
         --{BOUNDARY}--\r\n"
    )
}

// ═══════════════════════════════════════════════════════════════
//  BigQueryWarehouse
// ═══════════════════════════════════════════════════════════════

/// BigQuery over the v2 REST API. Rows are appended through load jobs.
pub struct BigQueryWarehouse {
    http: reqwest::Client,
    endpoint: String,
    project: String,
    location: Option<String>,
    poll_interval: Duration,
    tokens: Arc<TokenProvider>,
    job_seq: AtomicU64,
}

impl BigQueryWarehouse {
    pub fn new(
        config: &BigQueryConfig,
        project: impl Into<String>,
        tokens: Arc<TokenProvider>,
    ) -> Result<Self, ConnectorError> {
        Ok(Self {
            http: build_client(Duration::from_secs(config.request_timeout_secs))?,
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
            project: project.into(),
            location: config.location.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            tokens,
            job_seq: AtomicU64::new(0),
        })
    }

    /// Unique per submission, including across processes.
    fn next_job_id(&self) -> String {
        let seq = self.job_seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "pubsub2bq_{}_{}_{seq}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%6f"),
            std::process::id()
        )
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/bigquery/v2/projects/{}/{path}", self.endpoint, self.project)
    }

    async fn send(&self, ctx: &str, request: reqwest::RequestBuilder) -> Result<String, ConnectorError> {
        let resp = self
            .tokens
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| send_error(ctx, e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| send_error(ctx, e))?;
        check_status(ctx, status, &body)?;
        Ok(body)
    }

    async fn fetch_job(&self, job: &JobId) -> Result<WireJob, ConnectorError> {
        let mut request = self.http.get(self.api_url(&format!("jobs/{}", job.id)));
        if let Some(location) = &job.location {
            request = request.query(&[("location", location.as_str())]);
        }
        let body = self.send("jobs.get", request).await?;
        serde_json::from_str(&body).map_err(|e| ConnectorError::format(format!("jobs.get: {e}")))
    }
}

impl Warehouse for BigQueryWarehouse {
    fn resolve_table<'a>(
        &'a self,
        dataset: &'a str,
        table: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TableRef, ConnectorError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.api_url(&format!("datasets/{dataset}/tables/{table}"));
            let body = self.send("tables.get", self.http.get(url)).await?;
            let wire: WireTable = serde_json::from_str(&body)
                .map_err(|e| ConnectorError::format(format!("tables.get: {e}")))?;

            let mut resolved = TableRef::new(self.project.clone(), dataset, table);
            resolved.location = self.location.clone().or(wire.location);
            tracing::debug!(table = %resolved, location = ?resolved.location, "table resolved");
            Ok(resolved)
        })
    }

    fn submit_append<'a>(
        &'a self,
        table: &'a TableRef,
        rows: Vec<Record>,
    ) -> Pin<Box<dyn Future<Output = Result<JobId, ConnectorError>> + Send + 'a>> {
        Box::pin(async move {
            let job_id = self.next_job_id();
            let metadata = load_job(table, &job_id, table.location.as_deref());
            let body = multipart_body(&metadata, &ndjson(&rows)?);

            let url = format!(
                "{}/upload/bigquery/v2/projects/{}/jobs",
                self.endpoint, table.project
            );
            let request = self
                .http
                .post(url)
                .query(&[("uploadType", "multipart")])
                .header(
                    reqwest::header::CONTENT_TYPE,
                    format!("multipart/related; boundary={BOUNDARY}"),
                )
                .body(body);
            let response = self.send("jobs.insert", request).await?;
            let wire: WireJob = serde_json::from_str(&response)
                .map_err(|e| ConnectorError::format(format!("jobs.insert: {e}")))?;

            Ok(JobId {
                id: wire.job_reference.job_id,
                location: wire.job_reference.location.or_else(|| table.location.clone()),
            })
        })
    }

    fn job_status<'a>(
        &'a self,
        job: &'a JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, ConnectorError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.fetch_job(job).await?.into_status(job)) })
    }

    fn await_job<'a>(
        &'a self,
        job: &'a JobId,
    ) -> Pin<Box<dyn Future<Output = Result<JobStatus, ConnectorError>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let status = self.fetch_job(job).await?.into_status(job);
                if status.is_terminal() {
                    return Ok(status);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_api::ErrorKind;
    use relay_gcp_auth::TokenSource;
    use serde_json::Map;

    fn warehouse() -> BigQueryWarehouse {
        let tokens = Arc::new(TokenProvider::new(TokenSource::Anonymous, reqwest::Client::new()));
        BigQueryWarehouse::new(&BigQueryConfig::default(), "proj", tokens).unwrap()
    }

    #[test]
    fn test_load_job_metadata() {
        let table = TableRef::new("proj", "events", "raw");
        let job = load_job(&table, "job-1", Some("EU"));
        assert_eq!(job["jobReference"]["jobId"], "job-1");
        assert_eq!(job["jobReference"]["location"], "EU");
        let load = &job["configuration"]["load"];
        assert_eq!(load["destinationTable"]["datasetId"], "events");
        assert_eq!(load["destinationTable"]["tableId"], "raw");
        assert_eq!(load["sourceFormat"], "NEWLINE_DELIMITED_JSON");
        assert_eq!(load["writeDisposition"], "WRITE_APPEND");

        let job = load_job(&table, "job-2", None);
        assert!(job["jobReference"].get("location").is_none());
    }

    #[test]
    fn test_ndjson_keeps_field_order() {
        let mut fields = Map::new();
        fields.insert("timestamp".into(), json!("2023-11-14T22:13:20"));
        fields.insert("value".into(), json!("x"));
        let body = ndjson(&[Record::new("m1", fields)]).unwrap();
        assert_eq!(body, "{\"timestamp\":\"2023-11-14T22:13:20\",\"value\":\"x\"}\n");
    }

    #[test]
    fn test_multipart_layout() {
        let body = multipart_body(&json!({"a": 1}), "{\"n\":1}\n");
        let parts: Vec<&str> = body.split(&format!("--{BOUNDARY}")).collect();
        assert_eq!(parts.len(), 4);
        assert!(parts[1].contains("application/json"));
        assert!(parts[1].contains("{\"a\":1}"));
        assert!(parts[2].contains("application/octet-stream"));
        assert!(parts[2].contains("{\"n\":1}"));
        assert_eq!(parts[3], "--\r\n");
    }

    #[test]
    fn test_job_status_mapping() {
        let job = JobId::new("j");
        let parse = |body: &str| serde_json::from_str::<WireJob>(body).unwrap().into_status(&job);
        assert_eq!(
            parse(r#"{"jobReference": {"jobId": "j"}, "status": {"state": "RUNNING"}}"#),
            JobStatus::Running
        );
        assert_eq!(parse(r#"{"jobReference": {"jobId": "j"}}"#), JobStatus::Pending);
        assert_eq!(
            parse(r#"{"jobReference": {"jobId": "j"}, "status": {"state": "DONE"}}"#),
            JobStatus::Done
        );
        assert_eq!(
            parse(
                r#"{"jobReference": {"jobId": "j"}, "status": {"state": "DONE",
                    "errorResult": {"reason": "invalid", "message": "no such field: extra"}}}"#
            ),
            JobStatus::Failed(ConnectorError::format(
                "load job j failed: invalid: no such field: extra"
            ))
        );
    }

    #[test]
    fn test_job_error_classification() {
        let job = JobId::new("j");
        let err = |reason: &str| {
            WireErrorProto { reason: reason.into(), message: "m".into() }.into_error(&job)
        };
        assert_eq!(err("backendError").kind, ErrorKind::Io);
        assert_eq!(err("rateLimitExceeded").kind, ErrorKind::Io);
        assert_eq!(err("invalid").kind, ErrorKind::Format);
        assert_eq!(err("notFound").kind, ErrorKind::NotFound);
        assert_eq!(err("accessDenied").kind, ErrorKind::Auth);
    }

    #[test]
    fn test_job_ids_are_unique() {
        let warehouse = warehouse();
        let a = warehouse.next_job_id();
        let b = warehouse.next_job_id();
        assert_ne!(a, b);
        assert!(a.starts_with("pubsub2bq_"));
    }

    #[test]
    fn test_api_url() {
        assert_eq!(
            warehouse().api_url("datasets/events/tables/raw"),
            "https://bigquery.googleapis.com/bigquery/v2/projects/proj/datasets/events/tables/raw"
        );
    }
}
