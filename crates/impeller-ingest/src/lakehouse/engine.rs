//! Asynchronous SQL job client for the lakehouse query engine.
//!
//! The engine exposes a REST protocol: a login call exchanges credentials
//! for a token, SQL submission returns a job id, and the job is polled
//! until it reaches a terminal state.
//!
//! Polling is a bounded loop: one status request per second up to the
//! configured budget, with a cancellation flag consulted on every
//! iteration. A job that does not terminate inside the budget is treated
//! as failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Token prefix the engine expects in the Authorization header.
const TOKEN_PREFIX: &str = "_dremio";

/// Configuration for the query engine client.
#[derive(Debug, Clone)]
pub struct QueryEngineConfig {
    /// Engine hostname.
    pub host: String,

    /// Engine REST port.
    pub port: u16,

    /// Login username.
    pub username: String,

    /// Login password.
    pub password: String,

    /// Maximum status polls per job (one per `poll_interval`).
    /// Default: 60.
    pub poll_budget: u32,

    /// Delay between status polls.
    pub poll_interval: Duration,

    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9047,
            username: "impeller".to_string(),
            password: "impeller".to_string(),
            poll_budget: 60,
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Terminal outcome of a polled job.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobOutcome {
    /// Job completed; results can be fetched.
    Completed,

    /// Job reached FAILED or CANCELLED, with the engine's failure detail.
    Failed { state: String, message: String },
}

/// Status snapshot parsed from one polling response.
#[derive(Debug, Clone)]
struct JobStatus {
    state: String,
    detail: Option<String>,
}

impl JobStatus {
    fn from_body(body: &Value) -> Self {
        let state = body
            .get("jobState")
            .and_then(|s| s.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();
        Self {
            state,
            detail: extract_failure_detail(body),
        }
    }
}

/// Pull the most useful failure message out of a job status body.
///
/// The engine reports failures in several shapes depending on the error
/// class; probe the known fields in order of specificity.
fn extract_failure_detail(body: &Value) -> Option<String> {
    if let Some(info) = body.get("failureInfo") {
        if let Some(s) = info.as_str() {
            return Some(s.to_string());
        }
        if let Some(msg) = info
            .get("errors")
            .and_then(|e| e.get(0))
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return Some(msg.to_string());
        }
        if !info.is_null() {
            return Some(info.to_string());
        }
    }
    for field in ["errorMessage", "message"] {
        if let Some(msg) = body.get(field).and_then(|m| m.as_str()) {
            return Some(msg.to_string());
        }
    }
    None
}

/// REST client for the lakehouse query engine.
pub struct QueryEngineClient {
    config: QueryEngineConfig,
    base_url: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    cancel: Arc<AtomicBool>,
}

impl QueryEngineClient {
    /// Create a new client.
    ///
    /// `cancel` is consulted during job polling; setting it to `true` ends
    /// any in-flight poll loop at its next iteration.
    pub fn new(config: QueryEngineConfig, cancel: Arc<AtomicBool>) -> Result<Self> {
        let base_url = format!("http://{}:{}", config.host, config.port);
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            config,
            base_url,
            http,
            token: RwLock::new(None),
            cancel,
        })
    }

    /// Authenticate and cache the session token.
    pub async fn authenticate(&self) -> Result<()> {
        let url = format!("{}/apiv2/login", self.base_url);
        let payload = json!({
            "userName": self.config.username,
            "password": self.config.password,
        });

        debug!("Authenticating with query engine at {}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::QueryEngine(format!("login failed: {e}")))?;

        let body: Value = response.json().await?;
        let token = body
            .get("token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::QueryEngine("login response carried no token".to_string()))?;

        *self.token.write() = Some(token.to_string());
        info!("Authenticated with query engine at {}", self.base_url);
        Ok(())
    }

    /// Whether [`authenticate`] has succeeded.
    ///
    /// [`authenticate`]: Self::authenticate
    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    /// Submit a SQL statement and poll its job to completion.
    ///
    /// Returns the job results on `COMPLETED`. A `FAILED`/`CANCELLED` job or
    /// an exhausted poll budget surfaces as [`Error::QueryEngine`] carrying
    /// the engine's failure detail.
    pub async fn execute(&self, sql: &str) -> Result<Value> {
        let job_id = self.submit(sql).await?;
        match self.wait_for_job(&job_id).await? {
            JobOutcome::Completed => self.fetch_results(&job_id).await,
            JobOutcome::Failed { state, message } => Err(Error::QueryEngine(format!(
                "job {job_id} {state}: {message}"
            ))),
        }
    }

    fn auth_header(&self) -> Result<String> {
        self.token
            .read()
            .as_ref()
            .map(|t| format!("{TOKEN_PREFIX}{t}"))
            .ok_or_else(|| Error::QueryEngine("not authenticated".to_string()))
    }

    async fn submit(&self, sql: &str) -> Result<String> {
        debug!("Submitting query: {sql}");
        let url = format!("{}/api/v3/sql", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header()?)
            .json(&json!({ "sql": sql }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::QueryEngine(format!("submission failed: {e}")))?;

        let body: Value = response.json().await?;
        body.get("id")
            .and_then(|id| id.as_str())
            .map(|id| id.to_string())
            .ok_or_else(|| Error::QueryEngine("submission returned no job id".to_string()))
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let url = format!("{}/api/v3/job/{job_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("Authorization", self.auth_header()?)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::QueryEngine(format!("status fetch failed: {e}")))?;

        let body: Value = response.json().await?;
        Ok(JobStatus::from_body(&body))
    }

    /// Poll a job until a terminal state, cancellation, or budget exhaustion.
    async fn wait_for_job(&self, job_id: &str) -> Result<JobOutcome> {
        let started = Instant::now();

        for attempt in 0..self.config.poll_budget {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(Error::QueryEngine(format!(
                    "polling of job {job_id} cancelled by shutdown"
                )));
            }

            let status = self.job_status(job_id).await?;
            match status.state.as_str() {
                "COMPLETED" => {
                    histogram!("engine_job_poll_seconds").record(started.elapsed().as_secs_f64());
                    counter!("engine_jobs_total", "state" => "completed").increment(1);
                    return Ok(JobOutcome::Completed);
                }
                "FAILED" | "CANCELLED" => {
                    counter!("engine_jobs_total", "state" => "failed").increment(1);
                    return Ok(JobOutcome::Failed {
                        state: status.state,
                        message: status
                            .detail
                            .unwrap_or_else(|| "no failure detail provided".to_string()),
                    });
                }
                other => {
                    debug!(
                        "Job {job_id} is {other} (poll {}/{})",
                        attempt + 1,
                        self.config.poll_budget
                    );
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        counter!("engine_jobs_total", "state" => "timeout").increment(1);
        Err(Error::QueryEngine(format!(
            "timed out waiting for job {job_id} after {} polls",
            self.config.poll_budget
        )))
    }

    async fn fetch_results(&self, job_id: &str) -> Result<Value> {
        let url = format!("{}/api/v3/job/{job_id}/results", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("Authorization", self.auth_header()?)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::QueryEngine(format!("results fetch failed: {e}")))?;

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_completed_body() {
        let body = json!({ "jobState": "COMPLETED" });
        let status = JobStatus::from_body(&body);
        assert_eq!(status.state, "COMPLETED");
        assert!(status.detail.is_none());
    }

    #[test]
    fn test_status_from_missing_state() {
        let status = JobStatus::from_body(&json!({}));
        assert_eq!(status.state, "UNKNOWN");
    }

    #[test]
    fn test_failure_detail_from_string() {
        let body = json!({ "jobState": "FAILED", "failureInfo": "out of memory" });
        let status = JobStatus::from_body(&body);
        assert_eq!(status.detail.as_deref(), Some("out of memory"));
    }

    #[test]
    fn test_failure_detail_from_structured_info() {
        let body = json!({
            "jobState": "FAILED",
            "failureInfo": { "errors": [{ "message": "table not found" }] }
        });
        let status = JobStatus::from_body(&body);
        assert_eq!(status.detail.as_deref(), Some("table not found"));
    }

    #[test]
    fn test_failure_detail_from_error_message_field() {
        let body = json!({ "jobState": "CANCELLED", "errorMessage": "cancelled by admin" });
        let status = JobStatus::from_body(&body);
        assert_eq!(status.detail.as_deref(), Some("cancelled by admin"));
    }

    #[test]
    fn test_failure_detail_absent() {
        let body = json!({ "jobState": "FAILED" });
        assert!(extract_failure_detail(&body).is_none());
    }

    #[test]
    fn test_client_starts_unauthenticated() {
        let client = QueryEngineClient::new(
            QueryEngineConfig::default(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert!(!client.is_authenticated());
        assert!(client.auth_header().is_err());
    }
}
