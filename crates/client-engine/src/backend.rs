//! HTTP client for the ingest service control plane.
//!
//! All endpoints live under `{protocol}://{host}/latest/ingest/`. Transient
//! failures (5xx, rate-limited 400s, transport faults) are retried with
//! jittered exponential backoff; everything else surfaces immediately as a
//! typed error.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

/// API version segment of every control-plane URL.
pub const API_VERSION: &str = "latest";

/// Lifecycle state of an ingest job, as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// The service is still provisioning queues and credentials.
    Preparing,
    /// The job accepts uploads.
    Uploading,
    /// All tiles are ingested and the job is finalized.
    Complete,
    /// The job was cancelled and removed.
    Deleted,
    /// The job failed server-side.
    Failed,
    /// The service is verifying the finished upload.
    Completing,
    /// The service is draining its queues before completing.
    WaitOnQueues,
}

impl JobStatus {
    /// Map the service's numeric status code.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => JobStatus::Preparing,
            1 => JobStatus::Uploading,
            2 => JobStatus::Complete,
            3 => JobStatus::Deleted,
            4 => JobStatus::Failed,
            5 => JobStatus::Completing,
            6 => JobStatus::WaitOnQueues,
            _ => return None,
        })
    }

    /// True when the job can never accept another upload.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Deleted | JobStatus::Failed)
    }
}

/// Short-lived cloud credentials issued by `join`.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialBundle {
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Session token, when the bundle is session-scoped.
    #[serde(default)]
    pub session_token: Option<String>,
}

/// Everything `join` hands back for a job that has reached `UPLOADING`.
#[derive(Debug, Clone)]
pub struct JoinedJob {
    /// Job lifecycle state at join time.
    pub status: JobStatus,
    /// Cloud credentials for the job's queues and buckets.
    pub credentials: CredentialBundle,
    /// Upload work-queue URL.
    pub upload_queue: String,
    /// Tile-index queue URL, when the job has one.
    pub tile_index_queue: Option<String>,
    /// Tile bucket name.
    pub tile_bucket: String,
    /// Cuboid bucket name, for volumetric jobs.
    pub volumetric_bucket: Option<String>,
    /// Opaque parameters echoed into upload metadata for the indexer.
    pub job_params: Value,
    /// Total tile count of the job.
    pub tile_count: u64,
}

/// Outcome of a `complete` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// The job is complete.
    Done,
    /// Retry after this many seconds.
    Wait(u64),
    /// The service is verifying; poll job status until terminal.
    Polling,
}

/// Queue-depth progress report for a job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobProgress {
    /// Messages currently waiting in the work queue.
    #[serde(default)]
    pub current_message_count: u64,
    /// Messages the job was created with.
    #[serde(default)]
    pub total_message_count: u64,
    /// Numeric job status, when the service includes it.
    #[serde(default)]
    pub job_status: Option<i64>,
}

impl JobProgress {
    /// Decoded job status, when present and known.
    pub fn status(&self) -> Option<JobStatus> {
        self.job_status.and_then(JobStatus::from_code)
    }
}

/// A control-plane request failure.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Server-side validation rejected the configuration document.
    #[error("ingest job configuration rejected by the server: {0}")]
    ConfigRejected(String),
    /// The cancel endpoint refused.
    #[error("failed to cancel ingest job: {0}")]
    CancelFailed(String),
    /// The complete endpoint answered something unhandled.
    #[error("failed to complete ingest job: {0}")]
    CompleteFailed(String),
    /// The retry budget ran out on a transient failure.
    #[error("giving up after {attempts} attempts: {message}")]
    RetriesExhausted {
        /// Attempts spent.
        attempts: u32,
        /// Last failure seen.
        message: String,
    },
    /// The service answered something the client does not understand.
    #[error("unexpected response from the ingest service: {0}")]
    Unexpected(String),
    /// Transport-level failure outside a retry loop.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Operations the engine needs from the control plane. `HttpBackend` is the
/// production implementation; tests substitute their own.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create an ingest job from a full configuration document.
    async fn create(&self, config: &Value) -> Result<u64, BackendError>;
    /// Join a job, polling until it leaves `PREPARING`.
    async fn join(&self, job_id: u64) -> Result<JoinedJob, BackendError>;
    /// Cancel and remove a job.
    async fn cancel(&self, job_id: u64) -> Result<(), BackendError>;
    /// Ask the service to finalize a job.
    async fn complete(&self, job_id: u64) -> Result<CompletionState, BackendError>;
    /// Fetch queue-depth progress for a job.
    async fn get_job_status(&self, job_id: u64) -> Result<JobProgress, BackendError>;
}

/// Retry and polling knobs for [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct BackendTiming {
    /// Poll interval while a joined job is still `PREPARING`.
    pub preparing_poll: Duration,
    /// Ceiling for one jittered backoff pause.
    pub backoff_cap: Duration,
    /// Transient-failure retries before giving up.
    pub max_attempts: u32,
}

impl Default for BackendTiming {
    fn default() -> Self {
        Self {
            preparing_poll: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(30),
            max_attempts: 1000,
        }
    }
}

/// Jittered exponential backoff: uniform over (0, min(100·2⁽ⁿ⁺⁴⁾ ms, cap)].
fn jittered_backoff(attempt: u32, cap: Duration) -> Duration {
    let exp_ms = 100u64.saturating_mul(1u64 << (attempt + 4).min(40));
    let ceiling = exp_ms.min(cap.as_millis() as u64).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(1..=ceiling))
}

const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::BAD_REQUEST,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
];

#[derive(Debug, Deserialize)]
struct JoinIngestJob {
    status: i64,
    #[serde(default)]
    upload_queue: Option<String>,
    #[serde(default)]
    tile_index_queue: Option<String>,
    #[serde(default)]
    ingest_queue: Option<String>,
    #[serde(default)]
    tile_count: u64,
}

#[derive(Debug, Deserialize)]
struct JoinResponse {
    ingest_job: JoinIngestJob,
    #[serde(default)]
    credentials: Option<Value>,
    #[serde(default)]
    tile_bucket_name: Option<String>,
    #[serde(default)]
    ingest_bucket_name: Option<String>,
    #[serde(default)]
    ingest_lambda: Value,
    #[serde(default, rename = "KVIO_SETTINGS")]
    kvio_settings: Value,
    #[serde(default, rename = "STATEIO_CONFIG")]
    stateio_config: Value,
    #[serde(default, rename = "OBJECTIO_CONFIG")]
    objectio_config: Value,
    #[serde(default)]
    resource: Value,
}

/// Production control-plane client.
pub struct HttpBackend {
    http: reqwest::Client,
    base: String,
    timing: BackendTiming,
}

impl HttpBackend {
    /// Build a client for `base_url` (e.g. `https://api.example.org`)
    /// authenticating with `token`.
    pub fn new(base_url: &str, token: &str) -> Result<Self, BackendError> {
        Self::with_timing(base_url, token, BackendTiming::default())
    }

    /// Build a client with explicit retry/polling timing.
    pub fn with_timing(
        base_url: &str,
        token: &str,
        timing: BackendTiming,
    ) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Token {token}"))
            .map_err(|_| BackendError::Unexpected("API token is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            timing,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{API_VERSION}/ingest/{path}", self.base)
    }

    /// GET with the transient-failure retry policy shared by join and status.
    async fn get_with_retries(
        &self,
        url: &str,
        what: &str,
    ) -> Result<reqwest::Response, BackendError> {
        let mut attempts = 0u32;
        loop {
            let failure = match self.http.get(url).send().await {
                Ok(resp) if RETRY_STATUSES.contains(&resp.status()) => {
                    let status = resp.status();
                    if status == StatusCode::BAD_REQUEST {
                        // 400 here usually means the request rate was exceeded;
                        // surface the body so the operator can tell.
                        let body = resp.text().await.unwrap_or_default();
                        warn!(%body, "{what} request rejected with 400");
                    }
                    format!("{what} returned {status}")
                }
                Ok(resp) => return Ok(resp),
                Err(err) => format!("{what} transport error: {err}"),
            };

            attempts += 1;
            if attempts > self.timing.max_attempts {
                return Err(BackendError::RetriesExhausted {
                    attempts: self.timing.max_attempts,
                    message: failure,
                });
            }
            let pause = jittered_backoff(attempts, self.timing.backoff_cap);
            warn!(
                attempts,
                pause_ms = pause.as_millis() as u64,
                "{failure}; backing off before retrying"
            );
            tokio::time::sleep(pause).await;
        }
    }
}

#[async_trait]
impl ControlPlane for HttpBackend {
    async fn create(&self, config: &Value) -> Result<u64, BackendError> {
        info!("submitting ingest job configuration for creation");
        let resp = self.http.post(self.url("")).json(config).send().await?;

        if resp.status() != StatusCode::CREATED {
            let detail = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| {
                    v.get("detail")
                        .or_else(|| v.get("message"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "server provided no detail".to_string());
            return Err(BackendError::ConfigRejected(detail));
        }

        let body: Value = resp.json().await?;
        body.get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| BackendError::Unexpected("create response missing job id".into()))
    }

    async fn join(&self, job_id: u64) -> Result<JoinedJob, BackendError> {
        let url = self.url(&job_id.to_string());
        loop {
            let resp = self.get_with_retries(&url, "join").await?;
            if resp.status() != StatusCode::OK {
                return Err(BackendError::Unexpected(format!(
                    "join returned {}: {}",
                    resp.status(),
                    resp.text().await.unwrap_or_default()
                )));
            }

            let body: JoinResponse = resp.json().await?;
            let Some(status) = JobStatus::from_code(body.ingest_job.status) else {
                return Err(BackendError::Unexpected(format!(
                    "unknown job status code {}",
                    body.ingest_job.status
                )));
            };
            if status == JobStatus::Preparing {
                info!(job_id, "waiting for ingest job to be created");
                tokio::time::sleep(self.timing.preparing_poll).await;
                continue;
            }

            // A job can briefly report UPLOADING before its credentials are
            // provisioned; poll again until a usable bundle arrives.
            let credentials = body
                .credentials
                .as_ref()
                .and_then(|v| serde_json::from_value::<CredentialBundle>(v.clone()).ok());
            let Some(credentials) = credentials else {
                continue;
            };

            let upload_queue = body.ingest_job.upload_queue.clone().ok_or_else(|| {
                BackendError::Unexpected("join response missing upload_queue".into())
            })?;
            let tile_bucket = body.tile_bucket_name.clone().ok_or_else(|| {
                BackendError::Unexpected("join response missing tile_bucket_name".into())
            })?;

            let mut params = serde_json::Map::new();
            params.insert("upload_queue".into(), Value::from(upload_queue.clone()));
            params.insert(
                "ingest_queue".into(),
                body.ingest_job.ingest_queue.clone().map(Value::from).unwrap_or(Value::Null),
            );
            params.insert("ingest_lambda".into(), body.ingest_lambda.clone());
            params.insert("KVIO_SETTINGS".into(), body.kvio_settings.clone());
            params.insert("STATEIO_CONFIG".into(), body.stateio_config.clone());
            params.insert("OBJECTIO_CONFIG".into(), body.objectio_config.clone());
            params.insert("resource".into(), body.resource.clone());

            return Ok(JoinedJob {
                status,
                credentials,
                upload_queue,
                tile_index_queue: body.ingest_job.tile_index_queue.clone(),
                tile_bucket,
                volumetric_bucket: body.ingest_bucket_name.clone(),
                job_params: Value::Object(params),
                tile_count: body.ingest_job.tile_count,
            });
        }
    }

    async fn cancel(&self, job_id: u64) -> Result<(), BackendError> {
        let resp = self
            .http
            .delete(self.url(&job_id.to_string()))
            .send()
            .await?;
        if resp.status() != StatusCode::NO_CONTENT {
            return Err(BackendError::CancelFailed(
                resp.text().await.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    async fn complete(&self, job_id: u64) -> Result<CompletionState, BackendError> {
        let resp = self
            .http
            .post(self.url(&format!("{job_id}/complete")))
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(CompletionState::Done);
        }

        let data: Value = resp.json().await.map_err(|err| {
            BackendError::CompleteFailed(format!("error parsing response: {err}"))
        })?;
        let wait_secs = data.get("wait_secs").and_then(Value::as_u64);

        if status == StatusCode::BAD_REQUEST {
            if let Some(secs) = wait_secs {
                return Ok(CompletionState::Wait(secs));
            }
        }
        if status == StatusCode::ACCEPTED {
            match data.get("job_status").and_then(Value::as_i64).and_then(JobStatus::from_code) {
                Some(JobStatus::WaitOnQueues) => {
                    if let Some(secs) = wait_secs {
                        return Ok(CompletionState::Wait(secs));
                    }
                }
                Some(JobStatus::Completing) => return Ok(CompletionState::Polling),
                _ => {}
            }
        }

        Err(BackendError::CompleteFailed(data.to_string()))
    }

    async fn get_job_status(&self, job_id: u64) -> Result<JobProgress, BackendError> {
        let url = self.url(&format!("{job_id}/status"));
        let resp = self.get_with_retries(&url, "job status").await?;
        if resp.status() != StatusCode::OK {
            return Err(BackendError::Unexpected(format!(
                "job status returned {}: {}",
                resp.status(),
                resp.text().await.unwrap_or_default()
            )));
        }
        Ok(resp.json().await?)
    }
}
