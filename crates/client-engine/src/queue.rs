//! Work-queue adapters and the retry policies layered on top of them.
//!
//! The raw [`TaskQueue`] trait is a thin transport: receive one message, tell
//! the queue a message is done, enqueue a message. [`UploadQueue`] adds the
//! policies the ingest contract requires: waiting out not-yet-valid
//! credentials on receive, backing off deletes with a 16-second floor, and
//! giving up immediately on sender-fault delete failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::error::ProvideErrorMetadata;
use aws_sdk_sqs::types::DeleteMessageBatchRequestEntry;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Service error codes that mean the caller's credentials are not (or not
/// yet) valid.
const CREDENTIAL_ERROR_CODES: [&str; 6] = [
    "AccessDenied",
    "AccessDeniedException",
    "InvalidAccessKeyId",
    "InvalidClientTokenId",
    "ExpiredToken",
    "SignatureDoesNotMatch",
];

/// One message received from the work queue.
#[derive(Debug, Clone)]
pub struct ReceivedTask {
    /// Queue message id.
    pub message_id: String,
    /// Handle required to delete the message.
    pub receipt_handle: String,
    /// JSON task body.
    pub body: String,
}

/// A work-queue operation failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// The queue rejected our credentials.
    #[error("work queue rejected credentials: {0}")]
    CredentialsInvalid(String),
    /// Anything else.
    #[error("work queue error: {0}")]
    Other(String),
}

/// Result of a delete attempt that reached the queue.
#[derive(Debug, Clone)]
pub enum DeleteOutcome {
    /// The message is gone.
    Deleted,
    /// The queue reported a per-entry failure.
    Failed {
        /// True when the failure is the sender's fault and retrying is useless.
        sender_fault: bool,
        /// Service failure code.
        code: String,
        /// Service failure message.
        message: String,
    },
}

/// Wire body of a tile-mode task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileTaskBody {
    /// Object key the tile will be written to.
    pub tile_key: String,
    /// Grouping key the ingest service correlates the tile under.
    pub chunk_key: String,
}

/// One cuboid descriptor inside a volumetric task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuboidSpec {
    /// Chunk-relative X offset of the cuboid.
    pub x: u64,
    /// Chunk-relative Y offset of the cuboid.
    pub y: u64,
    /// Chunk-relative Z offset of the cuboid.
    pub z: u64,
    /// Object key for this cuboid.
    pub key: String,
}

/// Wire body of a volumetric task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkTaskBody {
    /// Grouping key identifying the chunk.
    pub chunk_key: String,
    /// Cuboids to carve out of the chunk, in upload order.
    pub cuboids: Vec<CuboidSpec>,
}

/// Raw transport to one remote queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Long-poll for a single message (1 s server-side wait).
    async fn receive_one(&self) -> Result<Option<ReceivedTask>, QueueError>;

    /// Delete one message by id and receipt handle.
    async fn delete_one(
        &self,
        message_id: &str,
        receipt_handle: &str,
    ) -> Result<DeleteOutcome, QueueError>;

    /// Enqueue one message body.
    async fn send_one(&self, body: &str) -> Result<(), QueueError>;
}

fn classify_sqs_error<E>(err: &aws_sdk_sqs::error::SdkError<E>) -> QueueError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{err:?}"));
    match err.code() {
        Some(code) if CREDENTIAL_ERROR_CODES.contains(&code) => {
            QueueError::CredentialsInvalid(format!("{code}: {message}"))
        }
        Some(code) => QueueError::Other(format!("{code}: {message}")),
        None => QueueError::Other(message),
    }
}

/// SQS-backed work queue.
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    url: String,
}

impl SqsQueue {
    /// Wrap an SQS client scoped to one queue URL.
    pub fn new(client: aws_sdk_sqs::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TaskQueue for SqsQueue {
    async fn receive_one(&self) -> Result<Option<ReceivedTask>, QueueError> {
        let out = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(1)
            .wait_time_seconds(1)
            .send()
            .await
            .map_err(|err| classify_sqs_error(&err))?;

        let Some(msg) = out.messages().first() else {
            return Ok(None);
        };
        match (msg.message_id(), msg.receipt_handle(), msg.body()) {
            (Some(id), Some(handle), Some(body)) => Ok(Some(ReceivedTask {
                message_id: id.to_string(),
                receipt_handle: handle.to_string(),
                body: body.to_string(),
            })),
            _ => Err(QueueError::Other(
                "received message missing id, receipt handle or body".to_string(),
            )),
        }
    }

    async fn delete_one(
        &self,
        message_id: &str,
        receipt_handle: &str,
    ) -> Result<DeleteOutcome, QueueError> {
        let entry = DeleteMessageBatchRequestEntry::builder()
            .id(message_id)
            .receipt_handle(receipt_handle)
            .build()
            .map_err(|err| QueueError::Other(err.to_string()))?;
        let out = self
            .client
            .delete_message_batch()
            .queue_url(&self.url)
            .entries(entry)
            .send()
            .await
            .map_err(|err| classify_sqs_error(&err))?;

        if out.successful().iter().any(|e| e.id() == message_id) {
            return Ok(DeleteOutcome::Deleted);
        }
        match out.failed().first() {
            Some(failure) => Ok(DeleteOutcome::Failed {
                sender_fault: failure.sender_fault(),
                code: failure.code().to_string(),
                message: failure.message().unwrap_or_default().to_string(),
            }),
            None => Ok(DeleteOutcome::Failed {
                sender_fault: false,
                code: "Unknown".to_string(),
                message: "delete batch reported neither success nor failure".to_string(),
            }),
        }
    }

    async fn send_one(&self, body: &str) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.url)
            .message_body(body)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| classify_sqs_error(&err))
    }
}

/// Timing knobs for [`UploadQueue`] retry policies.
#[derive(Debug, Clone)]
pub struct QueueTiming {
    /// Sleep between receive attempts while credentials are not yet valid.
    pub credential_retry_sleep: Duration,
    /// Receive attempts to spend waiting for credentials to become valid.
    pub credential_retries: u32,
    /// Delete attempts before giving up.
    pub delete_max_tries: u32,
}

impl Default for QueueTiming {
    fn default() -> Self {
        Self {
            credential_retry_sleep: Duration::from_secs(15),
            credential_retries: 19,
            delete_max_tries: 20,
        }
    }
}

/// Exponential backoff for queue retries; the first wait is 2⁴ seconds.
fn retry_wait(try_cnt: u32) -> Duration {
    Duration::from_secs(1u64 << (try_cnt + 3).min(12))
}

/// The work queue with ingest retry policies applied.
pub struct UploadQueue {
    inner: Arc<dyn TaskQueue>,
    timing: QueueTiming,
}

impl UploadQueue {
    /// Wrap a raw queue with default policy timing.
    pub fn new(inner: Arc<dyn TaskQueue>) -> Self {
        Self {
            inner,
            timing: QueueTiming::default(),
        }
    }

    /// Override policy timing (tests).
    pub fn with_timing(inner: Arc<dyn TaskQueue>, timing: QueueTiming) -> Self {
        Self { inner, timing }
    }

    /// Fetch one upload task. Credential-invalid errors are retried with a
    /// fixed sleep, on the assumption that a freshly issued bundle has not
    /// propagated yet; after the retry budget the error escalates.
    pub async fn get_task(&self) -> Result<Option<ReceivedTask>, QueueError> {
        let mut try_cnt = 0;
        loop {
            match self.inner.receive_one().await {
                Ok(task) => return Ok(task),
                Err(QueueError::CredentialsInvalid(message)) => {
                    try_cnt += 1;
                    if try_cnt >= self.timing.credential_retries {
                        return Err(QueueError::CredentialsInvalid(message));
                    }
                    warn!(try_cnt, "waiting for work-queue credentials to become valid");
                    tokio::time::sleep(self.timing.credential_retry_sleep).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Delete a finished task message. Returns true when the message is gone.
    /// Transient failures back off exponentially; sender-fault failures stop
    /// immediately.
    pub async fn delete_task(&self, message_id: &str, receipt_handle: &str) -> bool {
        let mut try_cnt = 0;
        while try_cnt < self.timing.delete_max_tries.saturating_sub(1) {
            match self.inner.delete_one(message_id, receipt_handle).await {
                Ok(DeleteOutcome::Deleted) => return true,
                Ok(DeleteOutcome::Failed {
                    sender_fault,
                    code,
                    message,
                }) => {
                    try_cnt += 1;
                    warn!(code = %code, message = %message, "failed deleting message from work queue");
                    if sender_fault {
                        break;
                    }
                    tokio::time::sleep(retry_wait(try_cnt)).await;
                }
                Err(QueueError::CredentialsInvalid(message)) => {
                    try_cnt += 1;
                    warn!(
                        message = %message,
                        "waiting for work-queue credentials to become valid"
                    );
                    tokio::time::sleep(self.timing.credential_retry_sleep).await;
                }
                Err(QueueError::Other(message)) => {
                    try_cnt += 1;
                    warn!(message = %message, "work-queue delete error");
                    tokio::time::sleep(retry_wait(try_cnt)).await;
                }
            }
        }
        false
    }

    /// Enqueue a bookkeeping message (tile-index queue). Returns false after
    /// `max_retries` failures.
    pub async fn put_task(&self, body: &str, max_retries: u32) -> bool {
        let mut try_cnt = 0;
        while try_cnt <= max_retries {
            match self.inner.send_one(body).await {
                Ok(()) => return true,
                Err(err) => {
                    try_cnt += 1;
                    warn!(error = %err, "failed enqueueing tile-index message");
                    tokio::time::sleep(retry_wait(try_cnt)).await;
                }
            }
        }
        false
    }
}

/// In-memory work queue used by the test harness; messages are delivered at
/// most once unless explicitly re-queued.
#[derive(Default)]
pub struct MemQueue {
    state: Mutex<MemQueueState>,
}

#[derive(Default)]
struct MemQueueState {
    pending: Vec<ReceivedTask>,
    receive_faults: Vec<QueueError>,
    deleted: Vec<(String, String)>,
    sent: Vec<String>,
    next_id: u64,
}

impl MemQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task body; message id and receipt handle are generated.
    pub fn push_body(&self, body: impl Into<String>) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.next_id += 1;
        let n = state.next_id;
        state.pending.push(ReceivedTask {
            message_id: format!("m-{n}"),
            receipt_handle: format!("r-{n}"),
            body: body.into(),
        });
    }

    /// Queue an error for the next receive call (FIFO).
    pub fn inject_receive_error(&self, err: QueueError) {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .receive_faults
            .push(err);
    }

    /// `(message_id, receipt_handle)` pairs deleted so far.
    pub fn deleted(&self) -> Vec<(String, String)> {
        self.state.lock().expect("queue lock poisoned").deleted.clone()
    }

    /// Bodies sent through [`TaskQueue::send_one`].
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().expect("queue lock poisoned").sent.clone()
    }

    /// Number of not-yet-received messages.
    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").pending.len()
    }
}

#[async_trait]
impl TaskQueue for MemQueue {
    async fn receive_one(&self) -> Result<Option<ReceivedTask>, QueueError> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if !state.receive_faults.is_empty() {
            return Err(state.receive_faults.remove(0));
        }
        if state.pending.is_empty() {
            Ok(None)
        } else {
            Ok(Some(state.pending.remove(0)))
        }
    }

    async fn delete_one(
        &self,
        message_id: &str,
        receipt_handle: &str,
    ) -> Result<DeleteOutcome, QueueError> {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .deleted
            .push((message_id.to_string(), receipt_handle.to_string()));
        Ok(DeleteOutcome::Deleted)
    }

    async fn send_one(&self, body: &str) -> Result<(), QueueError> {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .sent
            .push(body.to_string());
        Ok(())
    }
}
