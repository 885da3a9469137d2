//! The per-worker upload loop.
//!
//! A worker joins the job, builds its own data-plane handles from the issued
//! credentials, then loops: renew credentials when they age out, fetch one
//! task, materialize it through the configured readers, upload, classify any
//! failure. Task-level failures are logged and skipped; the message becomes
//! visible again after its queue visibility timeout and another worker
//! retries it. Only repeated credential-shaped failures abort the worker.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{error, info, warn};

use voxhaul_core::{Configuration, IngestMode};

use crate::api::EngineOptions;
use crate::backend::{ControlPlane, JobStatus, JoinedJob};
use crate::chunk::{self, NormalizedChunk};
use crate::codec;
use crate::keys::{ChunkKey, TileKey};
use crate::queue::{
    ChunkTaskBody, CuboidSpec, ReceivedTask, SqsQueue, TileTaskBody, UploadQueue,
};
use crate::reader::{self, ChunkReader, PathResolver, TileReader};
use crate::store::{ObjectMetadata, ObjectStore, PutError, S3Store};
use crate::{aws, MalformedKey};

/// Data-plane handles for one worker, built from one join's credentials.
pub struct DataPlane {
    /// The work queue tasks are pulled from.
    pub upload_queue: UploadQueue,
    /// Bookkeeping queue signalled after volumetric uploads, when configured.
    pub tile_index_queue: Option<UploadQueue>,
    /// Destination bucket for tile payloads.
    pub tile_bucket: Arc<dyn ObjectStore>,
    /// Destination bucket for cuboid payloads, for volumetric jobs.
    pub volumetric_bucket: Option<Arc<dyn ObjectStore>>,
}

/// Builds data-plane handles from a join result. The production factory
/// connects to the cloud; tests substitute in-memory stores and queues.
pub trait DataPlaneFactory: Send + Sync {
    /// Connect queues and buckets using the join's credential bundle.
    fn connect(&self, joined: &JoinedJob) -> anyhow::Result<DataPlane>;
}

/// Production factory: SQS queues and S3 buckets.
#[derive(Debug, Default)]
pub struct AwsDataPlaneFactory;

impl DataPlaneFactory for AwsDataPlaneFactory {
    fn connect(&self, joined: &JoinedJob) -> anyhow::Result<DataPlane> {
        let sqs = aws::sqs_client(&joined.credentials);
        let s3 = aws::s3_client(&joined.credentials);

        Ok(DataPlane {
            upload_queue: UploadQueue::new(Arc::new(SqsQueue::new(
                sqs.clone(),
                joined.upload_queue.clone(),
            ))),
            tile_index_queue: joined
                .tile_index_queue
                .as_ref()
                .map(|url| UploadQueue::new(Arc::new(SqsQueue::new(sqs.clone(), url.clone())))),
            tile_bucket: Arc::new(S3Store::new(s3.clone(), joined.tile_bucket.clone())),
            volumetric_bucket: joined.volumetric_bucket.as_ref().map(|bucket| {
                Arc::new(S3Store::new(s3.clone(), bucket.clone())) as Arc<dyn ObjectStore>
            }),
        })
    }
}

/// Credential freshness. `Stale` forces a rejoin at the next loop iteration,
/// regardless of age.
enum CredentialState {
    Fresh(Instant),
    Stale,
}

struct Session {
    joined: JoinedJob,
    plane: DataPlane,
    credentials: CredentialState,
}

/// Whether the worker loop keeps going after a task.
enum Flow {
    Continue,
    Abort,
}

/// Per-cuboid outcome inside one volumetric task.
enum CuboidFlow {
    Uploaded,
    Failed,
    Abort,
}

/// One worker's upload engine.
pub struct Engine {
    backend: Arc<dyn ControlPlane>,
    factory: Arc<dyn DataPlaneFactory>,
    config: Arc<Configuration>,
    options: EngineOptions,
    job_id: u64,
    worker: usize,

    path: Box<dyn PathResolver>,
    tile_reader: Option<Box<dyn TileReader>>,
    chunk_reader: Option<Box<dyn ChunkReader>>,

    session: Option<Session>,
    access_denied_count: u32,
    invalid_access_key_count: u32,
}

impl Engine {
    /// Build an engine for `job_id`, instantiating the configured readers.
    /// Reader `setup` runs exactly once, here.
    pub fn new(
        backend: Arc<dyn ControlPlane>,
        factory: Arc<dyn DataPlaneFactory>,
        config: Arc<Configuration>,
        job_id: u64,
        options: EngineOptions,
    ) -> anyhow::Result<Self> {
        let path_spec = &config.client.path_processor;
        let path = reader::path_resolver(&path_spec.class, &config.reader_params(path_spec))
            .context("configuring path processor")?;

        let (tile_reader, chunk_reader) = match config.mode() {
            IngestMode::Tile => {
                let spec = config
                    .client
                    .tile_processor
                    .as_ref()
                    .context("tile ingest requires a tile processor")?;
                let reader = reader::tile_reader(&spec.class, &config.reader_params(spec))
                    .context("configuring tile processor")?;
                (Some(reader), None)
            }
            IngestMode::Volumetric => {
                let spec = config
                    .client
                    .chunk_processor
                    .as_ref()
                    .context("volumetric ingest requires a chunk processor")?;
                let reader = reader::chunk_reader(&spec.class, &config.reader_params(spec))
                    .context("configuring chunk processor")?;
                (None, Some(reader))
            }
        };

        Ok(Self::with_readers(
            backend,
            factory,
            config,
            job_id,
            options,
            path,
            tile_reader,
            chunk_reader,
        ))
    }

    /// Build an engine around explicit reader instances instead of the
    /// built-in table. This is the seam for linking in custom readers; the
    /// caller is responsible for having run `setup` on each of them.
    #[allow(clippy::too_many_arguments)]
    pub fn with_readers(
        backend: Arc<dyn ControlPlane>,
        factory: Arc<dyn DataPlaneFactory>,
        config: Arc<Configuration>,
        job_id: u64,
        options: EngineOptions,
        path: Box<dyn PathResolver>,
        tile_reader: Option<Box<dyn TileReader>>,
        chunk_reader: Option<Box<dyn ChunkReader>>,
    ) -> Self {
        Self {
            backend,
            factory,
            config,
            options,
            job_id,
            worker: 0,
            path,
            tile_reader,
            chunk_reader,
            session: None,
            access_denied_count: 0,
            invalid_access_key_count: 0,
        }
    }

    /// Tag this engine with a worker index for logging.
    pub fn with_worker_index(mut self, worker: usize) -> Self {
        self.worker = worker;
        self
    }

    /// Join the job: fetch fresh credentials and rebuild the worker's
    /// data-plane handles from them.
    pub async fn join(&mut self) -> anyhow::Result<()> {
        let joined = self.backend.join(self.job_id).await?;
        let plane = self.factory.connect(&joined)?;
        self.session = Some(Session {
            joined,
            plane,
            credentials: CredentialState::Fresh(Instant::now()),
        });
        info!(worker = self.worker, job_id = self.job_id, "joined ingest job");
        Ok(())
    }

    fn session(&self) -> anyhow::Result<&Session> {
        self.session
            .as_ref()
            .context("engine is not joined to a job")
    }

    fn credentials_need_refresh(&self) -> bool {
        match self.session.as_ref().map(|s| &s.credentials) {
            Some(CredentialState::Fresh(created)) => {
                created.elapsed() >= self.options.credential_timeout
            }
            Some(CredentialState::Stale) => true,
            None => false,
        }
    }

    fn mark_credentials_stale(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.credentials = CredentialState::Stale;
        }
    }

    /// Run the upload loop until the queue drains, a stop is signalled, or
    /// repeated credential failures force an abort.
    pub async fn run(&mut self, stop: watch::Receiver<bool>) -> anyhow::Result<()> {
        {
            let session = self.session()?;
            match session.joined.status {
                JobStatus::Uploading => {}
                JobStatus::Preparing => {
                    anyhow::bail!("cannot start upload loop: ingest job is not ready yet")
                }
                other => anyhow::bail!(
                    "cannot start upload loop: ingest job is already {other:?}"
                ),
            }
            if self.config.mode() == IngestMode::Volumetric
                && session.plane.volumetric_bucket.is_none()
            {
                anyhow::bail!("volumetric ingest job provides no cuboid bucket");
            }
        }

        let mut wait_cnt = 0u32;
        loop {
            if *stop.borrow() {
                info!(worker = self.worker, "stop requested; finishing");
                break;
            }

            if self.credentials_need_refresh() {
                // Counters only reset on an age-scheduled renewal. A rejoin
                // forced by upload failures keeps them, so a string of
                // consecutive failures can still trip the abort threshold.
                let scheduled = matches!(
                    self.session.as_ref().map(|s| &s.credentials),
                    Some(CredentialState::Fresh(_))
                );
                warn!(
                    worker = self.worker,
                    "credentials are expiring soon, attempting to renew"
                );
                self.join().await?;
                if scheduled {
                    self.access_denied_count = 0;
                    self.invalid_access_key_count = 0;
                }
                info!(worker = self.worker, "credentials refreshed successfully");
            }

            let task = self.session()?.plane.upload_queue.get_task().await?;
            let Some(task) = task else {
                tokio::time::sleep(self.options.empty_poll_sleep).await;
                wait_cnt += 1;
                if wait_cnt >= self.options.msg_wait_iterations {
                    info!(worker = self.worker, "work queue stayed empty; exiting");
                    break;
                }
                continue;
            };
            wait_cnt = 0;

            let flow = match self.config.mode() {
                IngestMode::Tile => self.upload_tile(&task).await,
                IngestMode::Volumetric => self.upload_chunk(&task).await,
            };
            if matches!(flow, Flow::Abort) {
                break;
            }
        }
        Ok(())
    }

    async fn upload_tile(&mut self, task: &ReceivedTask) -> Flow {
        let body: TileTaskBody = match serde_json::from_str(&task.body) {
            Ok(body) => body,
            Err(err) => {
                error!(worker = self.worker, %err, body = %task.body, "malformed tile task");
                return Flow::Continue;
            }
        };
        let key = match TileKey::decode(&body.tile_key) {
            Ok(key) => key,
            Err(MalformedKey { key, reason }) => {
                error!(worker = self.worker, key = %key, reason = %reason, "undecodable tile key");
                return Flow::Continue;
            }
        };
        info!(
            worker = self.worker,
            x = key.x,
            y = key.y,
            z = key.z,
            t = key.t,
            "processing tile task"
        );

        let locator = match self.path.resolve(key.x, key.y, key.z, key.t) {
            Ok(locator) => locator,
            Err(err) => {
                error!(worker = self.worker, %err, "path resolution failed; skipping task");
                return Flow::Continue;
            }
        };

        let Some(tile_reader) = self.tile_reader.as_ref() else {
            error!(worker = self.worker, "no tile reader configured");
            return Flow::Abort;
        };
        let payload = match tile_reader
            .read_tile(&locator, key.x, key.y, key.z, key.t)
            .await
        {
            Ok(payload) => payload,
            Err(err) => {
                error!(
                    worker = self.worker,
                    %err,
                    locator = %locator,
                    "tile read failed; skipping task"
                );
                return Flow::Continue;
            }
        };

        let Some(tile_size) = self.config.tile_size() else {
            error!(worker = self.worker, "tile ingest without tile_size");
            return Flow::Abort;
        };

        let put_result = {
            let session = match self.session() {
                Ok(session) => session,
                Err(err) => {
                    error!(worker = self.worker, %err, "no active session");
                    return Flow::Abort;
                }
            };
            let descriptor = json!({
                "chunk_key": body.chunk_key,
                "ingest_job": self.job_id,
                "parameters": session.joined.job_params,
                "x_size": tile_size.x,
                "y_size": tile_size.y,
            });
            let mut metadata = ObjectMetadata::new();
            metadata.insert("message_id".to_string(), task.message_id.clone());
            metadata.insert("receipt_handle".to_string(), task.receipt_handle.clone());
            metadata.insert("metadata".to_string(), descriptor.to_string());

            session
                .plane
                .tile_bucket
                .put(&body.tile_key, payload, metadata)
                .await
        };

        match put_result {
            Ok(()) => {
                info!(worker = self.worker, key = %body.tile_key, "successfully wrote tile");
                // The message is not deleted here: the service's
                // object-created handler acknowledges it once indexed.
                Flow::Continue
            }
            Err(err) => self.classify_put_failure(err).await,
        }
    }

    async fn upload_chunk(&mut self, task: &ReceivedTask) -> Flow {
        let body: ChunkTaskBody = match serde_json::from_str(&task.body) {
            Ok(body) => body,
            Err(err) => {
                error!(worker = self.worker, %err, body = %task.body, "malformed chunk task");
                return Flow::Continue;
            }
        };
        let key = match ChunkKey::decode(&body.chunk_key) {
            Ok(key) => key,
            Err(MalformedKey { key, reason }) => {
                error!(worker = self.worker, key = %key, reason = %reason, "undecodable chunk key");
                return Flow::Continue;
            }
        };
        info!(
            worker = self.worker,
            x = key.x,
            y = key.y,
            z = key.z,
            "processing chunk task"
        );

        let locator = match self.path.resolve(key.x, key.y, key.z, key.t) {
            Ok(locator) => locator,
            Err(err) => {
                error!(worker = self.worker, %err, "path resolution failed; skipping task");
                return Flow::Continue;
            }
        };

        let Some(chunk_reader) = self.chunk_reader.as_ref() else {
            error!(worker = self.worker, "no chunk reader configured");
            return Flow::Abort;
        };
        let (data, order) = match chunk_reader.read_chunk(&locator, key.x, key.y, key.z).await {
            Ok(read) => read,
            Err(err) => {
                error!(
                    worker = self.worker,
                    %err,
                    locator = %locator,
                    "chunk read failed; skipping task"
                );
                return Flow::Continue;
            }
        };

        let chunk = match chunk::normalize(data, order) {
            Ok(chunk) => chunk,
            Err(err) => {
                error!(worker = self.worker, %err, "chunk normalization failed; skipping task");
                return Flow::Continue;
            }
        };

        let (bucket, job_params) = {
            let session = match self.session() {
                Ok(session) => session,
                Err(err) => {
                    error!(worker = self.worker, %err, "no active session");
                    return Flow::Abort;
                }
            };
            let Some(bucket) = session.plane.volumetric_bucket.clone() else {
                error!(worker = self.worker, "volumetric bucket disappeared");
                return Flow::Abort;
            };
            (bucket, session.joined.job_params.clone())
        };

        for cuboid in &body.cuboids {
            match self
                .upload_cuboid(&bucket, &job_params, &chunk, cuboid, &body.chunk_key)
                .await
            {
                CuboidFlow::Uploaded => {}
                CuboidFlow::Failed => {
                    warn!(
                        worker = self.worker,
                        chunk_key = %body.chunk_key,
                        "cuboid upload failed; task message stays queued for retry"
                    );
                    return Flow::Continue;
                }
                CuboidFlow::Abort => return Flow::Abort,
            }
        }

        // Every cuboid landed: signal downstream indexing, then retire the
        // task message.
        let session = match self.session() {
            Ok(session) => session,
            Err(err) => {
                error!(worker = self.worker, %err, "no active session");
                return Flow::Abort;
            }
        };
        if let Some(index_queue) = &session.plane.tile_index_queue {
            if !index_queue.put_task(&task.body, 3).await {
                warn!(
                    worker = self.worker,
                    chunk_key = %body.chunk_key,
                    "failed to enqueue tile-index message"
                );
            }
        }
        if !session
            .plane
            .upload_queue
            .delete_task(&task.message_id, &task.receipt_handle)
            .await
        {
            warn!(
                worker = self.worker,
                message_id = %task.message_id,
                "failed to delete finished task from the work queue"
            );
        }

        Flow::Continue
    }

    async fn upload_cuboid(
        &mut self,
        bucket: &Arc<dyn ObjectStore>,
        job_params: &Value,
        chunk: &NormalizedChunk,
        cuboid: &CuboidSpec,
        chunk_key: &str,
    ) -> CuboidFlow {
        let payload = match chunk::cuboid_payload(
            chunk,
            cuboid.x as usize,
            cuboid.y as usize,
            cuboid.z as usize,
        ) {
            Ok(payload) => payload,
            Err(err) => {
                error!(worker = self.worker, %err, key = %cuboid.key, "cuboid carve failed");
                return CuboidFlow::Failed;
            }
        };
        let compressed = codec::compress(&payload.bytes, payload.typesize_bits);

        let descriptor = json!({
            "ingest_job": self.job_id,
            "chunk_key": chunk_key,
            "parameters": job_params,
        });
        let mut metadata = ObjectMetadata::new();
        metadata.insert("metadata".to_string(), descriptor.to_string());

        match bucket.put(&cuboid.key, compressed, metadata).await {
            Ok(()) => {
                info!(worker = self.worker, key = %cuboid.key, "successfully uploaded cuboid");
                CuboidFlow::Uploaded
            }
            Err(err) => match self.classify_put_failure(err).await {
                Flow::Continue => CuboidFlow::Failed,
                Flow::Abort => CuboidFlow::Abort,
            },
        }
    }

    /// Classify a put failure. Credential-shaped failures bump counters and
    /// mark the bundle stale so the next loop iteration rejoins; past the
    /// abort threshold the worker gives up. Anything else is left to queue
    /// visibility.
    async fn classify_put_failure(&mut self, err: PutError) -> Flow {
        match err {
            PutError::AccessDenied { .. } => {
                error!(worker = self.worker, %err, "upload failed: access denied");
                self.access_denied_count += 1;
                if self.access_denied_count >= self.options.error_abort_threshold {
                    error!(
                        worker = self.worker,
                        count = self.access_denied_count,
                        "failed repeatedly with access denied, aborting worker"
                    );
                    return Flow::Abort;
                }
                self.mark_credentials_stale();
                Flow::Continue
            }
            PutError::InvalidAccessKey { .. } => {
                error!(worker = self.worker, %err, "upload failed: invalid access key");
                // Freshly issued keys can take a moment to become valid;
                // only force a rejoin every fifth occurrence.
                tokio::time::sleep(self.options.invalid_key_sleep).await;
                self.invalid_access_key_count += 1;
                if self.invalid_access_key_count >= self.options.error_abort_threshold {
                    error!(
                        worker = self.worker,
                        count = self.invalid_access_key_count,
                        "failed repeatedly with invalid access key, aborting worker"
                    );
                    return Flow::Abort;
                }
                if self.invalid_access_key_count % 5 == 4 {
                    self.mark_credentials_stale();
                }
                Flow::Continue
            }
            PutError::Other { .. } => {
                error!(
                    worker = self.worker,
                    %err,
                    "upload failed; task message will reappear after its visibility timeout"
                );
                Flow::Continue
            }
        }
    }
}
