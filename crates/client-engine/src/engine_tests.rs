//! End-to-end worker scenarios against in-memory queues and stores.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};
use serde_json::{json, Value};
use tokio::sync::watch;

use voxhaul_core::Configuration;
use crate::backend::{
    BackendError, CompletionState, ControlPlane, CredentialBundle, JobProgress, JobStatus,
    JoinedJob,
};
use crate::chunk::{AxisOrder, ChunkData, CUBOID_X, CUBOID_Y, CUBOID_Z};
use crate::codec;
use crate::engine::{DataPlane, DataPlaneFactory, Engine};
use crate::keys::{ChunkKey, TileKey};
use crate::queue::{
    ChunkTaskBody, CuboidSpec, MemQueue, TaskQueue, TileTaskBody, UploadQueue,
};
use crate::reader::{ChunkReader, NullPath, ReaderError, TileReader};
use crate::store::{InjectedFault, MemStore, ObjectStore};
use crate::EngineOptions;

const JOB_ID: u64 = 23;

struct TestBackend {
    joins: Mutex<u32>,
    status: JobStatus,
    volumetric: bool,
    tile_index: bool,
}

impl TestBackend {
    fn uploading() -> Self {
        Self {
            joins: Mutex::new(0),
            status: JobStatus::Uploading,
            volumetric: false,
            tile_index: false,
        }
    }

    fn volumetric() -> Self {
        Self {
            volumetric: true,
            ..Self::uploading()
        }
    }

    fn join_count(&self) -> u32 {
        *self.joins.lock().unwrap()
    }
}

#[async_trait]
impl ControlPlane for TestBackend {
    async fn create(&self, _config: &Value) -> Result<u64, BackendError> {
        Ok(JOB_ID)
    }

    async fn join(&self, _job_id: u64) -> Result<JoinedJob, BackendError> {
        *self.joins.lock().unwrap() += 1;
        Ok(JoinedJob {
            status: self.status,
            credentials: CredentialBundle {
                access_key: "AK".into(),
                secret_key: "SK".into(),
                session_token: None,
            },
            upload_queue: "mem://upload".into(),
            tile_index_queue: self.tile_index.then(|| "mem://tile-index".into()),
            tile_bucket: "tiles".into(),
            volumetric_bucket: self.volumetric.then(|| "cuboids".into()),
            job_params: json!({
                "upload_queue": "mem://upload",
                "resource": {"collection": "col1"}
            }),
            tile_count: 640,
        })
    }

    async fn cancel(&self, _job_id: u64) -> Result<(), BackendError> {
        Ok(())
    }

    async fn complete(&self, _job_id: u64) -> Result<CompletionState, BackendError> {
        Ok(CompletionState::Done)
    }

    async fn get_job_status(&self, _job_id: u64) -> Result<JobProgress, BackendError> {
        Ok(JobProgress {
            current_message_count: 0,
            total_message_count: 640,
            job_status: Some(1),
        })
    }
}

/// Factory that hands every join the same shared in-memory handles, so tests
/// can watch state across rejoins.
struct SharedFactory {
    queue: Arc<MemQueue>,
    index_queue: Option<Arc<MemQueue>>,
    tiles: Arc<MemStore>,
    cuboids: Option<Arc<MemStore>>,
}

impl DataPlaneFactory for SharedFactory {
    fn connect(&self, _joined: &JoinedJob) -> anyhow::Result<DataPlane> {
        Ok(DataPlane {
            upload_queue: UploadQueue::new(self.queue.clone()),
            tile_index_queue: self
                .index_queue
                .clone()
                .map(|q| UploadQueue::new(q as Arc<dyn TaskQueue>)),
            tile_bucket: self.tiles.clone(),
            volumetric_bucket: self.cuboids.clone().map(|s| s as Arc<dyn ObjectStore>),
        })
    }
}

struct FixedTile(Vec<u8>);

#[async_trait]
impl TileReader for FixedTile {
    fn setup(&mut self, _params: &Value) -> Result<(), ReaderError> {
        Ok(())
    }

    async fn read_tile(
        &self,
        _locator: &str,
        _x: u64,
        _y: u64,
        _z: u64,
        _t: u64,
    ) -> Result<Vec<u8>, ReaderError> {
        Ok(self.0.clone())
    }
}

struct FixedChunk {
    data: ChunkData,
    order: AxisOrder,
}

#[async_trait]
impl ChunkReader for FixedChunk {
    fn setup(&mut self, _params: &Value) -> Result<(), ReaderError> {
        Ok(())
    }

    async fn read_chunk(
        &self,
        _locator: &str,
        _x: u64,
        _y: u64,
        _z: u64,
    ) -> Result<(ChunkData, AxisOrder), ReaderError> {
        Ok((self.data.clone(), self.order))
    }
}

fn tile_config() -> Arc<Configuration> {
    Arc::new(
        Configuration::from_value(json!({
            "client": {
                "backend": {"protocol": "https", "host": "api.example.org"},
                "path_processor": {"class": "NullPath", "params": {}},
                "tile_processor": {"class": "FileTileReader", "params": {}}
            },
            "ingest_job": {
                "ingest_type": "tile",
                "resolution": 0,
                "extent": {"x": [0, 8192], "y": [0, 8192], "z": [0, 500], "t": [0, 1]},
                "tile_size": {"x": 512, "y": 512, "z": 1, "t": 1}
            }
        }))
        .unwrap(),
    )
}

fn volumetric_config() -> Arc<Configuration> {
    Arc::new(
        Configuration::from_value(json!({
            "client": {
                "backend": {"protocol": "https", "host": "api.example.org"},
                "path_processor": {"class": "NullPath", "params": {}},
                "chunk_processor": {"class": "RawChunkReader", "params": {"datatype": "uint8"}}
            },
            "ingest_job": {
                "ingest_type": "volumetric",
                "resolution": 0,
                "extent": {"x": [0, 4096], "y": [0, 4096], "z": [0, 128], "t": [0, 1]},
                "chunk_size": {"x": 1024, "y": 1024, "z": 64}
            }
        }))
        .unwrap(),
    )
}

/// Options that drain quickly once the queue is empty.
fn quick_options() -> EngineOptions {
    EngineOptions {
        msg_wait_iterations: 1,
        ..EngineOptions::default()
    }
}

fn sample_tile_key() -> TileKey {
    TileKey {
        collection: 1,
        experiment: 2,
        channel: 3,
        resolution: 0,
        x: 5,
        y: 6,
        z: 1,
        t: 0,
    }
}

fn sample_chunk_key() -> ChunkKey {
    ChunkKey {
        num_tiles: 16,
        collection: 1,
        experiment: 2,
        channel: 3,
        resolution: 0,
        x: 5,
        y: 6,
        z: 1,
        t: 0,
    }
}

fn push_tile_task(queue: &MemQueue, tile_key: &str, chunk_key: &str) {
    let body = serde_json::to_string(&TileTaskBody {
        tile_key: tile_key.to_string(),
        chunk_key: chunk_key.to_string(),
    })
    .unwrap();
    queue.push_body(body);
}

fn zyx_u8(z: usize, y: usize, x: usize, value: impl Fn(usize) -> u8) -> ChunkData {
    let raw: Vec<u8> = (0..z * y * x).map(value).collect();
    ChunkData::U8(ArrayD::from_shape_vec(IxDyn(&[z, y, x]), raw).unwrap())
}

fn tile_engine(
    backend: Arc<TestBackend>,
    factory: Arc<SharedFactory>,
    options: EngineOptions,
    payload: Vec<u8>,
) -> Engine {
    Engine::with_readers(
        backend,
        factory,
        tile_config(),
        JOB_ID,
        options,
        Box::new(NullPath),
        Some(Box::new(FixedTile(payload))),
        None,
    )
}

fn chunk_engine(
    backend: Arc<TestBackend>,
    factory: Arc<SharedFactory>,
    options: EngineOptions,
    data: ChunkData,
    order: AxisOrder,
) -> Engine {
    Engine::with_readers(
        backend,
        factory,
        volumetric_config(),
        JOB_ID,
        options,
        Box::new(NullPath),
        None,
        Some(Box::new(FixedChunk { data, order })),
    )
}

fn stop_flag() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[tokio::test(start_paused = true)]
async fn single_tile_upload_lands_with_metadata() {
    let backend = Arc::new(TestBackend::uploading());
    let queue = Arc::new(MemQueue::new());
    let tiles = Arc::new(MemStore::new("tiles"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: tiles.clone(),
        cuboids: None,
    });

    let tile_key = sample_tile_key().encode();
    let chunk_key = sample_chunk_key().encode();
    push_tile_task(&queue, &tile_key, &chunk_key);

    let mut engine = tile_engine(backend, factory, quick_options(), vec![0xAB; 182_300]);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    assert_eq!(tiles.len(), 1);
    let object = tiles.object(&tile_key).unwrap();
    assert_eq!(object.body.len(), 182_300);
    assert_eq!(object.metadata.get("message_id").unwrap(), "m-1");
    assert_eq!(object.metadata.get("receipt_handle").unwrap(), "r-1");

    let descriptor: Value =
        serde_json::from_str(object.metadata.get("metadata").unwrap()).unwrap();
    assert_eq!(descriptor["chunk_key"], chunk_key.as_str());
    assert_eq!(descriptor["ingest_job"], JOB_ID);
    assert_eq!(descriptor["x_size"], 512);
    assert_eq!(descriptor["y_size"], 512);
    assert_eq!(descriptor["parameters"]["resource"]["collection"], "col1");

    // Tile-mode workers never delete the task message themselves; the
    // service's object-created handler does.
    assert!(queue.deleted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reuploading_the_same_tile_is_idempotent() {
    let backend = Arc::new(TestBackend::uploading());
    let queue = Arc::new(MemQueue::new());
    let tiles = Arc::new(MemStore::new("tiles"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: tiles.clone(),
        cuboids: None,
    });

    let tile_key = sample_tile_key().encode();
    let chunk_key = sample_chunk_key().encode();
    push_tile_task(&queue, &tile_key, &chunk_key);
    push_tile_task(&queue, &tile_key, &chunk_key);

    let mut engine = tile_engine(backend, factory, quick_options(), vec![7; 64]);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    assert_eq!(tiles.len(), 1);
    assert_eq!(tiles.object(&tile_key).unwrap().body.len(), 64);
}

#[tokio::test(start_paused = true)]
async fn volumetric_happy_path_uploads_four_cuboids() {
    let backend = Arc::new(TestBackend::volumetric());
    let queue = Arc::new(MemQueue::new());
    let tiles = Arc::new(MemStore::new("tiles"));
    let cuboids = Arc::new(MemStore::new("cuboids"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: tiles.clone(),
        cuboids: Some(cuboids.clone()),
    });

    let chunk_key = sample_chunk_key().encode();
    let corners = [(0u64, 0u64), (512, 0), (0, 512), (512, 512)];
    let body = ChunkTaskBody {
        chunk_key: chunk_key.clone(),
        cuboids: corners
            .iter()
            .enumerate()
            .map(|(idx, (x, y))| CuboidSpec {
                x: *x,
                y: *y,
                z: 0,
                key: format!("cuboid-{idx}"),
            })
            .collect(),
    };
    queue.push_body(serde_json::to_string(&body).unwrap());

    // (x=1024, y=1024, z=64) chunk in ZYX storage.
    let data = zyx_u8(64, 1024, 1024, |i| (i % 251) as u8);
    let mut engine = chunk_engine(backend, factory, quick_options(), data, AxisOrder::Zyx);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    assert_eq!(cuboids.len(), 4);
    assert!(tiles.is_empty());

    for (idx, (x, _y)) in corners.iter().enumerate() {
        let object = cuboids.object(&format!("cuboid-{idx}")).unwrap();
        let raw = codec::decompress(&object.body, 8).unwrap();
        assert_eq!(raw.len(), CUBOID_X * CUBOID_Y * CUBOID_Z);

        // First voxel of the cuboid comes from source (z=0, y=y0, x=x0).
        let y0 = corners[idx].1 as usize;
        let flat = y0 * 1024 + *x as usize;
        assert_eq!(raw[0], (flat % 251) as u8);

        // Volumetric metadata carries only the JSON descriptor.
        assert_eq!(object.metadata.len(), 1);
        let descriptor: Value =
            serde_json::from_str(object.metadata.get("metadata").unwrap()).unwrap();
        assert_eq!(descriptor["chunk_key"], chunk_key.as_str());
        assert_eq!(descriptor["ingest_job"], JOB_ID);
        assert!(descriptor["parameters"].is_object());
    }

    // Exactly one delete for the source message, after all cuboids landed.
    assert_eq!(queue.deleted(), vec![("m-1".to_string(), "r-1".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn partial_chunk_pads_cuboid_with_zeros() {
    let backend = Arc::new(TestBackend::volumetric());
    let queue = Arc::new(MemQueue::new());
    let cuboids = Arc::new(MemStore::new("cuboids"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: Arc::new(MemStore::new("tiles")),
        cuboids: Some(cuboids.clone()),
    });

    let chunk_key = sample_chunk_key().encode();
    let body = ChunkTaskBody {
        chunk_key,
        cuboids: vec![CuboidSpec {
            x: 0,
            y: 0,
            z: 0,
            key: "partial".to_string(),
        }],
    };
    queue.push_body(serde_json::to_string(&body).unwrap());

    // (x=509, y=501, z=13) chunk, all ones, in ZYX storage.
    let data = zyx_u8(13, 501, 509, |_| 1);
    let mut engine = chunk_engine(backend, factory, quick_options(), data, AxisOrder::Zyx);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    let object = cuboids.object("partial").unwrap();
    let raw = codec::decompress(&object.body, 8).unwrap();
    assert_eq!(raw.len(), CUBOID_X * CUBOID_Y * CUBOID_Z);

    // Inside the data extent.
    assert_eq!(raw[0], 1);
    assert_eq!(raw[508], 1);
    // Beyond x=509 on the first row: zero padding.
    assert_eq!(raw[509], 0);
    assert_eq!(raw[511], 0);
    // Whole z slabs beyond z=13: zero padding.
    let slab = CUBOID_X * CUBOID_Y;
    assert!(raw[13 * slab..].iter().all(|&b| b == 0));

    assert_eq!(queue.deleted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn volumetric_success_signals_tile_index_queue() {
    let backend = Arc::new(TestBackend {
        tile_index: true,
        ..TestBackend::volumetric()
    });
    let queue = Arc::new(MemQueue::new());
    let index_queue = Arc::new(MemQueue::new());
    let cuboids = Arc::new(MemStore::new("cuboids"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: Some(index_queue.clone()),
        tiles: Arc::new(MemStore::new("tiles")),
        cuboids: Some(cuboids.clone()),
    });

    let body = ChunkTaskBody {
        chunk_key: sample_chunk_key().encode(),
        cuboids: vec![CuboidSpec {
            x: 0,
            y: 0,
            z: 0,
            key: "only".to_string(),
        }],
    };
    queue.push_body(serde_json::to_string(&body).unwrap());

    let data = zyx_u8(16, 512, 512, |i| (i % 7) as u8);
    let mut engine = chunk_engine(backend, factory, quick_options(), data, AxisOrder::Zyx);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    assert_eq!(cuboids.len(), 1);
    assert_eq!(index_queue.sent().len(), 1);
    assert_eq!(queue.deleted().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn zero_credential_timeout_rejoins_before_every_fetch() {
    let backend = Arc::new(TestBackend::uploading());
    let queue = Arc::new(MemQueue::new());
    let tiles = Arc::new(MemStore::new("tiles"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: tiles.clone(),
        cuboids: None,
    });

    let tile_key = sample_tile_key().encode();
    let chunk_key = sample_chunk_key().encode();
    push_tile_task(&queue, &tile_key, &chunk_key);
    push_tile_task(&queue, &tile_key, &chunk_key);

    let options = EngineOptions {
        credential_timeout: Duration::ZERO,
        msg_wait_iterations: 1,
        ..EngineOptions::default()
    };
    let mut engine = tile_engine(backend.clone(), factory, options, vec![1; 8]);
    engine.join().await.unwrap();
    assert_eq!(backend.join_count(), 1);

    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    // One rejoin before each of the three fetches (two tasks, one empty poll).
    assert_eq!(backend.join_count(), 4);
    assert_eq!(tiles.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn empty_queue_drains_after_wait_budget() {
    let backend = Arc::new(TestBackend::uploading());
    let queue = Arc::new(MemQueue::new());
    let tiles = Arc::new(MemStore::new("tiles"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: tiles.clone(),
        cuboids: None,
    });

    let mut engine = tile_engine(backend, factory, EngineOptions::default(), vec![]);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    assert!(tiles.is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_access_denied_aborts_the_worker() {
    let backend = Arc::new(TestBackend::uploading());
    let queue = Arc::new(MemQueue::new());
    let tiles = Arc::new(MemStore::new("tiles"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: tiles.clone(),
        cuboids: None,
    });

    let tile_key = sample_tile_key().encode();
    let chunk_key = sample_chunk_key().encode();
    for _ in 0..25 {
        push_tile_task(&queue, &tile_key, &chunk_key);
    }
    for _ in 0..20 {
        tiles.inject_fault(InjectedFault::AccessDenied);
    }

    let mut engine = tile_engine(backend.clone(), factory, quick_options(), vec![0; 8]);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    // Aborted at the twentieth failure: remaining tasks stay queued.
    assert_eq!(queue.pending_len(), 5);
    assert!(tiles.is_empty());
    // Each of the first nineteen failures forced a rejoin.
    assert_eq!(backend.join_count(), 20);
}

#[tokio::test(start_paused = true)]
async fn invalid_access_key_forces_rejoin_every_fifth_failure() {
    let backend = Arc::new(TestBackend::uploading());
    let queue = Arc::new(MemQueue::new());
    let tiles = Arc::new(MemStore::new("tiles"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: tiles.clone(),
        cuboids: None,
    });

    let tile_key = sample_tile_key().encode();
    let chunk_key = sample_chunk_key().encode();
    for _ in 0..5 {
        push_tile_task(&queue, &tile_key, &chunk_key);
    }
    for _ in 0..4 {
        tiles.inject_fault(InjectedFault::InvalidAccessKey);
    }

    let mut engine = tile_engine(backend.clone(), factory, quick_options(), vec![0; 8]);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    // Only the fourth failure (count % 5 == 4) forced a rejoin.
    assert_eq!(backend.join_count(), 2);
    assert_eq!(tiles.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn other_upload_errors_skip_the_task_and_continue() {
    let backend = Arc::new(TestBackend::uploading());
    let queue = Arc::new(MemQueue::new());
    let tiles = Arc::new(MemStore::new("tiles"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: tiles.clone(),
        cuboids: None,
    });

    let tile_key = sample_tile_key().encode();
    let chunk_key = sample_chunk_key().encode();
    push_tile_task(&queue, &tile_key, &chunk_key);
    push_tile_task(&queue, &tile_key, &chunk_key);
    tiles.inject_fault(InjectedFault::Other);

    let mut engine = tile_engine(backend.clone(), factory, quick_options(), vec![0; 8]);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    // The second task went through; no rejoin was forced.
    assert_eq!(tiles.len(), 1);
    assert_eq!(backend.join_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_cuboid_leaves_the_task_message_queued() {
    let backend = Arc::new(TestBackend::volumetric());
    let queue = Arc::new(MemQueue::new());
    let cuboids = Arc::new(MemStore::new("cuboids"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: Arc::new(MemStore::new("tiles")),
        cuboids: Some(cuboids.clone()),
    });

    let body = ChunkTaskBody {
        chunk_key: sample_chunk_key().encode(),
        cuboids: vec![
            CuboidSpec {
                x: 0,
                y: 0,
                z: 0,
                key: "first".to_string(),
            },
            CuboidSpec {
                x: 512,
                y: 0,
                z: 0,
                key: "second".to_string(),
            },
        ],
    };
    queue.push_body(serde_json::to_string(&body).unwrap());

    // Second cuboid put fails with a generic error.
    cuboids.inject_fault(InjectedFault::Other);

    let data = zyx_u8(16, 512, 1024, |_| 3);
    let mut engine = chunk_engine(backend, factory, quick_options(), data, AxisOrder::Zyx);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    // First cuboid failed, the second was never attempted, and the task
    // message was not deleted.
    assert!(cuboids.is_empty());
    assert!(queue.deleted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_requires_a_join() {
    let backend = Arc::new(TestBackend::uploading());
    let factory = Arc::new(SharedFactory {
        queue: Arc::new(MemQueue::new()),
        index_queue: None,
        tiles: Arc::new(MemStore::new("tiles")),
        cuboids: None,
    });

    let mut engine = tile_engine(backend, factory, quick_options(), vec![]);
    let (_tx, rx) = stop_flag();
    assert!(engine.run(rx).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn run_refuses_a_preparing_job() {
    let backend = Arc::new(TestBackend {
        status: JobStatus::Preparing,
        ..TestBackend::uploading()
    });
    let factory = Arc::new(SharedFactory {
        queue: Arc::new(MemQueue::new()),
        index_queue: None,
        tiles: Arc::new(MemStore::new("tiles")),
        cuboids: None,
    });

    let mut engine = tile_engine(backend, factory, quick_options(), vec![]);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    let err = engine.run(rx).await.unwrap_err();
    assert!(err.to_string().contains("not ready"));
}

#[tokio::test(start_paused = true)]
async fn malformed_task_bodies_are_skipped() {
    let backend = Arc::new(TestBackend::uploading());
    let queue = Arc::new(MemQueue::new());
    let tiles = Arc::new(MemStore::new("tiles"));
    let factory = Arc::new(SharedFactory {
        queue: queue.clone(),
        index_queue: None,
        tiles: tiles.clone(),
        cuboids: None,
    });

    queue.push_body("this is not json");
    queue.push_body(r#"{"tile_key": "not&a&valid&key", "chunk_key": "c"}"#);
    let tile_key = sample_tile_key().encode();
    push_tile_task(&queue, &tile_key, &sample_chunk_key().encode());

    let mut engine = tile_engine(backend, factory, quick_options(), vec![9; 16]);
    engine.join().await.unwrap();
    let (_tx, rx) = stop_flag();
    engine.run(rx).await.unwrap();

    // The two bad tasks were logged and skipped; the good one landed.
    assert_eq!(tiles.len(), 1);
    assert!(tiles.object(&tile_key).is_some());
}
