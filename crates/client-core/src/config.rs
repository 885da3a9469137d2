use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

/// Native cuboid extent in X, the storage service's fixed sub-volume unit.
pub const CUBOID_X: u64 = 512;
/// Native cuboid extent in Y.
pub const CUBOID_Y: u64 = 512;
/// Native cuboid extent in Z.
pub const CUBOID_Z: u64 = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("ingest configuration file not found, double check the provided path: {0}")]
    FileNotFound(String),
    #[error("malformed JSON in ingest configuration file: {0}")]
    MalformedJson(String),
    #[error("invalid ingest configuration: {0}")]
    Invalid(String),
}

/// Which upload pipeline a job runs: 2-D tiles or volumetric chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    #[default]
    Tile,
    Volumetric,
}

impl IngestMode {
    /// Unit name used in progress reporting.
    pub fn units(&self) -> &'static str {
        match self {
            IngestMode::Tile => "tiles",
            IngestMode::Volumetric => "chunks",
        }
    }
}

/// A reader plugin reference: registry class name plus its free-form parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginSpec {
    pub class: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    pub protocol: String,
    pub host: String,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    pub backend: BackendSection,
    pub path_processor: PluginSpec,
    #[serde(default)]
    pub tile_processor: Option<PluginSpec>,
    #[serde(default)]
    pub chunk_processor: Option<PluginSpec>,
}

/// Dataset extent, one `[start, stop)` pair per axis.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Extent {
    pub x: [i64; 2],
    pub y: [i64; 2],
    pub z: [i64; 2],
    #[serde(default = "default_t_extent")]
    pub t: [i64; 2],
}

fn default_t_extent() -> [i64; 2] {
    [0, 1]
}

impl Extent {
    fn span(range: [i64; 2]) -> i64 {
        range[1] - range[0]
    }
}

/// Tile shape for tile-mode jobs.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TileSize {
    pub x: u64,
    pub y: u64,
    #[serde(default = "one")]
    pub z: u64,
    #[serde(default = "one")]
    pub t: u64,
}

fn one() -> u64 {
    1
}

/// Chunk shape for volumetric jobs; each axis must be a whole number of cuboids.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChunkSize {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestJobSection {
    #[serde(default)]
    pub ingest_type: IngestMode,
    pub resolution: u32,
    pub extent: Extent,
    #[serde(default)]
    pub tile_size: Option<TileSize>,
    #[serde(default)]
    pub chunk_size: Option<ChunkSize>,
}

/// A parsed ingest configuration document.
///
/// The raw JSON is retained verbatim: job creation POSTs the whole document to
/// the ingest service, including sections this client never reads (`schema`,
/// `database`).
#[derive(Debug, Clone)]
pub struct Configuration {
    raw: Value,
    pub client: ClientSection,
    pub ingest_job: IngestJobSection,
}

#[derive(Debug, Deserialize)]
struct DocumentSections {
    client: ClientSection,
    ingest_job: IngestJobSection,
}

impl Configuration {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigurationError::FileNotFound(path.display().to_string()))?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|err| ConfigurationError::MalformedJson(err.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(raw: Value) -> Result<Self, ConfigurationError> {
        let sections: DocumentSections = serde_json::from_value(raw.clone())
            .map_err(|err| ConfigurationError::Invalid(err.to_string()))?;
        let config = Self {
            raw,
            client: sections.client,
            ingest_job: sections.ingest_job,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let extent = &self.ingest_job.extent;
        for (axis, range) in [("x", extent.x), ("y", extent.y), ("z", extent.z), ("t", extent.t)] {
            if range[1] <= range[0] {
                return Err(ConfigurationError::Invalid(format!(
                    "extent.{axis} stop ({}) must be greater than start ({})",
                    range[1], range[0]
                )));
            }
        }

        match self.ingest_job.ingest_type {
            IngestMode::Tile => {
                if self.ingest_job.tile_size.is_none() {
                    return Err(ConfigurationError::Invalid(
                        "tile ingest requires ingest_job.tile_size".into(),
                    ));
                }
                if self.client.tile_processor.is_none() {
                    return Err(ConfigurationError::Invalid(
                        "tile ingest requires client.tile_processor".into(),
                    ));
                }
            }
            IngestMode::Volumetric => {
                let Some(chunk) = self.ingest_job.chunk_size else {
                    return Err(ConfigurationError::Invalid(
                        "volumetric ingest requires ingest_job.chunk_size".into(),
                    ));
                };
                if self.client.chunk_processor.is_none() {
                    return Err(ConfigurationError::Invalid(
                        "volumetric ingest requires client.chunk_processor".into(),
                    ));
                }
                for (axis, size, cuboid) in [
                    ("x", chunk.x, CUBOID_X),
                    ("y", chunk.y, CUBOID_Y),
                    ("z", chunk.z, CUBOID_Z),
                ] {
                    if size == 0 || size % cuboid != 0 {
                        return Err(ConfigurationError::Invalid(format!(
                            "chunk_size.{axis} ({size}) must be a non-zero multiple of {cuboid}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// The full configuration document, as submitted to the ingest service.
    pub fn document(&self) -> &Value {
        &self.raw
    }

    pub fn mode(&self) -> IngestMode {
        self.ingest_job.ingest_type
    }

    pub fn tile_size(&self) -> Option<TileSize> {
        self.ingest_job.tile_size
    }

    pub fn chunk_size(&self) -> Option<ChunkSize> {
        self.ingest_job.chunk_size
    }

    /// Reader parameters for `spec`: the plugin's own sub-tree with the whole
    /// `ingest_job` section spliced in, so readers can see extents and sizes.
    pub fn reader_params(&self, spec: &PluginSpec) -> Value {
        let mut params = match &spec.params {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(job) = self.raw.get("ingest_job") {
            params.insert("ingest_job".to_string(), job.clone());
        }
        Value::Object(params)
    }

    /// Rough task count for the pre-create summary: tiles (one per z and t
    /// plane) or chunks, depending on mode.
    pub fn estimated_task_count(&self) -> u64 {
        let extent = &self.ingest_job.extent;
        let span_x = Extent::span(extent.x).max(0) as u64;
        let span_y = Extent::span(extent.y).max(0) as u64;
        let span_z = Extent::span(extent.z).max(0) as u64;
        let span_t = Extent::span(extent.t).max(0) as u64;

        match self.ingest_job.ingest_type {
            IngestMode::Tile => {
                let Some(tile) = self.ingest_job.tile_size else { return 0 };
                span_x.div_ceil(tile.x) * span_y.div_ceil(tile.y) * span_z * span_t
            }
            IngestMode::Volumetric => {
                let Some(chunk) = self.ingest_job.chunk_size else { return 0 };
                span_x.div_ceil(chunk.x)
                    * span_y.div_ceil(chunk.y)
                    * span_z.div_ceil(chunk.z)
                    * span_t
            }
        }
    }
}
