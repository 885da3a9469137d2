//! Source reader interfaces and the built-in reader table.
//!
//! Readers come in pairs: a path resolver turns task indices into an opaque
//! locator, and a data reader turns the locator into bytes (tile mode) or an
//! array (volumetric mode). Concrete format readers (TIFF stacks, HDF5,
//! remote volumes) satisfy these traits and register under a class name; the
//! table below carries the built-in filesystem readers. Class names from
//! older dotted configurations are matched by their final segment.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::chunk::{AxisOrder, ChunkData};

/// A reader failure.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    /// The requested indices fall outside the configured extent.
    #[error("indices out of range: {0}")]
    OutOfRange(String),
    /// The reader's parameters are missing or malformed.
    #[error("reader parameters invalid: {0}")]
    BadParams(String),
    /// Source I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Turns task indices into a source locator (a file path, a URL, or empty
/// when the data reader needs only the indices).
pub trait PathResolver: Send + Sync {
    /// Consume the plugin's parameter tree. Called exactly once.
    fn setup(&mut self, params: &Value) -> Result<(), ReaderError>;

    /// Resolve the locator for the given tile indices.
    fn resolve(&self, x: u64, y: u64, z: u64, t: u64) -> Result<String, ReaderError>;
}

/// Produces one self-contained image payload per tile.
#[async_trait]
pub trait TileReader: Send + Sync {
    /// Consume the plugin's parameter tree. Called exactly once.
    fn setup(&mut self, params: &Value) -> Result<(), ReaderError>;

    /// Read the tile at the locator; the payload must be a complete image
    /// file the ingest service can decode on its own.
    async fn read_tile(
        &self,
        locator: &str,
        x: u64,
        y: u64,
        z: u64,
        t: u64,
    ) -> Result<Vec<u8>, ReaderError>;
}

/// Produces one chunk array per volumetric task.
#[async_trait]
pub trait ChunkReader: Send + Sync {
    /// Consume the plugin's parameter tree. Called exactly once.
    fn setup(&mut self, params: &Value) -> Result<(), ReaderError>;

    /// Read the chunk at the locator, returning the array and its axis order.
    async fn read_chunk(
        &self,
        locator: &str,
        x: u64,
        y: u64,
        z: u64,
    ) -> Result<(ChunkData, AxisOrder), ReaderError>;
}

fn class_name(class: &str) -> &str {
    class.rsplit('.').next().unwrap_or(class)
}

/// Instantiate and set up a path resolver by class name.
pub fn path_resolver(class: &str, params: &Value) -> anyhow::Result<Box<dyn PathResolver>> {
    let mut resolver: Box<dyn PathResolver> = match class_name(class) {
        "ZIndexStackPath" => Box::new(ZIndexStackPath::default()),
        "NullPath" => Box::new(NullPath),
        other => anyhow::bail!("unknown path processor class: {other}"),
    };
    resolver.setup(params)?;
    Ok(resolver)
}

/// Instantiate and set up a tile reader by class name.
pub fn tile_reader(class: &str, params: &Value) -> anyhow::Result<Box<dyn TileReader>> {
    let mut reader: Box<dyn TileReader> = match class_name(class) {
        "FileTileReader" => Box::new(FileTileReader),
        other => anyhow::bail!("unknown tile processor class: {other}"),
    };
    reader.setup(params)?;
    Ok(reader)
}

/// Instantiate and set up a chunk reader by class name.
pub fn chunk_reader(class: &str, params: &Value) -> anyhow::Result<Box<dyn ChunkReader>> {
    let mut reader: Box<dyn ChunkReader> = match class_name(class) {
        "RawChunkReader" => Box::new(RawChunkReader::default()),
        other => anyhow::bail!("unknown chunk processor class: {other}"),
    };
    reader.setup(params)?;
    Ok(reader)
}

/// Resolver for image stacks whose files increment only in Z.
///
/// `base_filename` marks where the z index lands with a `<>` token. `<o:N>`
/// adds an offset, `<p:N>` zero-pads: `<o:200>_sect_<p:4>` resolves z=1 to
/// `201_sect_0001` (one token per template).
#[derive(Debug, Default)]
pub struct ZIndexStackPath {
    root_dir: String,
    base_filename: String,
    extension: String,
    z_stop: i64,
}

#[derive(Debug, Deserialize)]
struct ZIndexStackPathParams {
    root_dir: String,
    base_filename: String,
    extension: String,
    ingest_job: ZIndexStackJob,
}

#[derive(Debug, Deserialize)]
struct ZIndexStackJob {
    extent: ZIndexStackExtent,
}

#[derive(Debug, Deserialize)]
struct ZIndexStackExtent {
    z: [i64; 2],
}

fn expand_z_token(token: &str, z: u64) -> Result<String, ReaderError> {
    let mut offset: u64 = 0;
    let mut pad: usize = 0;
    let mut head = token;
    if let Some(idx) = head.find("p:") {
        pad = head[idx + 2..]
            .parse()
            .map_err(|_| ReaderError::BadParams(format!("bad pad in token {token:?}")))?;
        head = &head[..idx];
    }
    if let Some(raw) = head.strip_prefix("o:") {
        offset = raw
            .parse()
            .map_err(|_| ReaderError::BadParams(format!("bad offset in token {token:?}")))?;
    } else if !head.is_empty() {
        return Err(ReaderError::BadParams(format!(
            "unrecognized token {token:?} in base_filename"
        )));
    }
    Ok(format!("{:0pad$}", z + offset, pad = pad))
}

/// Replace every `<...>` token in the template with the formatted z index.
fn format_z_template(base: &str, z: u64) -> Result<String, ReaderError> {
    let mut out = String::new();
    let mut rest = base;
    while let Some(start) = rest.find('<') {
        let Some(end) = rest[start..].find('>').map(|rel| start + rel) else {
            return Err(ReaderError::BadParams(format!(
                "base_filename has an unterminated token: {base:?}"
            )));
        };
        out.push_str(&rest[..start]);
        out.push_str(&expand_z_token(&rest[start + 1..end], z)?);
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

impl PathResolver for ZIndexStackPath {
    fn setup(&mut self, params: &Value) -> Result<(), ReaderError> {
        let params: ZIndexStackPathParams = serde_json::from_value(params.clone())
            .map_err(|err| ReaderError::BadParams(err.to_string()))?;
        self.root_dir = params.root_dir;
        self.base_filename = params.base_filename;
        self.extension = params.extension.trim_start_matches('.').to_string();
        self.z_stop = params.ingest_job.extent.z[1];
        Ok(())
    }

    fn resolve(&self, _x: u64, _y: u64, z: u64, t: u64) -> Result<String, ReaderError> {
        if t != 0 {
            return Err(ReaderError::OutOfRange(
                "z image stacks only support non-time-series data".to_string(),
            ));
        }
        if (z as i64) >= self.z_stop {
            return Err(ReaderError::OutOfRange(format!(
                "z index {z} is outside the configured extent"
            )));
        }

        let filename = format_z_template(&self.base_filename, z)?;
        Ok(format!(
            "{}/{}.{}",
            self.root_dir.trim_end_matches('/'),
            filename,
            self.extension
        ))
    }
}

/// Resolver that always yields an empty locator, for readers that derive
/// everything from the indices themselves.
#[derive(Debug, Default)]
pub struct NullPath;

impl PathResolver for NullPath {
    fn setup(&mut self, _params: &Value) -> Result<(), ReaderError> {
        Ok(())
    }

    fn resolve(&self, _x: u64, _y: u64, _z: u64, _t: u64) -> Result<String, ReaderError> {
        Ok(String::new())
    }
}

/// Tile reader that uploads the resolved file verbatim.
#[derive(Debug, Default)]
pub struct FileTileReader;

#[async_trait]
impl TileReader for FileTileReader {
    fn setup(&mut self, _params: &Value) -> Result<(), ReaderError> {
        Ok(())
    }

    async fn read_tile(
        &self,
        locator: &str,
        _x: u64,
        _y: u64,
        _z: u64,
        _t: u64,
    ) -> Result<Vec<u8>, ReaderError> {
        if locator.is_empty() {
            return Err(ReaderError::Other(
                "file tile reader needs a file locator".to_string(),
            ));
        }
        Ok(tokio::fs::read(locator).await?)
    }
}

/// Chunk reader for raw little-endian volumes stored one file per chunk, in
/// Z-Y-X order, shaped exactly like the configured chunk size.
#[derive(Debug, Default)]
pub struct RawChunkReader {
    dtype: String,
    shape_zyx: [usize; 3],
}

#[derive(Debug, Deserialize)]
struct RawChunkReaderParams {
    datatype: String,
    ingest_job: RawChunkJob,
}

#[derive(Debug, Deserialize)]
struct RawChunkJob {
    chunk_size: RawChunkSize,
}

#[derive(Debug, Deserialize)]
struct RawChunkSize {
    x: usize,
    y: usize,
    z: usize,
}

#[async_trait]
impl ChunkReader for RawChunkReader {
    fn setup(&mut self, params: &Value) -> Result<(), ReaderError> {
        let params: RawChunkReaderParams = serde_json::from_value(params.clone())
            .map_err(|err| ReaderError::BadParams(err.to_string()))?;
        match params.datatype.as_str() {
            "uint8" | "uint16" | "uint32" | "uint64" => {}
            other => {
                return Err(ReaderError::BadParams(format!(
                    "unsupported datatype {other:?}"
                )))
            }
        }
        self.dtype = params.datatype;
        self.shape_zyx = [
            params.ingest_job.chunk_size.z,
            params.ingest_job.chunk_size.y,
            params.ingest_job.chunk_size.x,
        ];
        Ok(())
    }

    async fn read_chunk(
        &self,
        locator: &str,
        _x: u64,
        _y: u64,
        _z: u64,
    ) -> Result<(ChunkData, AxisOrder), ReaderError> {
        let bytes = tokio::fs::read(locator).await?;
        let voxels: usize = self.shape_zyx.iter().product();
        let shape = ndarray::IxDyn(&self.shape_zyx);

        let data = match self.dtype.as_str() {
            "uint8" => {
                expect_len(locator, bytes.len(), voxels)?;
                ChunkData::U8(to_array(shape, bytes)?)
            }
            "uint16" => {
                expect_len(locator, bytes.len(), voxels * 2)?;
                ChunkData::U16(to_array(shape, bytemuck::pod_collect_to_vec(&bytes))?)
            }
            "uint32" => {
                expect_len(locator, bytes.len(), voxels * 4)?;
                ChunkData::U32(to_array(shape, bytemuck::pod_collect_to_vec(&bytes))?)
            }
            "uint64" => {
                expect_len(locator, bytes.len(), voxels * 8)?;
                ChunkData::U64(to_array(shape, bytemuck::pod_collect_to_vec(&bytes))?)
            }
            other => return Err(ReaderError::BadParams(format!("unsupported datatype {other:?}"))),
        };
        Ok((data, AxisOrder::Zyx))
    }
}

fn expect_len(locator: &str, got: usize, want: usize) -> Result<(), ReaderError> {
    if got != want {
        return Err(ReaderError::Other(format!(
            "chunk file {locator} holds {got} bytes, expected {want}"
        )));
    }
    Ok(())
}

fn to_array<T>(shape: ndarray::IxDyn, data: Vec<T>) -> Result<ndarray::ArrayD<T>, ReaderError> {
    ndarray::ArrayD::from_shape_vec(shape, data)
        .map_err(|err| ReaderError::Other(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stack_params() -> Value {
        json!({
            "root_dir": "/data/stack/",
            "base_filename": "<o:200>_section_<p:4>",
            "extension": "png",
            "ingest_job": {"extent": {"z": [0, 500]}}
        })
    }

    #[test]
    fn z_stack_formats_offset_and_padding() {
        let resolver = path_resolver("ZIndexStackPath", &stack_params()).unwrap();
        assert_eq!(
            resolver.resolve(0, 0, 1, 0).unwrap(),
            "/data/stack/201_section_0001.png"
        );

        let params = json!({
            "root_dir": "/data",
            "base_filename": "sect_<o:200p:4>",
            "extension": "png",
            "ingest_job": {"extent": {"z": [0, 500]}}
        });
        let resolver = path_resolver("ZIndexStackPath", &params).unwrap();
        assert_eq!(resolver.resolve(0, 0, 1, 0).unwrap(), "/data/sect_0201.png");
    }

    #[test]
    fn z_stack_plain_token() {
        let params = json!({
            "root_dir": "/data",
            "base_filename": "img_<>",
            "extension": "tif",
            "ingest_job": {"extent": {"z": [0, 10]}}
        });
        let resolver = path_resolver("ZIndexStackPath", &params).unwrap();
        assert_eq!(resolver.resolve(3, 7, 9, 0).unwrap(), "/data/img_9.tif");
    }

    #[test]
    fn z_stack_rejects_out_of_extent_z() {
        let resolver = path_resolver("ZIndexStackPath", &stack_params()).unwrap();
        assert!(matches!(
            resolver.resolve(0, 0, 500, 0),
            Err(ReaderError::OutOfRange(_))
        ));
    }

    #[test]
    fn z_stack_rejects_time_series() {
        let resolver = path_resolver("ZIndexStackPath", &stack_params()).unwrap();
        assert!(matches!(
            resolver.resolve(0, 0, 1, 1),
            Err(ReaderError::OutOfRange(_))
        ));
    }

    #[test]
    fn dotted_class_names_match_final_segment() {
        let resolver = path_resolver("plugins.stack.NullPath", &Value::Null).unwrap();
        assert_eq!(resolver.resolve(1, 2, 3, 4).unwrap(), "");
    }

    #[test]
    fn unknown_class_is_an_error() {
        assert!(path_resolver("Hdf5TimeSeriesPath", &Value::Null).is_err());
        assert!(tile_reader("CatmaidReader", &Value::Null).is_err());
        assert!(chunk_reader("ZarrReader", &Value::Null).is_err());
    }

    #[tokio::test]
    async fn file_tile_reader_round_trips_file() {
        let dir = std::env::temp_dir().join("voxhaul-reader-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tile.png");
        std::fs::write(&path, b"not really a png").unwrap();

        let reader = tile_reader("FileTileReader", &Value::Null).unwrap();
        let bytes = reader
            .read_tile(path.to_str().unwrap(), 0, 0, 0, 0)
            .await
            .unwrap();
        assert_eq!(bytes, b"not really a png");
    }

    #[tokio::test]
    async fn raw_chunk_reader_reads_zyx_u16() {
        let params = json!({
            "datatype": "uint16",
            "ingest_job": {"chunk_size": {"x": 4, "y": 2, "z": 2}}
        });
        let reader = chunk_reader("RawChunkReader", &params).unwrap();

        let dir = std::env::temp_dir().join("voxhaul-reader-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("chunk.raw");
        let voxels: Vec<u8> = (0..16u16).flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(&path, &voxels).unwrap();

        let (data, order) = reader
            .read_chunk(path.to_str().unwrap(), 0, 0, 0)
            .await
            .unwrap();
        assert_eq!(order, AxisOrder::Zyx);
        let ChunkData::U16(arr) = data else {
            panic!("wrong dtype");
        };
        assert_eq!(arr.shape(), &[2, 2, 4]);
        assert_eq!(arr[[1, 0, 0]], 8);
    }

    #[tokio::test]
    async fn raw_chunk_reader_rejects_short_file() {
        let params = json!({
            "datatype": "uint8",
            "ingest_job": {"chunk_size": {"x": 512, "y": 512, "z": 16}}
        });
        let reader = chunk_reader("RawChunkReader", &params).unwrap();

        let dir = std::env::temp_dir().join("voxhaul-reader-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("short.raw");
        std::fs::write(&path, [0u8; 16]).unwrap();

        assert!(matches!(
            reader.read_chunk(path.to_str().unwrap(), 0, 0, 0).await,
            Err(ReaderError::Other(_))
        ));
    }
}
