//! Deterministic object keys for tiles and chunks.
//!
//! A key is the MD5 hex digest of its base string, then the base string
//! itself, all fields joined with `&`:
//!
//! ```text
//! tile:  md5&collection&experiment&channel&resolution&x&y&z&t
//! chunk: md5&num_tiles&collection&experiment&channel&resolution&x&y&z&t
//! ```
//!
//! The digest prefix spreads keys across object-store partitions; it carries
//! no integrity meaning. Because keys are pure functions of task coordinates,
//! any two workers that pick up the same task write the same object, which is
//! what makes at-least-once queue delivery safe.

/// A key that could not be split into the expected integer fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed key {key:?}: {reason}")]
pub struct MalformedKey {
    /// The offending key.
    pub key: String,
    /// What was wrong with it.
    pub reason: String,
}

impl MalformedKey {
    fn new(key: &str, reason: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Coordinates of one uploaded tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileKey {
    /// Collection id of the destination dataset.
    pub collection: u64,
    /// Experiment id of the destination dataset.
    pub experiment: u64,
    /// Channel id of the destination dataset.
    pub channel: u64,
    /// Resolution level; 0 is native.
    pub resolution: u64,
    /// Tile index along X.
    pub x: u64,
    /// Tile index along Y.
    pub y: u64,
    /// Tile index along Z.
    pub z: u64,
    /// Time index.
    pub t: u64,
}

/// Coordinates of one chunk, plus how many z-aligned tiles constitute it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkKey {
    /// Expected number of tiles in this chunk along Z (1 for volumetric jobs).
    pub num_tiles: u64,
    /// Collection id of the destination dataset.
    pub collection: u64,
    /// Experiment id of the destination dataset.
    pub experiment: u64,
    /// Channel id of the destination dataset.
    pub channel: u64,
    /// Resolution level; 0 is native.
    pub resolution: u64,
    /// Chunk index along X.
    pub x: u64,
    /// Chunk index along Y.
    pub y: u64,
    /// Chunk index along Z.
    pub z: u64,
    /// Time index.
    pub t: u64,
}

fn hashed(base: String) -> String {
    format!("{:x}&{}", md5::compute(base.as_bytes()), base)
}

fn parse_field(key: &str, parts: &[&str], idx: usize, name: &str) -> Result<u64, MalformedKey> {
    let raw = parts
        .get(idx)
        .ok_or_else(|| MalformedKey::new(key, format!("missing field {name}")))?;
    raw.parse()
        .map_err(|_| MalformedKey::new(key, format!("field {name} is not an integer: {raw:?}")))
}

impl TileKey {
    /// Encode into the tile object key.
    pub fn encode(&self) -> String {
        let Self {
            collection,
            experiment,
            channel,
            resolution,
            x,
            y,
            z,
            t,
        } = self;
        hashed(format!(
            "{collection}&{experiment}&{channel}&{resolution}&{x}&{y}&{z}&{t}"
        ))
    }

    /// Decode a tile object key. The hash prefix is skipped, not verified.
    pub fn decode(key: &str) -> Result<Self, MalformedKey> {
        let parts: Vec<&str> = key.split('&').collect();
        if parts.len() != 9 {
            return Err(MalformedKey::new(
                key,
                format!("expected 9 fields, got {}", parts.len()),
            ));
        }
        Ok(Self {
            collection: parse_field(key, &parts, 1, "collection")?,
            experiment: parse_field(key, &parts, 2, "experiment")?,
            channel: parse_field(key, &parts, 3, "channel")?,
            resolution: parse_field(key, &parts, 4, "resolution")?,
            x: parse_field(key, &parts, 5, "x")?,
            y: parse_field(key, &parts, 6, "y")?,
            z: parse_field(key, &parts, 7, "z")?,
            t: parse_field(key, &parts, 8, "t")?,
        })
    }
}

impl ChunkKey {
    /// Encode into the chunk grouping key.
    pub fn encode(&self) -> String {
        let Self {
            num_tiles,
            collection,
            experiment,
            channel,
            resolution,
            x,
            y,
            z,
            t,
        } = self;
        hashed(format!(
            "{num_tiles}&{collection}&{experiment}&{channel}&{resolution}&{x}&{y}&{z}&{t}"
        ))
    }

    /// Decode a chunk grouping key. The hash prefix is skipped, not verified.
    pub fn decode(key: &str) -> Result<Self, MalformedKey> {
        let parts: Vec<&str> = key.split('&').collect();
        if parts.len() != 10 {
            return Err(MalformedKey::new(
                key,
                format!("expected 10 fields, got {}", parts.len()),
            ));
        }
        Ok(Self {
            num_tiles: parse_field(key, &parts, 1, "num_tiles")?,
            collection: parse_field(key, &parts, 2, "collection")?,
            experiment: parse_field(key, &parts, 3, "experiment")?,
            channel: parse_field(key, &parts, 4, "channel")?,
            resolution: parse_field(key, &parts, 5, "resolution")?,
            x: parse_field(key, &parts, 6, "x")?,
            y: parse_field(key, &parts, 7, "y")?,
            z: parse_field(key, &parts, 8, "z")?,
            t: parse_field(key, &parts, 9, "t")?,
        })
    }
}
