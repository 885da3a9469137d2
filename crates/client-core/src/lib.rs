#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared configuration types for the `voxhaul` ingest client.

pub mod config;
pub mod token;

pub use config::{
    ChunkSize, Configuration, ConfigurationError, Extent, IngestMode, PluginSpec, TileSize,
    CUBOID_X, CUBOID_Y, CUBOID_Z,
};
pub use token::resolve_api_token;
