//! Error types for Hailmesh nodes.

use std::time::Duration;

use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a node.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed datagram
    #[error("Wire error: {0}")]
    Wire(#[from] hailmesh_wire::WireError),

    /// Relationship graph error
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] hailmesh_dispatch::Error),

    /// Rejected location
    #[error("Geo error: {0}")]
    Geo(#[from] hailmesh_geo::GeoError),

    /// Socket bind/send/receive failure
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),

    /// Unparseable input file
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No reply in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
