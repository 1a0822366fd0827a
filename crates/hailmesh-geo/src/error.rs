//! Error types for hailmesh-geo.

use thiserror::Error;

/// Result type for geo index operations.
pub type Result<T> = std::result::Result<T, GeoError>;

/// Errors that can occur when mutating the index.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    /// A coordinate was NaN or infinite.
    #[error("invalid location [{latitude}:{longitude}]")]
    InvalidLocation { latitude: f64, longitude: f64 },
}
