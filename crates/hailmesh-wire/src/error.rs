//! Error types for hailmesh-wire.

use thiserror::Error;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors produced while decoding a datagram.
///
/// Encoding never fails; every error here means the input bytes were
/// malformed and the datagram should be dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Fewer bytes remained than the next field needs.
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A record did not start with the record marker.
    #[error("bad record marker {0:#010x}")]
    BadMarker(u32),

    /// The leading command word is not a known command.
    #[error("unknown command {0:#x}")]
    UnknownCommand(u32),

    /// The state field held something other than IDLE, PICKUP or ACTIVE.
    #[error("invalid taxi state {0}")]
    InvalidState(u32),

    /// The endpoint field named an unknown address family.
    #[error("invalid endpoint family {0}")]
    InvalidEndpoint(u16),

    /// A list count that cannot possibly fit in the remaining bytes.
    #[error("list of {count} records cannot fit in {remaining} bytes")]
    ListTooLong { count: u32, remaining: usize },

    /// A message that must carry a record carried none.
    #[error("message carries no record")]
    MissingRecord,
}
