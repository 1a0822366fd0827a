//! Error types for hailmesh-dispatch.

use hailmesh_geo::TaxiId;
use hailmesh_wire::WireError;
use thiserror::Error;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while updating the relationship graph.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// No taxi with this id is known.
    #[error("unknown taxi {0}")]
    UnknownTaxi(TaxiId),

    /// No customer with this id is known.
    #[error("unknown customer {0}")]
    UnknownCustomer(TaxiId),

    /// Both exist but are not linked.
    #[error("taxi {taxi} is not linked to customer {customer}")]
    NotLinked { taxi: TaxiId, customer: TaxiId },

    /// A datagram could not be decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}
