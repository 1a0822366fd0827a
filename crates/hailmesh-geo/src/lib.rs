//! Hailmesh Geo - Bias-Box Clustering of Moving Taxis
//!
//! This crate answers "which taxis are near this point" over a population
//! whose positions change all the time.
//!
//! # Overview
//!
//! Taxis are grouped into clusters around a reference taxi. Every member of
//! a cluster lies inside the *bias box* of the reference point: a square of
//! half-width [`DEFAULT_BIAS`] on each axis (not a circle). Cluster roots are
//! kept in a balanced tree ordered by latitude.
//!
//! - **Cheap moves**: a member that stays inside its box is updated in place
//! - **Reparenting**: moving or removing a root re-places its whole cluster
//! - **Approximate queries**: [`GeoIndex::query_near`] follows one descent
//!   path, so it can miss taxis that are close but off that path
//!
//! # Example
//!
//! ```rust
//! use hailmesh_geo::{GeoIndex, TaxiId};
//!
//! let mut index = GeoIndex::new();
//! index.upsert(&TaxiId::from("cab-1"), 52.37, 4.89).unwrap();
//! index.upsert(&TaxiId::from("cab-2"), 52.40, 4.90).unwrap();
//!
//! let near = index.query_near(52.38, 4.88);
//! assert_eq!(near.len(), 2);
//! ```

pub mod error;
pub mod index;
pub mod point;
mod tree;

pub use error::{GeoError, Result};
pub use index::{Cluster, GeoIndex, TaxiLocation, Upsert, DEFAULT_BIAS};
pub use point::{GeoPoint, TaxiId, MAX_ID_LEN};
