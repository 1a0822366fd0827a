//! Hailmesh Node - directory, taxi and customer processes
//!
//! # Roles
//!
//! - [`DirectoryService`]: holds the geo index, answers fetches
//! - [`TaxiNode`]: registers with the directory and answers pings
//! - [`Hail`]: a customer's fetch-then-ping request
//!
//! Each role owns a [`Dispatcher`](hailmesh_transfer::Dispatcher), so all of
//! its protocol state is touched by one task only.

pub mod client;
pub mod config;
pub mod customer;
pub mod directory;
pub mod error;
pub mod peer;
pub mod scan;
pub mod taxi;

pub use client::DirectoryClient;
pub use config::NodeConfig;
pub use customer::{Hail, Notice};
pub use directory::{DirectoryConfig, DirectoryService};
pub use error::{Error, Result};
pub use peer::PeerHandler;
pub use scan::{parse_scan, run_scan, ScanLine, ScanMatch, SearchReport};
pub use taxi::TaxiNode;
