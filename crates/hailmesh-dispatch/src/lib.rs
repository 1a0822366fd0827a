//! Hailmesh Dispatch - Best-Effort Taxi Assignment
//!
//! This crate holds the per-process view of which taxis are linked to which
//! customers, and the negotiation a taxi runs when a customer pings it.
//!
//! # Overview
//!
//! - [`RelationGraph`]: many-to-many taxi ↔ customer edges, each taxi's
//!   dispatch state, and per-customer approaching counts
//! - [`Negotiator`]: the PING → PING_REPLY / PING_INTIMATION state machine,
//!   returning the datagrams to send instead of sending them
//!
//! Assignment is not strongly consistent. Racing pings can let up to
//! [`NegotiationConfig::max_approaching`] taxis claim the same customer.
//!
//! # Example
//!
//! ```rust
//! use hailmesh_dispatch::{Negotiator, PingOutcome};
//! use hailmesh_geo::TaxiId;
//! use hailmesh_wire::TaxiRecord;
//!
//! let mut taxi = Negotiator::default();
//! taxi.set_self_id(TaxiId::from("cab-1"));
//!
//! let customer = TaxiRecord::new("alice", 52.37, 4.89);
//! let candidates = vec![TaxiRecord::new("cab-1", 52.38, 4.88)];
//! let outcome = taxi.handle_ping("127.0.0.1:9000".parse().unwrap(), customer, candidates);
//! assert!(outcome.is_claimed());
//! ```

pub mod error;
pub mod graph;
pub mod negotiate;

pub use error::{Error, Result};
pub use graph::RelationGraph;
pub use negotiate::{
    DropReason, NegotiationConfig, Negotiator, NoticeHook, NoticeKind, Outgoing, PingOutcome,
};
