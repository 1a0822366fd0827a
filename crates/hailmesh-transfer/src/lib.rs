//! Hailmesh Transfer - UDP endpoints and serialized dispatch
//!
//! [`Endpoint`] binds a UDP socket through socket2 so buffer sizes can be
//! tuned before binding. [`Dispatcher`] reads any number of endpoints and
//! feeds a single handler, one datagram at a time, which is the only
//! concurrency guarantee the negotiation state machine relies on.

pub mod dispatcher;
pub mod transport;

pub use dispatcher::{Datagram, DatagramHandler, Dispatcher, Reply, SocketId, QUEUE_DEPTH};
pub use transport::{Endpoint, TransportConfig, MAX_DATAGRAM};
