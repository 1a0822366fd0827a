//! Hailmesh Wire - Datagram Codec
//!
//! Field-by-field encoding of taxi records and the seven commands exchanged
//! between directory, taxi and customer processes.
//!
//! - **Self-describing records**: tagged fields inside a marker + length
//!   envelope, so unknown fields never desynchronise a list
//! - **Network byte order**: every integer and float is big-endian
//! - **Bounded lists**: [`encode_list_bounded`] keeps a LIST reply under
//!   [`MAX_PACKET_LEN`]
//!
//! # Example
//!
//! ```rust
//! use hailmesh_wire::{Message, TaxiRecord};
//!
//! let update = Message::LocationUpdate(TaxiRecord::new("cab-1", 52.37, 4.89));
//! let datagram = update.encode();
//! assert_eq!(Message::decode(&datagram).unwrap(), update);
//! ```

pub mod error;
pub mod message;
pub mod record;

pub use error::{Result, WireError};
pub use message::{encode_list_bounded, Command, Message, MAX_PACKET_LEN};
pub use record::{TaxiRecord, TaxiState, ENVELOPE_LEN, RECORD_MARKER};
