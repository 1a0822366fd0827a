//! Taxi records and the per-record envelope.
//!
//! A record on the wire:
//!
//! ```text
//! marker: u32 | body_len: u32 | field*
//!
//! field = ID       (1): len: u32, bytes padded to 4
//!       | LOCATION (2): latitude: f64, longitude: f64
//!       | STATE    (3): state: u32
//!       | ENDPOINT (4): port: u16, family: u16 (4|6), 4 or 16 address bytes
//! ```
//!
//! Every field starts with its u32 tag. All integers and floats are
//! big-endian. Empty ids, IDLE state and missing endpoints are not written.
//! A decoder that meets an unknown tag skips the rest of the body and
//! resumes at the next record.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use hailmesh_geo::{GeoPoint, TaxiId};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, WireError};

/// Start-of-record marker.
pub const RECORD_MARKER: u32 = 0x5441_5849;

/// Bytes taken by the marker and the length word.
pub const ENVELOPE_LEN: usize = 8;

const TAG_ID: u32 = 0x1;
const TAG_LOCATION: u32 = 0x2;
const TAG_STATE: u32 = 0x3;
const TAG_ENDPOINT: u32 = 0x4;

const FAMILY_V4: u16 = 4;
const FAMILY_V6: u16 = 6;

/// Dispatch state of a taxi.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum TaxiState {
    /// Free to take a pickup.
    #[default]
    Idle = 1,
    /// Driving to a customer.
    Pickup = 2,
    /// Committed to a customer.
    Active = 4,
}

impl TaxiState {
    /// PICKUP and ACTIVE both count as committed.
    pub fn is_committed(self) -> bool {
        matches!(self, TaxiState::Pickup | TaxiState::Active)
    }
}

impl TryFrom<u32> for TaxiState {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(TaxiState::Idle),
            2 => Ok(TaxiState::Pickup),
            4 => Ok(TaxiState::Active),
            other => Err(WireError::InvalidState(other)),
        }
    }
}

impl fmt::Display for TaxiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaxiState::Idle => write!(f, "IDLE"),
            TaxiState::Pickup => write!(f, "PICKUP"),
            TaxiState::Active => write!(f, "ACTIVE"),
        }
    }
}

/// A taxi or customer as carried in datagrams.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaxiRecord {
    pub id: TaxiId,
    pub location: GeoPoint,
    pub state: TaxiState,
    pub endpoint: Option<SocketAddr>,
}

impl TaxiRecord {
    /// An idle record without an endpoint.
    pub fn new(id: impl Into<TaxiId>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            location: GeoPoint::new(latitude, longitude),
            state: TaxiState::Idle,
            endpoint: None,
        }
    }

    /// A location-only record with an empty id.
    pub fn at(location: GeoPoint) -> Self {
        Self {
            location,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: TaxiState) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    fn body_len(&self) -> usize {
        let mut len = 4 + 16;
        if !self.id.is_empty() {
            len += 8 + padded(self.id.len());
        }
        if self.state != TaxiState::Idle {
            len += 8;
        }
        match self.endpoint {
            Some(SocketAddr::V4(_)) => len += 8 + 4,
            Some(SocketAddr::V6(_)) => len += 8 + 16,
            None => {}
        }
        len
    }

    /// Size of this record on the wire, envelope included.
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_LEN + self.body_len()
    }

    /// Append the enveloped record to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let body_len = self.body_len();
        buf.reserve(ENVELOPE_LEN + body_len);
        buf.put_u32(RECORD_MARKER);
        buf.put_u32(body_len as u32);

        if !self.id.is_empty() {
            let id = self.id.as_bytes();
            buf.put_u32(TAG_ID);
            buf.put_u32(id.len() as u32);
            buf.put_slice(id);
            buf.put_bytes(0, padded(id.len()) - id.len());
        }

        buf.put_u32(TAG_LOCATION);
        buf.put_f64(self.location.latitude);
        buf.put_f64(self.location.longitude);

        if self.state != TaxiState::Idle {
            buf.put_u32(TAG_STATE);
            buf.put_u32(self.state as u32);
        }

        if let Some(endpoint) = self.endpoint {
            buf.put_u32(TAG_ENDPOINT);
            buf.put_u16(endpoint.port());
            match endpoint.ip() {
                IpAddr::V4(ip) => {
                    buf.put_u16(FAMILY_V4);
                    buf.put_slice(&ip.octets());
                }
                IpAddr::V6(ip) => {
                    buf.put_u16(FAMILY_V6);
                    buf.put_slice(&ip.octets());
                }
            }
        }
    }

    /// Decode one enveloped record, advancing `buf` past it.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        need(&*buf, ENVELOPE_LEN)?;
        let marker = buf.get_u32();
        if marker != RECORD_MARKER {
            return Err(WireError::BadMarker(marker));
        }
        let body_len = buf.get_u32() as usize;
        need(&*buf, body_len)?;
        let mut body = buf.copy_to_bytes(body_len);

        let mut record = TaxiRecord::default();
        while body.has_remaining() {
            need(&body, 4)?;
            match body.get_u32() {
                TAG_ID => {
                    need(&body, 4)?;
                    let len = body.get_u32() as usize;
                    let aligned = padded(len);
                    need(&body, aligned)?;
                    record.id = TaxiId::new(&body[..len]);
                    body.advance(aligned);
                }
                TAG_LOCATION => {
                    need(&body, 16)?;
                    let latitude = body.get_f64();
                    let longitude = body.get_f64();
                    record.location = GeoPoint::new(latitude, longitude);
                }
                TAG_STATE => {
                    need(&body, 4)?;
                    record.state = TaxiState::try_from(body.get_u32())?;
                }
                TAG_ENDPOINT => {
                    need(&body, 4)?;
                    let port = body.get_u16();
                    let ip = match body.get_u16() {
                        FAMILY_V4 => {
                            need(&body, 4)?;
                            IpAddr::V4(Ipv4Addr::from(body.get_u32()))
                        }
                        FAMILY_V6 => {
                            need(&body, 16)?;
                            IpAddr::V6(Ipv6Addr::from(body.get_u128()))
                        }
                        other => return Err(WireError::InvalidEndpoint(other)),
                    };
                    record.endpoint = Some(SocketAddr::new(ip, port));
                }
                unknown => {
                    trace!(tag = unknown, skipped = body.remaining(), "unknown record field");
                    break;
                }
            }
        }

        Ok(record)
    }
}

impl fmt::Display for TaxiRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {} ({})", self.id, self.location, self.state)?;
        if let Some(endpoint) = self.endpoint {
            write!(f, " via {endpoint}")?;
        }
        Ok(())
    }
}

/// Round up to 4-byte alignment.
fn padded(len: usize) -> usize {
    (len + 3) & !3
}

pub(crate) fn need(buf: &impl Buf, needed: usize) -> Result<()> {
    let remaining = buf.remaining();
    if remaining < needed {
        return Err(WireError::Truncated { needed, remaining });
    }
    Ok(())
}
