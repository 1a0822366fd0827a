//! Commands and whole-datagram messages.
//!
//! Every datagram starts with a big-endian u32 command word followed by the
//! command's payload:
//!
//! | Command | Payload |
//! |---|---|
//! | LOCATION_UPDATE | one record |
//! | DELETE | one record |
//! | FETCH_BY_LOCATION | one record, empty id |
//! | LIST | count: u32, records |
//! | PING | customer record, then a LIST body of candidates |
//! | PING_REPLY / PING_INTIMATION | customer record, then a LIST body holding the taxi |

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hailmesh_geo::GeoPoint;

use crate::error::{Result, WireError};
use crate::record::{need, TaxiRecord, ENVELOPE_LEN};

/// Largest datagram a LIST reply may occupy.
pub const MAX_PACKET_LEN: usize = 64_000;

const COMMAND_BASE: u32 = 0x1000;

/// Command word at the start of every datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    LocationUpdate = COMMAND_BASE + 1,
    Delete = COMMAND_BASE + 2,
    FetchByLocation = COMMAND_BASE + 3,
    List = COMMAND_BASE + 4,
    Ping = COMMAND_BASE + 5,
    PingReply = COMMAND_BASE + 6,
    PingIntimation = COMMAND_BASE + 7,
}

impl TryFrom<u32> for Command {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            v if v == Command::LocationUpdate as u32 => Command::LocationUpdate,
            v if v == Command::Delete as u32 => Command::Delete,
            v if v == Command::FetchByLocation as u32 => Command::FetchByLocation,
            v if v == Command::List as u32 => Command::List,
            v if v == Command::Ping as u32 => Command::Ping,
            v if v == Command::PingReply as u32 => Command::PingReply,
            v if v == Command::PingIntimation as u32 => Command::PingIntimation,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::LocationUpdate => "LOCATION_UPDATE",
            Command::Delete => "DELETE",
            Command::FetchByLocation => "FETCH_BY_LOCATION",
            Command::List => "LIST",
            Command::Ping => "PING",
            Command::PingReply => "PING_REPLY",
            Command::PingIntimation => "PING_INTIMATION",
        };
        f.write_str(name)
    }
}

/// A decoded datagram.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A taxi reporting where it is.
    LocationUpdate(TaxiRecord),
    /// A taxi leaving the directory.
    Delete(TaxiRecord),
    /// A customer asking for taxis near a point.
    FetchByLocation(GeoPoint),
    /// Directory answer to a fetch.
    List(Vec<TaxiRecord>),
    /// A customer asking candidate taxis to claim it.
    Ping {
        customer: TaxiRecord,
        candidates: Vec<TaxiRecord>,
    },
    /// A taxi telling the customer it claimed the pickup.
    PingReply { customer: TaxiRecord, taxi: TaxiRecord },
    /// A taxi telling the other candidates it claimed the pickup.
    PingIntimation { customer: TaxiRecord, taxi: TaxiRecord },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::LocationUpdate(_) => Command::LocationUpdate,
            Message::Delete(_) => Command::Delete,
            Message::FetchByLocation(_) => Command::FetchByLocation,
            Message::List(_) => Command::List,
            Message::Ping { .. } => Command::Ping,
            Message::PingReply { .. } => Command::PingReply,
            Message::PingIntimation { .. } => Command::PingIntimation,
        }
    }

    /// Encode into a complete datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1024);
        buf.put_u32(self.command() as u32);

        match self {
            Message::LocationUpdate(record) | Message::Delete(record) => record.encode(&mut buf),
            Message::FetchByLocation(location) => TaxiRecord::at(*location).encode(&mut buf),
            Message::List(records) => encode_list(records, &mut buf),
            Message::Ping {
                customer,
                candidates,
            } => {
                customer.encode(&mut buf);
                encode_list(candidates, &mut buf);
            }
            Message::PingReply { customer, taxi } | Message::PingIntimation { customer, taxi } => {
                customer.encode(&mut buf);
                encode_list(std::slice::from_ref(taxi), &mut buf);
            }
        }

        buf.freeze()
    }

    /// Decode a complete datagram. Trailing bytes are ignored.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let mut buf = datagram;
        need(&buf, 4)?;
        let command = Command::try_from(buf.get_u32())?;

        Ok(match command {
            Command::LocationUpdate => Message::LocationUpdate(decode_record(&mut buf)?),
            Command::Delete => Message::Delete(decode_record(&mut buf)?),
            Command::FetchByLocation => Message::FetchByLocation(decode_record(&mut buf)?.location),
            Command::List => Message::List(decode_list(&mut buf)?),
            Command::Ping => {
                let customer = decode_record(&mut buf)?;
                let candidates = decode_list(&mut buf)?;
                Message::Ping {
                    customer,
                    candidates,
                }
            }
            Command::PingReply | Command::PingIntimation => {
                let customer = decode_record(&mut buf)?;
                let taxi = decode_list(&mut buf)?
                    .into_iter()
                    .next()
                    .ok_or(WireError::MissingRecord)?;
                if command == Command::PingReply {
                    Message::PingReply { customer, taxi }
                } else {
                    Message::PingIntimation { customer, taxi }
                }
            }
        })
    }
}

/// Encode a LIST datagram holding as many leading records as fit in
/// `max_len` bytes. Returns the datagram and the number of records kept.
pub fn encode_list_bounded(records: &[TaxiRecord], max_len: usize) -> (Bytes, usize) {
    let mut budget = max_len.saturating_sub(8);
    let kept = records
        .iter()
        .take_while(|record| {
            let len = record.encoded_len();
            if len > budget {
                return false;
            }
            budget -= len;
            true
        })
        .count();

    (Message::List(records[..kept].to_vec()).encode(), kept)
}

fn encode_list(records: &[TaxiRecord], buf: &mut BytesMut) {
    buf.put_u32(records.len() as u32);
    for record in records {
        record.encode(buf);
    }
}

fn decode_record(buf: &mut &[u8]) -> Result<TaxiRecord> {
    if buf.is_empty() {
        return Err(WireError::MissingRecord);
    }
    TaxiRecord::decode(&mut *buf)
}

fn decode_list(buf: &mut &[u8]) -> Result<Vec<TaxiRecord>> {
    need(&*buf, 4)?;
    let count = buf.get_u32();
    let remaining = buf.remaining();
    if (count as usize).saturating_mul(ENVELOPE_LEN) > remaining {
        return Err(WireError::ListTooLong { count, remaining });
    }

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        records.push(TaxiRecord::decode(&mut *buf)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TaxiState;
    use proptest::prelude::*;

    fn cab(id: &str, lat: f64, lon: f64) -> TaxiRecord {
        TaxiRecord::new(id, lat, lon).with_endpoint(format!("127.0.0.1:{}", 30_000 + id.len()).parse().unwrap())
    }

    #[test]
    fn command_words() {
        assert_eq!(Command::LocationUpdate as u32, 0x1001);
        assert_eq!(Command::PingIntimation as u32, 0x1007);
        assert_eq!(Command::try_from(0x1004), Ok(Command::List));
        assert_eq!(Command::try_from(0x2000), Err(WireError::UnknownCommand(0x2000)));
        assert_eq!(Command::FetchByLocation.to_string(), "FETCH_BY_LOCATION");
    }

    #[test]
    fn datagram_starts_with_command() {
        let datagram = Message::Delete(cab("a", 1.0, 2.0)).encode();
        assert_eq!(&datagram[..4], &0x1002u32.to_be_bytes());
    }

    #[test]
    fn ping_carries_customer_and_candidates() {
        let message = Message::Ping {
            customer: cab("customer", 1.0, 1.0),
            candidates: vec![cab("a", 1.1, 1.0), cab("bb", 0.9, 1.0).with_state(TaxiState::Active)],
        };
        assert_eq!(Message::decode(&message.encode()), Ok(message));
    }

    #[test]
    fn reply_and_intimation_carry_one_taxi() {
        let customer = cab("customer", 1.0, 1.0);
        let taxi = cab("a", 1.1, 1.0).with_state(TaxiState::Active);

        let reply = Message::PingReply {
            customer: customer.clone(),
            taxi: taxi.clone(),
        };
        assert_eq!(Message::decode(&reply.encode()), Ok(reply));

        let intimation = Message::PingIntimation { customer, taxi };
        let decoded = Message::decode(&intimation.encode()).unwrap();
        assert_eq!(decoded.command(), Command::PingIntimation);
        assert_eq!(decoded, intimation);
    }

    #[test]
    fn reply_without_taxi_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(Command::PingReply as u32);
        cab("customer", 0.0, 0.0).encode(&mut buf);
        buf.put_u32(0);
        assert_eq!(Message::decode(&buf), Err(WireError::MissingRecord));
    }

    #[test]
    fn fetch_is_location_only() {
        let message = Message::FetchByLocation(GeoPoint::new(12.5, -7.25));
        let datagram = message.encode();
        assert_eq!(datagram.len(), 4 + ENVELOPE_LEN + 4 + 16);
        assert_eq!(Message::decode(&datagram), Ok(message));
    }

    #[test]
    fn empty_payload_is_missing_record() {
        let datagram = (Command::LocationUpdate as u32).to_be_bytes();
        assert_eq!(Message::decode(&datagram), Err(WireError::MissingRecord));
    }

    #[test]
    fn short_datagrams_are_truncated() {
        assert!(matches!(
            Message::decode(&[0x00, 0x00, 0x10]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn absurd_list_count_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(Command::List as u32);
        buf.put_u32(u32::MAX);
        assert!(matches!(
            Message::decode(&buf),
            Err(WireError::ListTooLong { count: u32::MAX, .. })
        ));
    }

    #[test]
    fn bounded_list_fits_the_packet() {
        let records: Vec<TaxiRecord> = (0..100)
            .map(|i| cab(&format!("taxi-{i:03}"), f64::from(i), 0.0))
            .collect();
        let per_record = records[0].encoded_len();

        let max_len = 8 + per_record * 10 + per_record / 2;
        let (datagram, kept) = encode_list_bounded(&records, max_len);
        assert_eq!(kept, 10);
        assert!(datagram.len() <= max_len);

        let Ok(Message::List(decoded)) = Message::decode(&datagram) else {
            panic!("not a list");
        };
        assert_eq!(decoded, records[..10]);

        let (datagram, kept) = encode_list_bounded(&records, MAX_PACKET_LEN);
        assert_eq!(kept, 100);
        assert!(datagram.len() <= MAX_PACKET_LEN);

        let (_, kept) = encode_list_bounded(&records, 4);
        assert_eq!(kept, 0);
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Message::decode(&bytes);
        }

        #[test]
        fn decode_never_panics_after_valid_header(
            command in 0x1001u32..=0x1007,
            tail in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut buf = command.to_be_bytes().to_vec();
            buf.extend_from_slice(&crate::record::RECORD_MARKER.to_be_bytes());
            buf.extend_from_slice(&tail);
            let _ = Message::decode(&buf);
        }
    }
}
