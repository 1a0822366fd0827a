//! Directory service.
//!
//! The directory keeps the authoritative taxi positions in a [`GeoIndex`]
//! and answers FETCH_BY_LOCATION with the taxis near the requested point.
//! It never takes part in negotiation; PING traffic sent here is ignored.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use hailmesh_geo::{GeoIndex, GeoPoint, TaxiId, Upsert, DEFAULT_BIAS};
use hailmesh_transfer::{Datagram, DatagramHandler, Reply};
use hailmesh_wire::{encode_list_bounded, Message, TaxiRecord, MAX_PACKET_LEN};
use tracing::{debug, info, trace, warn};

use crate::error::Result;

/// Directory configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectoryConfig {
    /// Cluster bias box half-width
    pub bias: f64,
    /// LIST replies are cut to fit in this many bytes
    pub max_packet_len: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            bias: DEFAULT_BIAS,
            max_packet_len: MAX_PACKET_LEN,
        }
    }
}

/// Taxi positions and the endpoints they answer pings on.
#[derive(Debug)]
pub struct DirectoryService {
    config: DirectoryConfig,
    index: GeoIndex,
    endpoints: HashMap<TaxiId, SocketAddr>,
}

impl Default for DirectoryService {
    fn default() -> Self {
        Self::new(DirectoryConfig::default())
    }
}

impl DirectoryService {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            index: GeoIndex::with_bias(config.bias),
            endpoints: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    pub fn index(&self) -> &GeoIndex {
        &self.index
    }

    /// Number of registered taxis
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Endpoint a taxi registered from.
    pub fn endpoint(&self, id: &TaxiId) -> Option<SocketAddr> {
        self.endpoints.get(id).copied()
    }

    /// Decode and handle one datagram, returning the reply if any.
    ///
    /// Malformed datagrams are logged and dropped without touching state.
    pub fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8]) -> Option<Bytes> {
        match Message::decode(datagram) {
            Ok(message) => self.handle(from, message),
            Err(e) => {
                warn!(from = %from, len = datagram.len(), error = %e, "discarding malformed datagram");
                None
            }
        }
    }

    pub fn handle(&mut self, from: SocketAddr, message: Message) -> Option<Bytes> {
        match message {
            Message::LocationUpdate(record) => {
                if let Err(e) = self.update(from, &record) {
                    warn!(from = %from, taxi = %record.id, error = %e, "location rejected");
                }
                None
            }
            Message::Delete(record) => {
                self.delete(&record.id);
                None
            }
            Message::FetchByLocation(point) => Some(self.fetch(point)),
            other => {
                warn!(from = %from, command = %other.command(), "unexpected command for directory");
                None
            }
        }
    }

    /// Register or move a taxi. The endpoint is the one the record carries,
    /// or the sender address when it carries none.
    pub fn update(&mut self, from: SocketAddr, record: &TaxiRecord) -> Result<Upsert> {
        if record.id.is_empty() {
            debug!(from = %from, "ignoring location update without id");
            return Ok(Upsert::Unchanged);
        }

        let clusters = self.index.cluster_count();
        let outcome = self
            .index
            .upsert(&record.id, record.location.latitude, record.location.longitude)?;
        self.endpoints
            .insert(record.id.clone(), record.endpoint.unwrap_or(from));

        match outcome {
            Upsert::Inserted => info!(taxi = %record.id, at = %record.location, "taxi registered"),
            Upsert::Updated => trace!(taxi = %record.id, at = %record.location, "taxi moved"),
            Upsert::Unchanged => {}
        }
        if self.index.cluster_count() > clusters {
            debug!(taxi = %record.id, clusters = self.index.cluster_count(), "new cluster");
        }
        Ok(outcome)
    }

    /// Forget a taxi. Returns false if it was never registered.
    pub fn delete(&mut self, id: &TaxiId) -> bool {
        self.endpoints.remove(id);
        let removed = self.index.remove(id);
        if removed {
            info!(taxi = %id, "taxi deleted");
        } else {
            debug!(taxi = %id, "delete for unknown taxi");
        }
        removed
    }

    /// Taxis near a point, with their endpoints.
    pub fn nearest(&self, latitude: f64, longitude: f64) -> Vec<TaxiRecord> {
        self.index
            .query_near(latitude, longitude)
            .into_iter()
            .map(|found| {
                let mut record = TaxiRecord::at(found.location);
                record.endpoint = self.endpoints.get(&found.id).copied();
                record.id = found.id;
                record
            })
            .collect()
    }

    /// Build the LIST reply for a fetch.
    pub fn fetch(&self, point: GeoPoint) -> Bytes {
        let matches = self.nearest(point.latitude, point.longitude);
        let (datagram, kept) = encode_list_bounded(&matches, self.config.max_packet_len);
        if kept < matches.len() {
            debug!(at = %point, found = matches.len(), kept, "fetch reply truncated");
        }
        trace!(at = %point, kept, "fetch answered");
        datagram
    }
}

impl DatagramHandler for DirectoryService {
    fn handle(&mut self, datagram: Datagram) -> Vec<Reply> {
        self.handle_datagram(datagram.from, &datagram.payload)
            .map(|payload| Reply::new(datagram.from, payload))
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn decode_list(reply: Option<Bytes>) -> Vec<TaxiRecord> {
        match Message::decode(&reply.expect("reply")).unwrap() {
            Message::List(records) => records,
            other => panic!("expected LIST, got {:?}", other.command()),
        }
    }

    fn ids(records: &[TaxiRecord]) -> Vec<String> {
        let mut ids: Vec<String> = records.iter().map(|r| r.id.to_string()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn update_then_fetch_returns_endpoints() {
        let mut directory = DirectoryService::default();
        let update = Message::LocationUpdate(TaxiRecord::new("cab-1", 10.0, 10.0));
        assert!(directory.handle_datagram(addr(4001), &update.encode()).is_none());

        let explicit = TaxiRecord::new("cab-2", 10.1, 10.1).with_endpoint(addr(5002));
        directory.handle(addr(4002), Message::LocationUpdate(explicit));

        let reply = directory.handle(addr(9000), Message::FetchByLocation(GeoPoint::new(10.05, 10.0)));
        let records = decode_list(reply);
        assert_eq!(ids(&records), ["cab-1", "cab-2"]);

        let endpoint_of = |id: &str| {
            records
                .iter()
                .find(|r| r.id == TaxiId::from(id))
                .and_then(|r| r.endpoint)
        };
        assert_eq!(endpoint_of("cab-1"), Some(addr(4001)));
        assert_eq!(endpoint_of("cab-2"), Some(addr(5002)));
    }

    #[test]
    fn move_and_delete() {
        let mut directory = DirectoryService::default();
        let cab = TaxiRecord::new("cab-1", 0.0, 0.0);
        assert_eq!(directory.update(addr(1), &cab).unwrap(), Upsert::Inserted);
        assert_eq!(directory.update(addr(1), &cab).unwrap(), Upsert::Unchanged);

        let moved = TaxiRecord::new("cab-1", 40.0, 40.0);
        assert_eq!(directory.update(addr(1), &moved).unwrap(), Upsert::Updated);
        assert!(directory.nearest(0.0, 0.0).is_empty());
        assert_eq!(ids(&directory.nearest(40.0, 40.0)), ["cab-1"]);

        directory.handle(addr(1), Message::Delete(TaxiRecord::new("cab-1", 0.0, 0.0)));
        assert!(directory.is_empty());
        assert_eq!(directory.endpoint(&TaxiId::from("cab-1")), None);
        assert!(!directory.delete(&TaxiId::from("cab-1")));
    }

    #[test]
    fn fetch_reply_is_bounded() {
        let config = DirectoryConfig {
            max_packet_len: 200,
            ..Default::default()
        };
        let mut directory = DirectoryService::new(config);
        for i in 0..50 {
            let cab = TaxiRecord::new(format!("cab-{i:02}"), 5.0 + i as f64 * 0.001, 5.0);
            directory.update(addr(2000 + i), &cab).unwrap();
        }
        assert_eq!(directory.nearest(5.0, 5.0).len(), 50);

        let reply = directory.fetch(GeoPoint::new(5.0, 5.0));
        assert!(reply.len() <= 200);
        let records = decode_list(Some(reply));
        assert!(!records.is_empty());
        assert!(records.len() < 50);
    }

    #[test]
    fn bad_input_leaves_state_untouched() {
        let mut directory = DirectoryService::default();
        assert!(directory.handle_datagram(addr(1), &[0x00, 0x00, 0x10]).is_none());
        assert!(directory.handle_datagram(addr(1), &[0xde, 0xad, 0xbe, 0xef]).is_none());

        directory.handle(addr(1), Message::LocationUpdate(TaxiRecord::new("", 1.0, 1.0)));
        let nan = TaxiRecord::new("cab-nan", f64::NAN, 1.0);
        assert!(directory.update(addr(1), &nan).is_err());
        directory.handle(addr(1), Message::LocationUpdate(nan));

        let ping = Message::Ping {
            customer: TaxiRecord::new("alice", 1.0, 1.0),
            candidates: vec![TaxiRecord::new("cab-1", 1.0, 1.0)],
        };
        assert!(directory.handle(addr(1), ping).is_none());
        assert!(directory.is_empty());
    }

    #[test]
    fn handler_replies_to_sender() {
        let mut directory = DirectoryService::default();
        directory.update(addr(1), &TaxiRecord::new("cab-1", 3.0, 3.0)).unwrap();

        let datagram = Datagram {
            socket: 0,
            from: addr(7777),
            payload: Message::FetchByLocation(GeoPoint::new(3.0, 3.0)).encode(),
        };
        let replies = DatagramHandler::handle(&mut directory, datagram);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].to, addr(7777));
        assert_eq!(ids(&decode_list(Some(replies[0].payload.clone()))), ["cab-1"]);
    }
}
