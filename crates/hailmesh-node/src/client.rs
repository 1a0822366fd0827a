//! Directory client.
//!
//! Location updates and deletes are fire-and-forget datagrams sent from the
//! caller's own endpoint, so the directory learns the address the taxi
//! answers pings on. Fetches use a fresh ephemeral socket and wait for the
//! LIST reply; a lost reply surfaces as [`Error::Timeout`] and is not retried.

use std::net::SocketAddr;
use std::time::Duration;

use hailmesh_geo::GeoPoint;
use hailmesh_transfer::{Endpoint, TransportConfig, MAX_DATAGRAM};
use hailmesh_wire::{Message, TaxiRecord};
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DirectoryClient {
    endpoint: Endpoint,
    directory: SocketAddr,
    fetch_timeout: Duration,
}

impl DirectoryClient {
    /// Talk to `directory` from `endpoint`.
    pub fn new(endpoint: Endpoint, directory: SocketAddr, fetch_timeout: Duration) -> Self {
        Self {
            endpoint,
            directory,
            fetch_timeout,
        }
    }

    pub fn directory(&self) -> SocketAddr {
        self.directory
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Register or move a taxi.
    pub async fn update_location(&self, record: &TaxiRecord) -> Result<()> {
        self.send(&Message::LocationUpdate(record.clone())).await
    }

    /// Remove a taxi from the directory.
    pub async fn delete(&self, record: &TaxiRecord) -> Result<()> {
        self.send(&Message::Delete(record.clone())).await
    }

    /// Ask the directory for taxis near a point.
    pub async fn fetch_nearest(&self, latitude: f64, longitude: f64) -> Result<Vec<TaxiRecord>> {
        let bind = if self.directory.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = Endpoint::bind(TransportConfig::bind(bind)).await?;

        let request = Message::FetchByLocation(GeoPoint::new(latitude, longitude));
        socket.send_to(self.directory, &request.encode()).await?;

        let timeout = self.fetch_timeout;
        match tokio::time::timeout(timeout, self.await_list(&socket)).await {
            Ok(records) => {
                let records = records?;
                debug!(latitude, longitude, found = records.len(), "fetch answered");
                Ok(records)
            }
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    async fn await_list(&self, socket: &Endpoint) -> Result<Vec<TaxiRecord>> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            match Message::decode(&buf[..len]) {
                Ok(Message::List(records)) => return Ok(records),
                Ok(other) => {
                    warn!(from = %from, command = %other.command(), "unexpected reply to fetch");
                }
                Err(e) => {
                    warn!(from = %from, len, error = %e, "discarding malformed fetch reply");
                }
            }
        }
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.endpoint
            .send_to(self.directory, &message.encode())
            .await?;
        Ok(())
    }
}
