//! Taxi service.
//!
//! A taxi registers its position with the directory from the same endpoint
//! it answers pings on, then lets the dispatcher drive its [`Negotiator`].

use std::net::SocketAddr;

use hailmesh_dispatch::Negotiator;
use hailmesh_geo::TaxiId;
use hailmesh_transfer::{Dispatcher, Endpoint, SocketId};
use hailmesh_wire::TaxiRecord;
use tracing::info;

use crate::client::DirectoryClient;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::peer::{into_reply, PeerHandler};

/// A running taxi.
pub struct TaxiNode {
    record: TaxiRecord,
    local_addr: SocketAddr,
    socket: SocketId,
    client: DirectoryClient,
    dispatcher: Dispatcher<PeerHandler>,
}

impl TaxiNode {
    /// Bind, register with the directory and start answering pings.
    pub async fn start(config: &NodeConfig, id: TaxiId, latitude: f64, longitude: f64) -> Result<Self> {
        let endpoint = Endpoint::bind(config.local_transport()).await?;
        let local_addr = endpoint.local_addr()?;

        let mut negotiator = Negotiator::new(config.negotiation());
        negotiator.set_self_id(id.clone());
        negotiator.set_local_addr(local_addr);

        let mut dispatcher = Dispatcher::new(PeerHandler::new(negotiator));
        let socket = dispatcher.register(endpoint.clone()).await?;

        let client = DirectoryClient::new(endpoint, config.directory_addr, config.fetch_timeout);
        let record = TaxiRecord::new(id, latitude, longitude);
        client.update_location(&record).await?;

        info!(taxi = %record.id, at = %record.location, local = %local_addr, "taxi started");
        Ok(Self {
            record,
            local_addr,
            socket,
            client,
            dispatcher,
        })
    }

    pub fn id(&self) -> &TaxiId {
        &self.record.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Report a new position to the directory.
    pub async fn move_to(&mut self, latitude: f64, longitude: f64) -> Result<()> {
        self.record.location.latitude = latitude;
        self.record.location.longitude = longitude;
        self.client.update_location(&self.record).await
    }

    /// Drop off `customer` and go back to IDLE. The customer and the other
    /// taxis linked to it get an IDLE intimation.
    pub async fn release(&self, customer: &TaxiId) -> Result<()> {
        let customer = customer.clone();
        let released = self
            .dispatcher
            .call(self.socket, move |handler: &mut PeerHandler| {
                match handler.negotiator_mut().release(&customer) {
                    Ok(outgoing) => (Ok(()), outgoing.into_iter().map(into_reply).collect()),
                    Err(e) => (Err(e), Vec::new()),
                }
            })
            .await?;
        released?;
        info!(taxi = %self.record.id, "taxi idle");
        Ok(())
    }

    /// Leave the directory and stop. Returns the negotiator with everything
    /// this taxi learned.
    pub async fn shutdown(self) -> Result<Negotiator> {
        self.client.delete(&self.record).await?;
        let handler = self.dispatcher.shutdown().await?;
        info!(taxi = %self.record.id, "taxi stopped");
        Ok(handler.into_inner())
    }
}
