//! Negotiation over the dispatcher.

use hailmesh_dispatch::{Negotiator, Outgoing};
use hailmesh_transfer::{Datagram, DatagramHandler, Reply};
use tracing::warn;

/// Feeds datagrams to a [`Negotiator`] and sends what it produces.
#[derive(Debug)]
pub struct PeerHandler {
    negotiator: Negotiator,
}

impl PeerHandler {
    pub fn new(negotiator: Negotiator) -> Self {
        Self { negotiator }
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn negotiator_mut(&mut self) -> &mut Negotiator {
        &mut self.negotiator
    }

    pub fn into_inner(self) -> Negotiator {
        self.negotiator
    }
}

impl DatagramHandler for PeerHandler {
    fn handle(&mut self, datagram: Datagram) -> Vec<Reply> {
        match self
            .negotiator
            .handle_datagram(datagram.from, &datagram.payload)
        {
            Ok(outgoing) => outgoing.into_iter().map(into_reply).collect(),
            Err(e) => {
                warn!(
                    from = %datagram.from,
                    len = datagram.payload.len(),
                    error = %e,
                    "discarding malformed datagram"
                );
                Vec::new()
            }
        }
    }
}

pub(crate) fn into_reply(outgoing: Outgoing) -> Reply {
    Reply::new(outgoing.to, outgoing.message.encode())
}
