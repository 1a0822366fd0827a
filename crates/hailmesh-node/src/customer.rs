//! Customer service.
//!
//! A hail fetches candidates from the directory, pings each of them from
//! the customer's endpoint and collects the replies and intimations that
//! come back.

use std::net::SocketAddr;
use std::time::Duration;

use hailmesh_dispatch::{Negotiator, NoticeKind};
use hailmesh_transfer::{Dispatcher, Endpoint};
use hailmesh_wire::TaxiRecord;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::DirectoryClient;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::peer::{into_reply, PeerHandler};

/// A reply or intimation received by the customer.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub customer: TaxiRecord,
    pub taxi: TaxiRecord,
}

/// An outstanding pickup request.
pub struct Hail {
    customer: TaxiRecord,
    local_addr: SocketAddr,
    candidates: Vec<TaxiRecord>,
    pinged: usize,
    notices: mpsc::UnboundedReceiver<Notice>,
    dispatcher: Dispatcher<PeerHandler>,
}

impl Hail {
    /// Fetch taxis near `customer` and ping them all.
    pub async fn start(config: &NodeConfig, customer: TaxiRecord) -> Result<Self> {
        let endpoint = Endpoint::bind(config.local_transport()).await?;
        let local_addr = endpoint.local_addr()?;
        let client = DirectoryClient::new(endpoint.clone(), config.directory_addr, config.fetch_timeout);

        let candidates = client
            .fetch_nearest(customer.location.latitude, customer.location.longitude)
            .await?;

        let (tx, notices) = mpsc::unbounded_channel();
        let mut negotiator = Negotiator::new(config.negotiation());
        negotiator.set_hook(Box::new(move |kind: NoticeKind, customer: &TaxiRecord, taxi: &TaxiRecord| {
            let _ = tx.send(Notice {
                kind,
                customer: customer.clone(),
                taxi: taxi.clone(),
            });
        }));

        let pings = negotiator.prepare_ping(&customer, &candidates);
        let pinged = pings.len();

        let mut dispatcher = Dispatcher::new(PeerHandler::new(negotiator));
        dispatcher.register(endpoint.clone()).await?;

        for ping in pings {
            let reply = into_reply(ping);
            if let Err(e) = endpoint.send_to(reply.to, &reply.payload).await {
                warn!(to = %reply.to, error = %e, "ping not sent");
            }
        }

        info!(
            customer = %customer.id,
            candidates = candidates.len(),
            pinged,
            "hail sent"
        );
        Ok(Self {
            customer,
            local_addr,
            candidates,
            pinged,
            notices,
            dispatcher,
        })
    }

    pub fn customer(&self) -> &TaxiRecord {
        &self.customer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Taxis the directory returned.
    pub fn candidates(&self) -> &[TaxiRecord] {
        &self.candidates
    }

    /// Number of pings sent.
    pub fn pinged(&self) -> usize {
        self.pinged
    }

    /// Wait up to `timeout` for the next notice.
    pub async fn next_notice(&mut self, timeout: Duration) -> Option<Notice> {
        tokio::time::timeout(timeout, self.notices.recv())
            .await
            .ok()
            .flatten()
    }

    /// Collect every notice that arrives within `window`.
    pub async fn collect(&mut self, window: Duration) -> Vec<Notice> {
        let deadline = tokio::time::Instant::now() + window;
        let mut notices = Vec::new();
        while let Ok(Some(notice)) = tokio::time::timeout_at(deadline, self.notices.recv()).await {
            debug!(kind = ?notice.kind, taxi = %notice.taxi.id, "notice received");
            notices.push(notice);
        }
        notices
    }

    /// Stop listening. Returns the customer's negotiator.
    pub async fn finish(self) -> Result<Negotiator> {
        let handler = self.dispatcher.shutdown().await?;
        Ok(handler.into_inner())
    }
}
