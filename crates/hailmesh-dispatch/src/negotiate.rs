//! Ping / reply / intimation negotiation.
//!
//! A customer pings every candidate taxi the directory returned. Each taxi
//! decides on its own whether to claim the pickup:
//!
//! 1. merge the candidate list into its relationship graph
//! 2. drop if it is already committed to a different customer
//! 3. drop if it is not in the candidate list
//! 4. drop if enough taxis are already approaching the customer
//! 5. otherwise go ACTIVE, reply to the customer and intimate the other
//!    candidates
//!
//! There is no lock across taxis. Up to `max_approaching` taxis can claim
//! the same customer when their pings race.
//!
//! The [`Negotiator`] is sans-IO: it takes decoded messages and returns the
//! datagrams to send. It is not synchronized; callers feed it one message at
//! a time.

use std::fmt;
use std::net::SocketAddr;

use hailmesh_geo::TaxiId;
use hailmesh_wire::{Message, TaxiRecord, TaxiState};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::graph::RelationGraph;

/// Negotiation configuration.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationConfig {
    /// A taxi refuses to claim a customer once this many taxis approach it.
    pub max_approaching: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self { max_approaching: 2 }
    }
}

impl NegotiationConfig {
    #[must_use]
    pub fn with_max_approaching(mut self, max_approaching: u32) -> Self {
        self.max_approaching = max_approaching;
        self
    }
}

/// Which notification reached the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Reply,
    Intimation,
}

/// Application callback for replies and intimations: `(kind, customer, taxi)`.
pub type NoticeHook = Box<dyn Fn(NoticeKind, &TaxiRecord, &TaxiRecord) + Send + Sync>;

/// A datagram to send.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: SocketAddr,
    pub message: Message,
}

/// Why a ping was not claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// This taxi is committed to another customer.
    CommittedElsewhere,
    /// This taxi already claimed this customer.
    AlreadyClaimed,
    /// This taxi is not in the candidate list.
    NotACandidate,
    /// Enough taxis are already approaching the customer.
    CustomerSaturated,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::CommittedElsewhere => write!(f, "committed elsewhere"),
            DropReason::AlreadyClaimed => write!(f, "already claimed"),
            DropReason::NotACandidate => write!(f, "not a candidate"),
            DropReason::CustomerSaturated => write!(f, "customer saturated"),
        }
    }
}

/// Result of handling a ping.
#[derive(Debug, Clone, PartialEq)]
pub enum PingOutcome {
    /// The taxi went ACTIVE. The reply comes first, intimations after.
    Claimed { outgoing: Vec<Outgoing> },
    /// Nothing is sent back.
    Dropped(DropReason),
}

impl PingOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, PingOutcome::Claimed { .. })
    }

    /// Datagrams to send, empty when dropped.
    pub fn into_outgoing(self) -> Vec<Outgoing> {
        match self {
            PingOutcome::Claimed { outgoing } => outgoing,
            PingOutcome::Dropped(_) => Vec::new(),
        }
    }
}

/// Negotiation state machine for one taxi or customer process.
pub struct Negotiator {
    graph: RelationGraph,
    config: NegotiationConfig,
    self_id: Option<TaxiId>,
    local_addr: Option<SocketAddr>,
    hook: Option<NoticeHook>,
}

impl fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("config", &self.config)
            .field("self_id", &self.self_id)
            .field("local_addr", &self.local_addr)
            .field("taxis", &self.graph.taxi_count())
            .field("customers", &self.graph.customer_count())
            .finish()
    }
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new(NegotiationConfig::default())
    }
}

impl Negotiator {
    pub fn new(config: NegotiationConfig) -> Self {
        Self {
            graph: RelationGraph::new(),
            config,
            self_id: None,
            local_addr: None,
            hook: None,
        }
    }

    /// Set the identity this process answers to as a taxi.
    pub fn set_self_id(&mut self, id: TaxiId) {
        self.self_id = Some(id);
    }

    /// Set the local endpoint, used to find ourselves in candidate lists
    /// when no identity is set.
    pub fn set_local_addr(&mut self, addr: SocketAddr) {
        self.local_addr = Some(addr);
    }

    pub fn set_hook(&mut self, hook: NoticeHook) {
        self.hook = Some(hook);
    }

    pub fn self_id(&self) -> Option<&TaxiId> {
        self.self_id.as_ref()
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn graph(&self) -> &RelationGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut RelationGraph {
        &mut self.graph
    }

    /// Decode and handle one datagram.
    pub fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8]) -> Result<Vec<Outgoing>> {
        let message = Message::decode(datagram)?;
        Ok(self.handle(from, message))
    }

    /// Handle one decoded message.
    pub fn handle(&mut self, from: SocketAddr, message: Message) -> Vec<Outgoing> {
        match message {
            Message::Ping {
                customer,
                candidates,
            } => self.handle_ping(from, customer, candidates).into_outgoing(),
            Message::PingReply { customer, taxi } => {
                self.handle_notice(NoticeKind::Reply, customer, taxi);
                Vec::new()
            }
            Message::PingIntimation { customer, taxi } => {
                self.handle_notice(NoticeKind::Intimation, customer, taxi);
                Vec::new()
            }
            other => {
                warn!(from = %from, command = %other.command(), "unexpected command for negotiation");
                Vec::new()
            }
        }
    }

    /// Decide whether this taxi claims the customer.
    pub fn handle_ping(
        &mut self,
        from: SocketAddr,
        mut customer: TaxiRecord,
        candidates: Vec<TaxiRecord>,
    ) -> PingOutcome {
        customer.endpoint = customer.endpoint.or(Some(from));
        self.graph.link(&customer, &candidates);

        let me = self
            .self_id
            .clone()
            .or_else(|| candidates.iter().find(|c| self.matches_local(c)).map(|c| c.id.clone()));

        if let Some(me) = &me {
            let committed = self
                .graph
                .taxi(me)
                .is_some_and(|record| record.state.is_committed());
            if committed && self.graph.committed_customer(me) != Some(&customer.id) {
                return self.drop_ping(&customer, DropReason::CommittedElsewhere);
            }
        }

        let Some(me) = me.filter(|me| candidates.iter().any(|c| &c.id == me)) else {
            return self.drop_ping(&customer, DropReason::NotACandidate);
        };

        if self.graph.committed_customer(&me) == Some(&customer.id) {
            return self.drop_ping(&customer, DropReason::AlreadyClaimed);
        }

        let approaching = self.graph.approaching_count(&customer.id).unwrap_or(0);
        if approaching >= self.config.max_approaching {
            return self.drop_ping(&customer, DropReason::CustomerSaturated);
        }

        if let Err(e) = self
            .graph
            .set_state(&me, Some(&customer.id), TaxiState::Active)
        {
            warn!(taxi = %me, customer = %customer.id, error = %e, "failed to claim");
            return self.drop_ping(&customer, DropReason::NotACandidate);
        }

        let Some(taxi) = self.graph.taxi(&me).cloned() else {
            return self.drop_ping(&customer, DropReason::NotACandidate);
        };

        let mut outgoing = Vec::new();
        if let Some(to) = customer.endpoint {
            outgoing.push(Outgoing {
                to,
                message: Message::PingReply {
                    customer: customer.clone(),
                    taxi: taxi.clone(),
                },
            });
        }
        // Only peers named in this ping; older links to the customer are stale.
        for peer in self.graph.taxis_for_excluding(&customer.id, &me) {
            if !candidates.iter().any(|c| c.id == peer.id) {
                continue;
            }
            let Some(to) = peer.endpoint else {
                continue;
            };
            outgoing.push(Outgoing {
                to,
                message: Message::PingIntimation {
                    customer: customer.clone(),
                    taxi: taxi.clone(),
                },
            });
        }

        debug!(
            taxi = %me,
            customer = %customer.id,
            approaching = approaching + 1,
            intimations = outgoing.len().saturating_sub(1),
            "claimed pickup"
        );
        PingOutcome::Claimed { outgoing }
    }

    /// Record a reply or intimation and notify the hook.
    pub fn handle_notice(&mut self, kind: NoticeKind, customer: TaxiRecord, taxi: TaxiRecord) {
        self.graph.link(&customer, std::slice::from_ref(&taxi));
        if let Err(e) = self.graph.set_state(&taxi.id, Some(&customer.id), taxi.state) {
            warn!(taxi = %taxi.id, customer = %customer.id, error = %e, "failed to record notice");
        }
        trace!(?kind, taxi = %taxi.id, customer = %customer.id, state = %taxi.state, "notice");

        if let Some(hook) = &self.hook {
            hook(kind, &customer, &taxi);
        }
    }

    /// Link the candidates into our own graph and build one PING per
    /// candidate that has an endpoint.
    pub fn prepare_ping(&mut self, customer: &TaxiRecord, candidates: &[TaxiRecord]) -> Vec<Outgoing> {
        self.graph.link(customer, candidates);

        let message = Message::Ping {
            customer: customer.clone(),
            candidates: candidates.to_vec(),
        };
        candidates
            .iter()
            .filter_map(|c| c.endpoint)
            .map(|to| Outgoing {
                to,
                message: message.clone(),
            })
            .collect()
    }

    /// Go back to IDLE after serving a customer.
    ///
    /// Returns an IDLE intimation for the customer and for every other taxi
    /// linked to it, so their approaching counts drop too. Nothing is sent
    /// when this taxi was not committed.
    pub fn release(&mut self, customer: &TaxiId) -> Result<Vec<Outgoing>> {
        let Some(me) = self.self_id.clone() else {
            return Ok(Vec::new());
        };
        let was_committed = self
            .graph
            .taxi(&me)
            .is_some_and(|record| record.state.is_committed());
        self.graph.set_state(&me, Some(customer), TaxiState::Idle)?;
        if !was_committed {
            return Ok(Vec::new());
        }

        let (Some(taxi), Some(customer)) = (
            self.graph.taxi(&me).cloned(),
            self.graph.customer(customer).cloned(),
        ) else {
            return Ok(Vec::new());
        };

        let peers = self
            .graph
            .taxis_for_excluding(&customer.id, &me)
            .into_iter()
            .filter_map(|peer| peer.endpoint);
        let outgoing: Vec<Outgoing> = customer
            .endpoint
            .into_iter()
            .chain(peers)
            .map(|to| Outgoing {
                to,
                message: Message::PingIntimation {
                    customer: customer.clone(),
                    taxi: taxi.clone(),
                },
            })
            .collect();

        debug!(taxi = %me, customer = %customer.id, notices = outgoing.len(), "released");
        Ok(outgoing)
    }

    fn matches_local(&self, candidate: &TaxiRecord) -> bool {
        let (Some(local), Some(endpoint)) = (self.local_addr, candidate.endpoint) else {
            return false;
        };
        local.port() == endpoint.port() && (local.ip().is_unspecified() || local.ip() == endpoint.ip())
    }

    fn drop_ping(&self, customer: &TaxiRecord, reason: DropReason) -> PingOutcome {
        debug!(customer = %customer.id, %reason, "ping dropped");
        PingOutcome::Dropped(reason)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn taxi(id: &str, port: u16) -> TaxiRecord {
        TaxiRecord::new(id, 1.0, 1.0).with_endpoint(addr(port))
    }

    fn node(id: &str) -> Negotiator {
        let mut n = Negotiator::default();
        n.set_self_id(TaxiId::from(id));
        n
    }

    fn customer() -> TaxiRecord {
        TaxiRecord::new("cust", 1.0, 1.0).with_endpoint(addr(9000))
    }

    /// Deliver everything in `outgoing` to the negotiators listening on
    /// those ports, depth first.
    fn deliver(outgoing: Vec<Outgoing>, from: SocketAddr, nodes: &mut [(u16, &mut Negotiator)]) {
        for out in outgoing {
            if let Some((_, n)) = nodes.iter_mut().find(|(port, _)| *port == out.to.port()) {
                let more = n.handle(from, out.message);
                deliver(more, out.to, nodes);
            }
        }
    }

    #[test]
    fn first_taxi_claims_and_intimates() {
        let mut a = node("a");
        let candidates = vec![taxi("a", 1), taxi("b", 2)];

        let outcome = a.handle_ping(addr(9000), customer(), candidates);
        let PingOutcome::Claimed { outgoing } = outcome else {
            panic!("expected a claim");
        };
        assert_eq!(outgoing.len(), 2);
        assert_eq!(outgoing[0].to, addr(9000));
        assert!(matches!(&outgoing[0].message, Message::PingReply { taxi, .. }
            if taxi.id == TaxiId::from("a") && taxi.state == TaxiState::Active));
        assert_eq!(outgoing[1].to, addr(2));
        assert!(matches!(outgoing[1].message, Message::PingIntimation { .. }));

        let cust = TaxiId::from("cust");
        assert_eq!(a.graph().approaching_count(&cust), Some(1));
        assert_eq!(a.graph().taxi(&TaxiId::from("a")).unwrap().state, TaxiState::Active);
    }

    #[test]
    fn scenario_reply_and_intimation_reach_everyone() {
        let mut a = node("a");
        let mut b = node("b");
        let mut c = Negotiator::default();
        let cust = TaxiId::from("cust");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        c.set_hook(Box::new(move |kind: NoticeKind, _customer: &TaxiRecord, taxi: &TaxiRecord| {
            sink.lock().unwrap().push((kind, taxi.id.clone(), taxi.state));
        }));

        let candidates = vec![taxi("a", 1), taxi("b", 2)];
        let pings = c.prepare_ping(&customer(), &candidates);
        assert_eq!(pings.len(), 2);

        // A handles its ping first.
        let replies = a.handle_ping(addr(9000), customer(), candidates.clone()).into_outgoing();
        deliver(replies, addr(1), &mut [(2, &mut b), (9000, &mut c)]);

        assert_eq!(a.graph().approaching_count(&cust), Some(1));
        assert_eq!(b.graph().approaching_count(&cust), Some(1));
        assert_eq!(b.graph().taxi(&TaxiId::from("a")).unwrap().state, TaxiState::Active);
        assert_eq!(c.graph().approaching_count(&cust), Some(1));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(NoticeKind::Reply, TaxiId::from("a"), TaxiState::Active)]
        );

        // A second ping to A re-merges but does not re-claim.
        let again = a.handle_ping(addr(9000), customer(), candidates);
        assert_eq!(again, PingOutcome::Dropped(DropReason::AlreadyClaimed));
        assert_eq!(a.graph().approaching_count(&cust), Some(1));
    }

    #[test]
    fn race_window_admits_exactly_two() {
        let mut a = node("a");
        let mut b = node("b");
        let mut d = node("d");
        let mut c = Negotiator::default();
        let cust = TaxiId::from("cust");
        let candidates = vec![taxi("a", 1), taxi("b", 2), taxi("d", 4)];
        c.prepare_ping(&customer(), &candidates);

        let out = a.handle_ping(addr(9000), customer(), candidates.clone());
        assert!(out.is_claimed());
        deliver(out.into_outgoing(), addr(1), &mut [(2, &mut b), (4, &mut d), (9000, &mut c)]);

        // B already heard about A, but 1 < 2 so it may still claim.
        let out = b.handle_ping(addr(9000), customer(), candidates.clone());
        assert!(out.is_claimed());
        deliver(out.into_outgoing(), addr(2), &mut [(1, &mut a), (4, &mut d), (9000, &mut c)]);

        for n in [&a, &b, &d, &c] {
            assert_eq!(n.graph().approaching_count(&cust), Some(2));
        }

        let out = d.handle_ping(addr(9000), customer(), candidates);
        assert_eq!(out, PingOutcome::Dropped(DropReason::CustomerSaturated));
        assert_eq!(d.graph().approaching_count(&cust), Some(2));
        assert_eq!(d.graph().taxi(&TaxiId::from("d")).unwrap().state, TaxiState::Idle);
    }

    #[test]
    fn committed_taxi_never_double_books() {
        let mut a = node("a");
        let other = TaxiRecord::new("other", 2.0, 2.0).with_endpoint(addr(9001));

        assert!(a.handle_ping(addr(9000), customer(), vec![taxi("a", 1)]).is_claimed());
        let out = a.handle_ping(addr(9001), other, vec![taxi("a", 1)]);
        assert_eq!(out, PingOutcome::Dropped(DropReason::CommittedElsewhere));

        // Released, it can take the next one.
        a.release(&TaxiId::from("cust")).unwrap();
        let other = TaxiRecord::new("other", 2.0, 2.0).with_endpoint(addr(9001));
        assert!(a.handle_ping(addr(9001), other, vec![taxi("a", 1)]).is_claimed());
    }

    #[test]
    fn absent_taxi_drops() {
        let mut a = node("a");
        let out = a.handle_ping(addr(9000), customer(), vec![taxi("b", 2)]);
        assert_eq!(out, PingOutcome::Dropped(DropReason::NotACandidate));
        // The candidates are still merged.
        assert!(a.graph().find_edge(&TaxiId::from("b"), &TaxiId::from("cust")));

        let mut anonymous = Negotiator::default();
        let out = anonymous.handle_ping(addr(9000), customer(), vec![taxi("b", 2)]);
        assert_eq!(out, PingOutcome::Dropped(DropReason::NotACandidate));
    }

    #[test]
    fn local_address_hint_finds_self() {
        let mut n = Negotiator::default();
        n.set_local_addr("0.0.0.0:7001".parse().unwrap());
        let candidates = vec![
            TaxiRecord::new("x", 1.0, 1.0).with_endpoint("10.1.1.1:7000".parse().unwrap()),
            TaxiRecord::new("y", 1.0, 1.0).with_endpoint("10.1.1.2:7001".parse().unwrap()),
        ];
        let out = n.handle_ping(addr(9000), customer(), candidates);
        let PingOutcome::Claimed { outgoing } = out else {
            panic!("hint did not match");
        };
        assert!(matches!(&outgoing[0].message, Message::PingReply { taxi, .. } if taxi.id == TaxiId::from("y")));

        let mut strict = Negotiator::default();
        strict.set_local_addr("10.9.9.9:7001".parse().unwrap());
        let candidates = vec![TaxiRecord::new("y", 1.0, 1.0).with_endpoint("10.1.1.2:7001".parse().unwrap())];
        assert!(!strict.handle_ping(addr(9000), customer(), candidates).is_claimed());
    }

    #[test]
    fn reply_goes_to_datagram_source_without_endpoint() {
        let mut a = node("a");
        let bare = TaxiRecord::new("cust", 1.0, 1.0);
        let out = a.handle_ping(addr(9100), bare, vec![taxi("a", 1)]).into_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, addr(9100));
    }

    #[test]
    fn configurable_threshold() {
        let mut a = Negotiator::new(NegotiationConfig::default().with_max_approaching(1));
        a.set_self_id(TaxiId::from("a"));
        let notice_from_b = taxi("b", 2).with_state(TaxiState::Active);
        a.handle_notice(NoticeKind::Intimation, customer(), notice_from_b);

        let out = a.handle_ping(addr(9000), customer(), vec![taxi("a", 1), taxi("b", 2)]);
        assert_eq!(out, PingOutcome::Dropped(DropReason::CustomerSaturated));
    }

    #[test]
    fn malformed_datagrams_change_nothing() {
        let mut a = node("a");
        assert!(a.handle_datagram(addr(9000), &[1, 2, 3]).is_err());
        assert_eq!(a.graph().taxi_count(), 0);
        assert_eq!(a.graph().customer_count(), 0);
    }

    #[test]
    fn datagram_roundtrip_through_handle() {
        let mut a = node("a");
        let ping = Message::Ping {
            customer: customer(),
            candidates: vec![taxi("a", 1)],
        };
        let out = a.handle_datagram(addr(9000), &ping.encode()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message.command(), hailmesh_wire::Command::PingReply);
    }

    #[test]
    fn intimations_skip_taxis_not_in_this_ping() {
        let mut a = node("a");
        // "old" was linked to the customer by an earlier exchange.
        a.handle_notice(NoticeKind::Intimation, customer(), taxi("old", 5));

        let out = a
            .handle_ping(addr(9000), customer(), vec![taxi("a", 1), taxi("b", 2)])
            .into_outgoing();
        let targets: Vec<SocketAddr> = out.iter().map(|o| o.to).collect();
        assert_eq!(targets, vec![addr(9000), addr(2)]);
    }

    #[test]
    fn release_intimates_idle_to_customer_and_peers() {
        let mut a = node("a");
        let mut b = node("b");
        let mut c = Negotiator::default();
        let cust = TaxiId::from("cust");
        let candidates = vec![taxi("a", 1), taxi("b", 2)];
        c.prepare_ping(&customer(), &candidates);

        let out = a.handle_ping(addr(9000), customer(), candidates).into_outgoing();
        deliver(out, addr(1), &mut [(2, &mut b), (9000, &mut c)]);
        assert_eq!(b.graph().approaching_count(&cust), Some(1));
        assert_eq!(c.graph().approaching_count(&cust), Some(1));

        let out = a.release(&cust).unwrap();
        let targets: Vec<SocketAddr> = out.iter().map(|o| o.to).collect();
        assert_eq!(targets, vec![addr(9000), addr(2)]);
        assert!(out.iter().all(|o| matches!(&o.message,
            Message::PingIntimation { taxi, .. } if taxi.state == TaxiState::Idle)));
        deliver(out, addr(1), &mut [(2, &mut b), (9000, &mut c)]);

        for n in [&a, &b, &c] {
            assert_eq!(n.graph().approaching_count(&cust), Some(0));
            assert_eq!(n.graph().taxi(&TaxiId::from("a")).unwrap().state, TaxiState::Idle);
        }

        // Releasing again is quiet.
        assert!(a.release(&cust).unwrap().is_empty());
    }
}
