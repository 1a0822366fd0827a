//! Taxi ↔ customer relationship graph.
//!
//! Two maps kept in lockstep: each taxi holds the set of customers it is
//! linked to, each customer holds its taxis in link order. An edge exists on
//! one side iff it exists on the other.
//!
//! Customers also carry an *approaching count*: how many linked taxis are
//! currently committed (PICKUP or ACTIVE) to them. Each taxi remembers which
//! customer its commitment was counted against, so releasing, unlinking or
//! deleting always undoes exactly the increment that was made.

use std::collections::{BTreeSet, HashMap};

use hailmesh_geo::TaxiId;
use hailmesh_wire::{TaxiRecord, TaxiState};
use tracing::{debug, trace};

use crate::error::{Error, Result};

#[derive(Debug)]
struct TaxiEntry {
    record: TaxiRecord,
    customers: BTreeSet<TaxiId>,
    /// Customer whose approaching count includes this taxi.
    engaged: Option<TaxiId>,
}

#[derive(Debug)]
struct CustomerEntry {
    record: TaxiRecord,
    taxis: Vec<TaxiId>,
    approaching: u32,
}

/// Local view of which taxis are linked to which customers.
///
/// An empty customer id refers to the primary customer: the oldest
/// customer still in the graph. A customer process uses this to address
/// itself without knowing its own id.
#[derive(Debug, Default)]
pub struct RelationGraph {
    taxis: HashMap<TaxiId, TaxiEntry>,
    customers: HashMap<TaxiId, CustomerEntry>,
    /// Customers in creation order; the first one is primary.
    customer_order: Vec<TaxiId>,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known taxis.
    pub fn taxi_count(&self) -> usize {
        self.taxis.len()
    }

    /// Number of known customers.
    pub fn customer_count(&self) -> usize {
        self.customers.len()
    }

    pub fn primary_customer(&self) -> Option<&TaxiId> {
        self.customer_order.first()
    }

    /// Link a customer to every candidate taxi.
    ///
    /// Unknown taxis and customers are created; known ones get their
    /// position and endpoint refreshed. Dispatch state is never taken from
    /// the candidates: new taxis start IDLE and existing ones keep theirs.
    /// An existing edge's cached state is not refreshed either; state only
    /// changes through [`set_state`](Self::set_state), which keeps the
    /// approaching counts exact.
    /// Returns the number of new edges.
    pub fn link(&mut self, customer: &TaxiRecord, candidates: &[TaxiRecord]) -> usize {
        let customer_id = match self.resolve(&customer.id) {
            Some(id) => {
                let id = id.clone();
                if let Some(entry) = self.customers.get_mut(&id) {
                    refresh(&mut entry.record, customer);
                }
                id
            }
            None => {
                let id = customer.id.clone();
                self.customers.insert(
                    id.clone(),
                    CustomerEntry {
                        record: TaxiRecord {
                            state: TaxiState::Idle,
                            ..customer.clone()
                        },
                        taxis: Vec::new(),
                        approaching: 0,
                    },
                );
                self.customer_order.push(id.clone());
                debug!(customer = %id, "new customer");
                id
            }
        };

        let mut added = 0;
        for candidate in candidates {
            let taxi = self
                .taxis
                .entry(candidate.id.clone())
                .and_modify(|entry| refresh(&mut entry.record, candidate))
                .or_insert_with(|| TaxiEntry {
                    record: TaxiRecord {
                        state: TaxiState::Idle,
                        ..candidate.clone()
                    },
                    customers: BTreeSet::new(),
                    engaged: None,
                });

            if taxi.customers.insert(customer_id.clone()) {
                if let Some(entry) = self.customers.get_mut(&customer_id) {
                    entry.taxis.push(candidate.id.clone());
                }
                added += 1;
                trace!(taxi = %candidate.id, customer = %customer_id, "linked");
            }
        }

        debug_assert!(self.is_consistent());
        added
    }

    /// Remove one edge, or the taxi and all of its edges.
    ///
    /// Returns the taxi's record as it was before the call.
    pub fn unlink_taxi(&mut self, taxi: &TaxiId, customer: Option<&TaxiId>) -> Result<TaxiRecord> {
        let Some(customer) = customer else {
            let entry = self
                .taxis
                .remove(taxi)
                .ok_or_else(|| Error::UnknownTaxi(taxi.clone()))?;
            for customer in &entry.customers {
                if let Some(c) = self.customers.get_mut(customer) {
                    c.taxis.retain(|t| t != taxi);
                }
            }
            if let Some(engaged) = &entry.engaged {
                self.release_count(engaged);
            }
            debug!(taxi = %taxi, edges = entry.customers.len(), "taxi removed");
            debug_assert!(self.is_consistent());
            return Ok(entry.record);
        };

        let customer = self.require_customer(customer)?;
        let entry = self
            .taxis
            .get_mut(taxi)
            .ok_or_else(|| Error::UnknownTaxi(taxi.clone()))?;
        if !entry.customers.remove(&customer) {
            return Err(Error::NotLinked {
                taxi: taxi.clone(),
                customer,
            });
        }
        let record = entry.record.clone();
        let was_engaged = entry.engaged.as_ref() == Some(&customer);
        if was_engaged {
            entry.engaged = None;
        }

        if let Some(c) = self.customers.get_mut(&customer) {
            c.taxis.retain(|t| t != taxi);
        }
        if was_engaged {
            self.release_count(&customer);
        }

        trace!(taxi = %taxi, customer = %customer, "unlinked");
        debug_assert!(self.is_consistent());
        Ok(record)
    }

    /// Change a taxi's dispatch state.
    ///
    /// IDLE → PICKUP/ACTIVE counts the taxi against `customer`;
    /// PICKUP/ACTIVE → IDLE undoes whichever count the taxi holds (never
    /// below zero). Moving
    /// between PICKUP and ACTIVE, or to the same state, changes no count.
    /// When a customer is named the taxi must be linked to it.
    pub fn set_state(
        &mut self,
        taxi: &TaxiId,
        customer: Option<&TaxiId>,
        state: TaxiState,
    ) -> Result<()> {
        let customer = customer.map(|c| self.require_customer(c)).transpose()?;
        let entry = self
            .taxis
            .get_mut(taxi)
            .ok_or_else(|| Error::UnknownTaxi(taxi.clone()))?;
        if let Some(customer) = &customer {
            if !entry.customers.contains(customer) {
                return Err(Error::NotLinked {
                    taxi: taxi.clone(),
                    customer: customer.clone(),
                });
            }
        }

        let old = entry.record.state;
        entry.record.state = state;

        if !old.is_committed() && state.is_committed() {
            entry.engaged = customer.clone();
            if let Some(c) = customer.as_ref().and_then(|c| self.customers.get_mut(c)) {
                c.approaching += 1;
            }
        } else if old.is_committed() && !state.is_committed() {
            if let Some(counted) = entry.engaged.take() {
                self.release_count(&counted);
            }
        }

        if old != state {
            debug!(taxi = %taxi, from = %old, to = %state, "state changed");
        }
        Ok(())
    }

    /// Check whether a taxi and a customer are linked.
    pub fn find_edge(&self, taxi: &TaxiId, customer: &TaxiId) -> bool {
        let Some(customer) = self.resolve(customer) else {
            return false;
        };
        self.taxis
            .get(taxi)
            .is_some_and(|entry| entry.customers.contains(customer))
    }

    pub fn taxi(&self, taxi: &TaxiId) -> Option<&TaxiRecord> {
        self.taxis.get(taxi).map(|entry| &entry.record)
    }

    pub fn customer(&self, customer: &TaxiId) -> Option<&TaxiRecord> {
        let customer = self.resolve(customer)?;
        self.customers.get(customer).map(|entry| &entry.record)
    }

    /// Taxis linked to a customer, in link order.
    pub fn taxis_for(&self, customer: &TaxiId) -> Vec<TaxiRecord> {
        self.linked_taxis(customer, |_| true)
    }

    /// Taxis linked to a customer, leaving out one taxi.
    pub fn taxis_for_excluding(&self, customer: &TaxiId, excluded: &TaxiId) -> Vec<TaxiRecord> {
        self.linked_taxis(customer, |id| id != excluded)
    }

    /// Number of taxis committed to a customer.
    pub fn approaching_count(&self, customer: &TaxiId) -> Option<u32> {
        let customer = self.resolve(customer)?;
        self.customers.get(customer).map(|entry| entry.approaching)
    }

    /// The customer a taxi's commitment is counted against.
    pub fn committed_customer(&self, taxi: &TaxiId) -> Option<&TaxiId> {
        self.taxis.get(taxi)?.engaged.as_ref()
    }

    /// Number of customers linked to a taxi.
    pub fn num_customers(&self, taxi: &TaxiId) -> usize {
        self.taxis.get(taxi).map_or(0, |entry| entry.customers.len())
    }

    /// Number of taxis linked to a customer.
    pub fn num_taxis(&self, customer: &TaxiId) -> usize {
        self.resolve(customer)
            .and_then(|c| self.customers.get(c))
            .map_or(0, |entry| entry.taxis.len())
    }

    /// Remove a customer and every edge touching it.
    pub fn delete_customer(&mut self, customer: &TaxiId) -> bool {
        let Some(customer) = self.resolve(customer).cloned() else {
            return false;
        };
        let Some(entry) = self.customers.remove(&customer) else {
            return false;
        };

        for taxi in &entry.taxis {
            if let Some(t) = self.taxis.get_mut(taxi) {
                t.customers.remove(&customer);
                if t.engaged.as_ref() == Some(&customer) {
                    t.engaged = None;
                }
            }
        }
        self.customer_order.retain(|c| c != &customer);

        debug!(customer = %customer, edges = entry.taxis.len(), "customer removed");
        debug_assert!(self.is_consistent());
        true
    }

    /// Every edge is mirrored and every approaching count matches the
    /// engaged taxis pointing at it.
    pub fn is_consistent(&self) -> bool {
        let taxi_side = self.taxis.iter().all(|(taxi, entry)| {
            entry.customers.iter().all(|c| {
                self.customers
                    .get(c)
                    .is_some_and(|ce| ce.taxis.iter().filter(|t| *t == taxi).count() == 1)
            }) && entry
                .engaged
                .as_ref()
                .map_or(true, |c| entry.customers.contains(c) && entry.record.state.is_committed())
        });

        let customer_side = self.customers.iter().all(|(customer, entry)| {
            let engaged = entry
                .taxis
                .iter()
                .filter(|t| {
                    self.taxis
                        .get(*t)
                        .is_some_and(|te| te.customers.contains(customer) && te.engaged.as_ref() == Some(customer))
                })
                .count();
            entry.taxis.iter().all(|t| self.taxis.get(t).is_some_and(|te| te.customers.contains(customer)))
                && engaged as u32 == entry.approaching
        });

        taxi_side && customer_side && self.customer_order.len() == self.customers.len()
    }

    fn resolve<'a>(&'a self, customer: &'a TaxiId) -> Option<&'a TaxiId> {
        if customer.is_empty() && !self.customers.contains_key(customer) {
            return self.customer_order.first();
        }
        self.customers.contains_key(customer).then_some(customer)
    }

    fn require_customer(&self, customer: &TaxiId) -> Result<TaxiId> {
        self.resolve(customer)
            .cloned()
            .ok_or_else(|| Error::UnknownCustomer(customer.clone()))
    }

    fn release_count(&mut self, customer: &TaxiId) {
        if let Some(entry) = self.customers.get_mut(customer) {
            entry.approaching = entry.approaching.saturating_sub(1);
        }
    }

    fn linked_taxis(&self, customer: &TaxiId, keep: impl Fn(&TaxiId) -> bool) -> Vec<TaxiRecord> {
        let Some(entry) = self.resolve(customer).and_then(|c| self.customers.get(c)) else {
            return Vec::new();
        };
        entry
            .taxis
            .iter()
            .filter(|id| keep(id))
            .filter_map(|id| self.taxis.get(id).map(|t| t.record.clone()))
            .collect()
    }
}

/// Take position and endpoint from `seen`, keep id and state.
fn refresh(record: &mut TaxiRecord, seen: &TaxiRecord) {
    record.location = seen.location;
    if seen.endpoint.is_some() {
        record.endpoint = seen.endpoint;
    }
}
