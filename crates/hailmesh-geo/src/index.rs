//! The geo-cluster index.
//!
//! Taxis are grouped into clusters. A cluster has a reference taxi (its
//! root) and a sorted array of members, all of which lie inside the bias
//! box around the reference point. Only cluster roots live in the position
//! tree; members hang off their root.
//!
//! Moving a member inside its cluster's box is a cheap in-place update.
//! Moving or removing a root reparents the whole cluster, which is the
//! expensive path.
//!
//! [`GeoIndex::query_near`] is approximate: it follows a single descent
//! path and may miss taxis that sit in clusters off that path.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::error::{GeoError, Result};
use crate::point::{GeoPoint, TaxiId};
use crate::tree::{NodeId, PositionTree};

/// Default half-width of the bias box, on each axis.
pub const DEFAULT_BIAS: f64 = 0.25;

type SlotId = usize;

/// What an [`GeoIndex::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// The id was new.
    Inserted,
    /// The id was known and moved.
    Updated,
    /// The id was known and the position did not change.
    Unchanged,
}

/// A taxi and where it is.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxiLocation {
    pub id: TaxiId,
    pub location: GeoPoint,
}

/// Snapshot of one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Identity of the reference taxi.
    pub root: TaxiId,
    /// Reference point of the cluster.
    pub reference: GeoPoint,
    /// Members sorted by (latitude, longitude), root included.
    pub members: Vec<TaxiLocation>,
}

#[derive(Debug)]
struct Slot {
    id: TaxiId,
    point: GeoPoint,
    /// Cluster root; equal to the slot itself for roots.
    parent: SlotId,
    /// Non-empty only on roots.
    members: Vec<SlotId>,
    /// Tree handle, present only on roots.
    node: Option<NodeId>,
}

/// Location index answering "which taxis are near this point".
#[derive(Debug)]
pub struct GeoIndex {
    bias: f64,
    slots: Vec<Slot>,
    vacant: Vec<SlotId>,
    by_id: BTreeMap<TaxiId, SlotId>,
    tree: PositionTree,
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoIndex {
    /// Create an empty index with [`DEFAULT_BIAS`].
    pub fn new() -> Self {
        Self::with_bias(DEFAULT_BIAS)
    }

    /// Create an empty index with a custom bias.
    pub fn with_bias(bias: f64) -> Self {
        Self {
            bias,
            slots: Vec::new(),
            vacant: Vec::new(),
            by_id: BTreeMap::new(),
            tree: PositionTree::new(),
        }
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    /// Number of taxis in the index.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Number of clusters (tree nodes).
    pub fn cluster_count(&self) -> usize {
        self.tree.len()
    }

    pub fn contains(&self, id: &TaxiId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Current location of a taxi.
    pub fn location(&self, id: &TaxiId) -> Option<GeoPoint> {
        self.by_id.get(id).map(|&slot| self.slots[slot].point)
    }

    /// The cluster a taxi currently belongs to.
    pub fn cluster_of(&self, id: &TaxiId) -> Option<Cluster> {
        let slot = *self.by_id.get(id)?;
        let root = &self.slots[self.slots[slot].parent];
        Some(Cluster {
            root: root.id.clone(),
            reference: root.point,
            members: root.members.iter().map(|&m| self.location_of(m)).collect(),
        })
    }

    /// Insert a taxi or move it to a new position.
    pub fn upsert(&mut self, id: &TaxiId, latitude: f64, longitude: f64) -> Result<Upsert> {
        let point = GeoPoint::new(latitude, longitude);
        if !point.is_finite() {
            return Err(GeoError::InvalidLocation {
                latitude,
                longitude,
            });
        }

        let Some(&slot) = self.by_id.get(id) else {
            let slot = self.allocate(id.clone(), point);
            self.by_id.insert(id.clone(), slot);
            self.place(slot);
            trace!(taxi = %id, location = %point, "inserted");
            return Ok(Upsert::Inserted);
        };

        if self.slots[slot].point == point {
            return Ok(Upsert::Unchanged);
        }

        let parent = self.slots[slot].parent;
        if parent == slot {
            let old = self.slots[slot].point;
            if old.within(&point, self.bias) && self.cluster_fits(slot, &point) {
                self.move_root(slot, point);
            } else {
                self.slots[slot].point = point;
                self.reparent(slot, true);
            }
        } else if self.slots[parent].point.within(&point, self.bias) {
            self.slots[slot].point = point;
            self.reposition_member(parent, slot);
        } else {
            self.detach(parent, slot);
            self.slots[slot].point = point;
            self.place(slot);
        }

        trace!(taxi = %id, location = %point, "moved");
        Ok(Upsert::Updated)
    }

    /// Remove a taxi. Returns false if the id is unknown.
    pub fn remove(&mut self, id: &TaxiId) -> bool {
        let Some(slot) = self.by_id.remove(id) else {
            return false;
        };

        let parent = self.slots[slot].parent;
        if parent == slot {
            self.reparent(slot, false);
        } else {
            self.detach(parent, slot);
        }

        let freed = &mut self.slots[slot];
        freed.members.clear();
        freed.node = None;
        self.vacant.push(slot);
        trace!(taxi = %id, "removed");
        true
    }

    /// Taxis near a point.
    ///
    /// Walks one path down the tree. A cluster whose box holds the point
    /// returns all its members and ends the walk. A cluster within twice the
    /// bias contributes the whole array, its lower half or its upper half,
    /// depending on which sorted extremes fall inside the query box.
    pub fn query_near(&self, latitude: f64, longitude: f64) -> Vec<TaxiLocation> {
        let query = GeoPoint::new(latitude, longitude);
        let mut found = Vec::new();
        let mut cursor = self.tree.root();

        while let Some(at) = cursor {
            let node = self.tree.get(at);
            let root = &self.slots[node.value()];
            let members = &root.members;

            if root.point.within(&query, self.bias) {
                found.extend(members.iter().map(|&m| self.location_of(m)));
                break;
            }

            if root.point.within(&query, 2.0 * self.bias) {
                let n = members.len();
                let first = members
                    .first()
                    .is_some_and(|&m| self.slots[m].point.within(&query, self.bias));
                let last = members
                    .last()
                    .is_some_and(|&m| self.slots[m].point.within(&query, self.bias));
                let range = match (first, last) {
                    (true, true) => 0..n,
                    (true, false) => 0..n / 2,
                    (false, true) => n / 2..n,
                    (false, false) => 0..0,
                };
                found.extend(members[range].iter().map(|&m| self.location_of(m)));
            }

            cursor = if query.latitude <= node.latitude() {
                node.left()
            } else {
                node.right()
            };
        }

        found
    }

    fn location_of(&self, slot: SlotId) -> TaxiLocation {
        TaxiLocation {
            id: self.slots[slot].id.clone(),
            location: self.slots[slot].point,
        }
    }

    fn allocate(&mut self, id: TaxiId, point: GeoPoint) -> SlotId {
        match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Slot {
                    id,
                    point,
                    parent: slot,
                    members: Vec::new(),
                    node: None,
                };
                slot
            }
            None => {
                let slot = self.slots.len();
                self.slots.push(Slot {
                    id,
                    point,
                    parent: slot,
                    members: Vec::new(),
                    node: None,
                });
                slot
            }
        }
    }

    /// Join the first cluster on the walk whose box holds the slot, or
    /// start a new cluster where the walk falls off the tree.
    fn place(&mut self, slot: SlotId) {
        let point = self.slots[slot].point;
        let mut cursor = self.tree.root();

        while let Some(at) = cursor {
            let node = self.tree.get(at);
            let root = node.value();
            if self.slots[root].point.within(&point, self.bias) {
                self.join(root, slot);
                return;
            }
            cursor = if point.latitude <= node.latitude() {
                node.left()
            } else {
                node.right()
            };
        }

        let node = self.tree.insert(point.latitude, slot);
        let entry = &mut self.slots[slot];
        entry.parent = slot;
        entry.node = Some(node);
        entry.members = vec![slot];
        debug!(taxi = %entry.id, location = %point, "new cluster");
    }

    fn join(&mut self, root: SlotId, slot: SlotId) {
        let point = self.slots[slot].point;
        let at = self.slots[root]
            .members
            .partition_point(|&m| self.slots[m].point.position_cmp(&point) != Ordering::Greater);
        self.slots[root].members.insert(at, slot);

        let entry = &mut self.slots[slot];
        entry.parent = root;
        entry.node = None;
        entry.members.clear();
    }

    fn detach(&mut self, root: SlotId, slot: SlotId) {
        let members = &mut self.slots[root].members;
        if let Some(at) = members.iter().position(|&m| m == slot) {
            members.remove(at);
        }
    }

    /// Restore sort order after a member moved inside its own box.
    fn reposition_member(&mut self, root: SlotId, slot: SlotId) {
        self.detach(root, slot);
        self.join(root, slot);
    }

    /// Every member of the cluster would still lie in a box around `point`.
    fn cluster_fits(&self, root: SlotId, point: &GeoPoint) -> bool {
        self.slots[root]
            .members
            .iter()
            .all(|&m| point.within(&self.slots[m].point, self.bias))
    }

    /// Shift a root without touching its members: re-key its tree node and
    /// re-sort it inside its own member array.
    fn move_root(&mut self, root: SlotId, point: GeoPoint) {
        self.slots[root].point = point;
        if let Some(node) = self.slots[root].node.take() {
            self.tree.remove(node);
        }
        self.slots[root].node = Some(self.tree.insert(point.latitude, root));

        let mut members = std::mem::take(&mut self.slots[root].members);
        members.retain(|&m| m != root);
        let at = members
            .partition_point(|&m| self.slots[m].point.position_cmp(&point) != Ordering::Greater);
        members.insert(at, root);
        self.slots[root].members = members;
    }

    /// Pull a cluster out of the tree and place its taxis again one by one.
    fn reparent(&mut self, root: SlotId, reinsert_root: bool) {
        let members = std::mem::take(&mut self.slots[root].members);
        if let Some(node) = self.slots[root].node.take() {
            self.tree.remove(node);
        }

        debug!(
            taxi = %self.slots[root].id,
            members = members.len(),
            reinsert_root,
            "reparenting cluster"
        );

        if reinsert_root {
            self.place(root);
        }
        for member in members.into_iter().filter(|&m| m != root) {
            self.place(member);
        }
    }

    /// Check every structural invariant of the index.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        self.tree.assert_valid();

        let mut roots = 0;
        let mut members = 0;
        for (id, &slot) in &self.by_id {
            let entry = &self.slots[slot];
            assert_eq!(&entry.id, id);
            assert!(!self.vacant.contains(&slot));

            let parent = &self.slots[entry.parent];
            assert_eq!(parent.parent, entry.parent, "parent is not a root");
            assert_eq!(parent.members.iter().filter(|&&m| m == slot).count(), 1);
            assert!(parent.point.within(&entry.point, self.bias));

            if entry.parent == slot {
                roots += 1;
                members += entry.members.len();
                let node = entry.node.map(|n| self.tree.get(n));
                assert!(node.is_some_and(|n| n.value() == slot));
                assert!(node.is_some_and(|n| n.latitude() == entry.point.latitude));
                assert!(entry
                    .members
                    .windows(2)
                    .all(|w| self.slots[w[0]].point.position_cmp(&self.slots[w[1]].point)
                        != Ordering::Greater));
            } else {
                assert!(entry.node.is_none());
                assert!(entry.members.is_empty());
            }
        }
        assert_eq!(roots, self.tree.len());
        assert_eq!(members, self.by_id.len());
    }
}
