//! Balanced latitude tree over cluster roots.
//!
//! An AVL tree whose nodes live in an index arena. Each node carries the
//! latitude of a cluster's reference point and the slot of that cluster in
//! the owning index. Nodes are addressed by [`NodeId`], so erasure works on a
//! handle rather than on a search key.
//!
//! # Ordering
//!
//! Keys are `(latitude, sequence)`. At equal latitude a newer node sorts
//! before an older one, which keeps the order strict (rotations and erasure
//! stay well defined) and agrees with the descent rule "go left if
//! `latitude <= node.latitude`" for every freshly inserted node.

use std::cmp::Ordering;

/// Handle to a node in the position tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(usize);

#[derive(Debug, Clone, Copy)]
struct Key {
    latitude: f64,
    seq: u64,
}

impl Key {
    fn order(&self, other: &Key) -> Ordering {
        if self.latitude < other.latitude {
            Ordering::Less
        } else if self.latitude > other.latitude {
            Ordering::Greater
        } else {
            // Newer first.
            other.seq.cmp(&self.seq)
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    key: Key,
    value: usize,
    left: Option<NodeId>,
    right: Option<NodeId>,
    height: u32,
}

impl Node {
    pub(crate) fn latitude(&self) -> f64 {
        self.key.latitude
    }

    pub(crate) fn value(&self) -> usize {
        self.value
    }

    pub(crate) fn left(&self) -> Option<NodeId> {
        self.left
    }

    pub(crate) fn right(&self) -> Option<NodeId> {
        self.right
    }
}

/// Arena-backed AVL tree keyed by latitude.
#[derive(Debug, Default)]
pub(crate) struct PositionTree {
    nodes: Vec<Node>,
    vacant: Vec<usize>,
    root: Option<NodeId>,
    next_seq: u64,
    len: usize,
}

impl PositionTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Insert a value at the given latitude and return its handle.
    pub(crate) fn insert(&mut self, latitude: f64, value: usize) -> NodeId {
        let node = Node {
            key: Key {
                latitude,
                seq: self.next_seq,
            },
            value,
            left: None,
            right: None,
            height: 1,
        };
        self.next_seq += 1;

        let id = match self.vacant.pop() {
            Some(index) => {
                self.nodes[index] = node;
                NodeId(index)
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        };

        self.root = Some(self.insert_below(self.root, id));
        self.len += 1;
        id
    }

    /// Erase a node by handle, returning its value.
    pub(crate) fn remove(&mut self, id: NodeId) -> usize {
        let key = self.nodes[id.0].key;
        self.root = self.remove_below(self.root, key, id);
        self.len -= 1;

        let node = &mut self.nodes[id.0];
        node.left = None;
        node.right = None;
        self.vacant.push(id.0);
        node.value
    }

    fn insert_below(&mut self, at: Option<NodeId>, new: NodeId) -> NodeId {
        let Some(at) = at else {
            return new;
        };

        if self.nodes[new.0].key.order(&self.nodes[at.0].key) == Ordering::Less {
            let left = self.insert_below(self.nodes[at.0].left, new);
            self.nodes[at.0].left = Some(left);
        } else {
            let right = self.insert_below(self.nodes[at.0].right, new);
            self.nodes[at.0].right = Some(right);
        }
        self.rebalance(at)
    }

    fn remove_below(&mut self, at: Option<NodeId>, key: Key, target: NodeId) -> Option<NodeId> {
        let at = at?;

        if at == target {
            let (left, right) = (self.nodes[at.0].left, self.nodes[at.0].right);
            return match (left, right) {
                (None, None) => None,
                (Some(child), None) | (None, Some(child)) => Some(child),
                (Some(left), Some(right)) => {
                    let (rest, successor) = self.take_min(right);
                    self.nodes[successor.0].left = Some(left);
                    self.nodes[successor.0].right = rest;
                    Some(self.rebalance(successor))
                }
            };
        }

        if key.order(&self.nodes[at.0].key) == Ordering::Less {
            let left = self.remove_below(self.nodes[at.0].left, key, target);
            self.nodes[at.0].left = left;
        } else {
            let right = self.remove_below(self.nodes[at.0].right, key, target);
            self.nodes[at.0].right = right;
        }
        Some(self.rebalance(at))
    }

    /// Detach the minimum of the subtree at `at`.
    /// Returns the rebalanced remainder and the detached node.
    fn take_min(&mut self, at: NodeId) -> (Option<NodeId>, NodeId) {
        match self.nodes[at.0].left {
            None => (self.nodes[at.0].right, at),
            Some(left) => {
                let (rest, min) = self.take_min(left);
                self.nodes[at.0].left = rest;
                (Some(self.rebalance(at)), min)
            }
        }
    }

    fn height(&self, id: Option<NodeId>) -> i64 {
        id.map_or(0, |id| i64::from(self.nodes[id.0].height))
    }

    fn balance(&self, id: NodeId) -> i64 {
        self.height(self.nodes[id.0].left) - self.height(self.nodes[id.0].right)
    }

    fn refresh(&mut self, id: NodeId) {
        let height = 1 + self
            .height(self.nodes[id.0].left)
            .max(self.height(self.nodes[id.0].right));
        self.nodes[id.0].height = height as u32;
    }

    fn rotate_left(&mut self, id: NodeId) -> NodeId {
        let Some(pivot) = self.nodes[id.0].right else {
            return id;
        };
        self.nodes[id.0].right = self.nodes[pivot.0].left;
        self.nodes[pivot.0].left = Some(id);
        self.refresh(id);
        self.refresh(pivot);
        pivot
    }

    fn rotate_right(&mut self, id: NodeId) -> NodeId {
        let Some(pivot) = self.nodes[id.0].left else {
            return id;
        };
        self.nodes[id.0].left = self.nodes[pivot.0].right;
        self.nodes[pivot.0].right = Some(id);
        self.refresh(id);
        self.refresh(pivot);
        pivot
    }

    fn rebalance(&mut self, id: NodeId) -> NodeId {
        self.refresh(id);
        let balance = self.balance(id);

        if balance > 1 {
            if let Some(left) = self.nodes[id.0].left {
                if self.balance(left) < 0 {
                    let left = self.rotate_left(left);
                    self.nodes[id.0].left = Some(left);
                }
            }
            return self.rotate_right(id);
        }

        if balance < -1 {
            if let Some(right) = self.nodes[id.0].right {
                if self.balance(right) > 0 {
                    let right = self.rotate_right(right);
                    self.nodes[id.0].right = Some(right);
                }
            }
            return self.rotate_left(id);
        }

        id
    }

    /// Values in key order.
    #[cfg(test)]
    pub(crate) fn in_order(&self) -> Vec<usize> {
        fn walk(tree: &PositionTree, at: Option<NodeId>, out: &mut Vec<usize>) {
            if let Some(at) = at {
                let node = tree.get(at);
                walk(tree, node.left, out);
                out.push(node.value);
                walk(tree, node.right, out);
            }
        }
        let mut out = Vec::with_capacity(self.len);
        walk(self, self.root, &mut out);
        out
    }

    /// Check ordering, AVL balance and the node count.
    #[cfg(test)]
    pub(crate) fn assert_valid(&self) {
        fn check(tree: &PositionTree, at: Option<NodeId>, count: &mut usize) -> i64 {
            let Some(at) = at else {
                return 0;
            };
            *count += 1;
            let node = tree.get(at);
            if let Some(left) = node.left {
                assert_eq!(tree.get(left).key.order(&node.key), Ordering::Less);
            }
            if let Some(right) = node.right {
                assert_eq!(tree.get(right).key.order(&node.key), Ordering::Greater);
            }
            let lh = check(tree, node.left, count);
            let rh = check(tree, node.right, count);
            assert!((lh - rh).abs() <= 1, "unbalanced node");
            assert_eq!(i64::from(node.height), 1 + lh.max(rh));
            1 + lh.max(rh)
        }

        let mut count = 0;
        check(self, self.root, &mut count);
        assert_eq!(count, self.len);

        let latitudes: Vec<f64> = self
            .in_order_nodes()
            .into_iter()
            .map(|id| self.get(id).latitude())
            .collect();
        assert!(latitudes.windows(2).all(|w| w[0] <= w[1]));
    }

    #[cfg(test)]
    fn in_order_nodes(&self) -> Vec<NodeId> {
        fn walk(tree: &PositionTree, at: Option<NodeId>, out: &mut Vec<NodeId>) {
            if let Some(at) = at {
                walk(tree, tree.get(at).left, out);
                out.push(at);
                walk(tree, tree.get(at).right, out);
            }
        }
        let mut out = Vec::new();
        walk(self, self.root, &mut out);
        out
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> u32 {
        self.root.map_or(0, |root| self.get(root).height)
    }
}
