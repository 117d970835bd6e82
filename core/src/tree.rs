//! The materialized tree state engine.
//!
//! Winner selection is purely per-node: the op with the greatest
//! `(lamport, replica, counter)` among all Insert/Move/Delete ops that ever
//! named a given node wins that node's parent edge. Because the winner is
//! recomputed from the *complete* set of structural ops seen for a node
//! rather than updated incrementally from whichever op happens to arrive
//! next, applying the same op set in any order converges to the same state,
//! and re-applying an already-known op is a no-op — the shape of the fix is
//! the same one `TreeCrdt::ingest`'s undo/redo log uses, specialized to the
//! fact that only one node's own ops ever compete for its edge.

use crate::ids::{winner_order, Lamport, NodeId, OpId};
use crate::op::{Op, OpKind};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One structural candidate for a node's parent edge.
#[derive(Clone, Debug)]
struct StructuralCandidate {
    lamport: Lamport,
    id: OpId,
    target_parent: NodeId,
    order_key: Vec<u8>,
}

#[derive(Clone, Debug)]
struct PayloadCandidate {
    lamport: Lamport,
    id: OpId,
    payload: Option<Vec<u8>>,
}

#[derive(Default)]
struct NodeState {
    structural: Vec<StructuralCandidate>,
    payload: Vec<PayloadCandidate>,
    /// The currently materialized parent; `NodeId::TRASH` until any
    /// Insert/Move supplies one — the initial implicit edge is
    /// `node → trash`.
    parent: NodeId,
    order_key: Vec<u8>,
    current_payload: Option<Vec<u8>>,
}

impl NodeState {
    fn is_live(&self) -> bool {
        !self.parent.is_trash()
    }
}

/// Describes what changed in the materialized tree as a result of applying
/// one op — handed to the op log so it can maintain the affected-parent
/// secondary index without the tree engine knowing about `OpRef`s or
/// persistence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppliedEffect {
    pub node: NodeId,
    pub structural_change: Option<(NodeId, NodeId)>, // (old_parent, new_parent)
    pub payload_changed: bool,
}

pub struct TreeEngine {
    nodes: HashMap<NodeId, NodeState>,
    /// `parent -> sorted children` ordered by `(order_key, OpId)`.
    children: HashMap<NodeId, BTreeSet<(Vec<u8>, OpId, NodeId)>>,
    applied: HashSet<OpId>,
    head_lamport: Lamport,
    replica_max_counter: HashMap<crate::ids::ReplicaId, u64>,
}

impl Default for TreeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeEngine {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            children: HashMap::new(),
            applied: HashSet::new(),
            head_lamport: Lamport::default(),
            replica_max_counter: HashMap::new(),
        }
    }

    pub fn head_lamport(&self) -> Lamport {
        self.head_lamport
    }

    pub fn replica_max_counter(&self, replica: &crate::ids::ReplicaId) -> u64 {
        self.replica_max_counter.get(replica).copied().unwrap_or(0)
    }

    pub fn node_count(&self) -> u64 {
        self.nodes
            .iter()
            .filter(|(id, st)| !id.is_root() && !id.is_trash() && st.is_live())
            .count() as u64
    }

    pub fn is_known(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    /// Live children of `parent`, ordered by `(order_key, OpId)` ascending.
    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        self.children
            .get(&parent)
            .map(|set| set.iter().map(|(_, _, node)| *node).collect())
            .unwrap_or_default()
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).map(|st| st.parent)
    }

    pub fn payload_of(&self, node: NodeId) -> Option<Vec<u8>> {
        self.nodes.get(&node).and_then(|st| st.current_payload.clone())
    }

    /// Applies `op`, returning `Err(DuplicateOp)` if its id is already
    /// known. `Ok` always succeeds otherwise — a structural op may
    /// reference an ancestor the engine has never seen; it is simply
    /// recorded by id and resolved once that ancestor's own ops arrive.
    pub fn append(&mut self, op: &Op) -> Result<AppliedEffect, crate::error::TreeError> {
        if self.applied.contains(&op.meta.id) {
            return Err(crate::error::TreeError::DuplicateOp(op.meta.id));
        }
        self.applied.insert(op.meta.id);
        self.head_lamport.observe(op.meta.lamport);
        let counter = self
            .replica_max_counter
            .entry(op.meta.id.replica)
            .or_insert(0);
        *counter = (*counter).max(op.meta.id.counter);

        let node = op.kind.node();
        self.ensure_node(node);

        let mut effect = AppliedEffect {
            node,
            structural_change: None,
            payload_changed: false,
        };

        match &op.kind {
            OpKind::Insert {
                parent,
                order_key,
                payload,
                ..
            } => {
                self.ensure_node(*parent);
                self.push_structural(node, op.meta.lamport, op.meta.id, *parent, order_key.clone());
                if let Some(old_parent) = self.recompute_structural_winner(node) {
                    effect.structural_change = Some(old_parent);
                }
                if payload.is_some() || self.nodes[&node].payload.is_empty() {
                    self.push_payload(node, op.meta.lamport, op.meta.id, payload.clone());
                    effect.payload_changed = self.recompute_payload_winner(node);
                }
            }
            OpKind::Move {
                new_parent,
                order_key,
                ..
            } => {
                self.ensure_node(*new_parent);
                self.push_structural(
                    node,
                    op.meta.lamport,
                    op.meta.id,
                    *new_parent,
                    order_key.clone(),
                );
                if let Some(old_parent) = self.recompute_structural_winner(node) {
                    effect.structural_change = Some(old_parent);
                }
            }
            OpKind::Delete { .. } => {
                self.push_structural(node, op.meta.lamport, op.meta.id, NodeId::TRASH, Vec::new());
                if let Some(old_parent) = self.recompute_structural_winner(node) {
                    effect.structural_change = Some(old_parent);
                }
            }
            OpKind::Payload { payload, .. } => {
                self.push_payload(node, op.meta.lamport, op.meta.id, payload.clone());
                effect.payload_changed = self.recompute_payload_winner(node);
            }
        }

        Ok(effect)
    }

    fn ensure_node(&mut self, node: NodeId) {
        self.nodes.entry(node).or_insert_with(|| NodeState {
            parent: NodeId::TRASH,
            ..Default::default()
        });
    }

    fn push_structural(
        &mut self,
        node: NodeId,
        lamport: Lamport,
        id: OpId,
        target_parent: NodeId,
        order_key: Vec<u8>,
    ) {
        self.nodes
            .get_mut(&node)
            .expect("ensure_node called first")
            .structural
            .push(StructuralCandidate {
                lamport,
                id,
                target_parent,
                order_key,
            });
    }

    fn push_payload(&mut self, node: NodeId, lamport: Lamport, id: OpId, payload: Option<Vec<u8>>) {
        self.nodes
            .get_mut(&node)
            .expect("ensure_node called first")
            .payload
            .push(PayloadCandidate { lamport, id, payload });
    }

    /// Recomputes the winning parent edge for `node` from its full
    /// candidate set, suppressing any candidate that would introduce a
    /// cycle, falling back to the next-best candidate and ultimately to
    /// trash. Returns `Some((old_parent, new_parent))` if the materialized
    /// edge changed.
    fn recompute_structural_winner(&mut self, node: NodeId) -> Option<(NodeId, NodeId)> {
        if node.is_root() {
            // The root never moves.
            return None;
        }
        let candidates = self.nodes[&node].structural.clone();
        let mut best_sorted: Vec<&StructuralCandidate> = candidates.iter().collect();
        best_sorted.sort_by(|a, b| {
            winner_order(b.lamport, &b.id, a.lamport, &a.id) // descending
        });

        let mut chosen: Option<&StructuralCandidate> = None;
        for candidate in &best_sorted {
            if !self.introduces_cycle(node, candidate.target_parent) {
                chosen = Some(candidate);
                break;
            }
        }

        let (new_parent, new_order_key) = match chosen {
            Some(c) => (c.target_parent, c.order_key.clone()),
            None => (NodeId::TRASH, Vec::new()),
        };

        let old_parent = self.nodes[&node].parent;
        if old_parent == new_parent && self.nodes[&node].order_key == new_order_key {
            return None;
        }

        self.detach(node, old_parent);
        self.attach(node, new_parent, new_order_key);
        Some((old_parent, new_parent))
    }

    fn recompute_payload_winner(&mut self, node: NodeId) -> bool {
        let candidates = &self.nodes[&node].payload;
        let winner = candidates
            .iter()
            .max_by(|a, b| winner_order(a.lamport, &a.id, b.lamport, &b.id))
            .map(|c| c.payload.clone());
        let st = self.nodes.get_mut(&node).expect("node exists");
        let new_payload = winner.unwrap_or(None);
        if st.current_payload != new_payload {
            st.current_payload = new_payload;
            true
        } else {
            false
        }
    }

    fn detach(&mut self, node: NodeId, parent: NodeId) {
        if let Some(st) = self.nodes.get(&node) {
            let key = (st.order_key.clone(), self.winner_id_of(node), node);
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.remove(&key);
            }
        }
    }

    fn attach(&mut self, node: NodeId, parent: NodeId, order_key: Vec<u8>) {
        let id = self
            .nodes
            .get(&node)
            .and_then(|st| {
                st.structural
                    .iter()
                    .filter(|c| c.target_parent == parent && c.order_key == order_key)
                    .max_by(|a, b| winner_order(a.lamport, &a.id, b.lamport, &b.id))
                    .map(|c| c.id)
            })
            .unwrap_or(OpId {
                replica: crate::ids::ReplicaId::new([0; 32]),
                counter: 0,
            });
        let st = self.nodes.get_mut(&node).expect("node exists");
        st.parent = parent;
        st.order_key = order_key.clone();
        if !parent.is_trash() {
            self.children
                .entry(parent)
                .or_default()
                .insert((order_key, id, node));
        }
    }

    fn winner_id_of(&self, node: NodeId) -> OpId {
        self.nodes
            .get(&node)
            .and_then(|st| {
                st.structural
                    .iter()
                    .filter(|c| c.target_parent == st.parent && c.order_key == st.order_key)
                    .max_by(|a, b| winner_order(a.lamport, &a.id, b.lamport, &b.id))
                    .map(|c| c.id)
            })
            .unwrap_or(OpId {
                replica: crate::ids::ReplicaId::new([0; 32]),
                counter: 0,
            })
    }

    /// True if attaching `node` under `candidate_parent` would create a
    /// cycle, walking the currently materialized parent chain upward.
    fn introduces_cycle(&self, node: NodeId, candidate_parent: NodeId) -> bool {
        if candidate_parent.is_trash() || candidate_parent.is_root() {
            return false;
        }
        if candidate_parent == node {
            return true;
        }
        let mut seen = HashSet::new();
        let mut current = candidate_parent;
        loop {
            if current == node {
                return true;
            }
            if current.is_root() || current.is_trash() {
                return false;
            }
            if !seen.insert(current) {
                // A cycle exists elsewhere in already-materialized state;
                // treat as non-blocking for this decision since it doesn't
                // pass through `node`.
                return false;
            }
            current = match self.nodes.get(&current) {
                Some(st) => st.parent,
                None => return false, // unknown ancestor: can't be `node`
            };
        }
    }
}
