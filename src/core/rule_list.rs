//! Per-chain rule ordering
//!
//! A [`RuleList`] keeps the compiled rules of one chain in evaluation order.
//! Every inserted rule gets a fresh identifier from a counter that advances by
//! a fixed step, so identifiers are unique and stable for the life of the
//! chain. Position is held by the container, not by the identifier: inserting
//! between two rules never renumbers anything.
//!
//! Mutations take an optional commit callback that runs under the list's write
//! lock once the new identifier and position are known. The node only becomes
//! visible if the callback succeeds, which keeps the list and the transport in
//! the same order when rules are added concurrently.

use crate::core::error::{Error, ObjectKind, Result};
use crate::core::expr::Expr;
use crate::core::set::SetRecord;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Stable identifier of a rule within its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a rule goes relative to an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePosition {
    After(RuleId),
    Before(RuleId),
}

impl RulePosition {
    pub fn anchor(self) -> RuleId {
        match self {
            RulePosition::After(id) | RulePosition::Before(id) => id,
        }
    }
}

/// A compiled rule and the anonymous sets it owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleNode {
    pub id: RuleId,
    pub exprs: Vec<Expr>,
    pub sets: Vec<SetRecord>,
}

impl RuleNode {
    /// Creates a node; the identifier is assigned on insertion.
    pub fn new(exprs: Vec<Expr>) -> Self {
        Self {
            id: RuleId(0),
            exprs,
            sets: Vec::new(),
        }
    }

    pub fn with_sets(mut self, sets: Vec<SetRecord>) -> Self {
        self.sets = sets;
        self
    }
}

#[derive(Debug)]
struct Inner {
    nodes: Vec<RuleNode>,
    next_id: u64,
}

/// Ordered, lock-protected list of rule nodes
#[derive(Debug)]
pub struct RuleList {
    step: u64,
    inner: RwLock<Inner>,
}

impl RuleList {
    /// Creates an empty list whose identifiers advance by `step`.
    pub fn new(step: u64) -> Self {
        let step = step.max(1);
        Self {
            step,
            inner: RwLock::new(Inner {
                nodes: Vec::new(),
                next_id: step,
            }),
        }
    }

    /// Appends a node and returns its identifier.
    pub fn append(&self, mut node: RuleNode) -> RuleId {
        let mut inner = self.inner.write();
        let id = RuleId(inner.next_id);
        node.id = id;
        inner.nodes.push(node);
        inner.next_id += self.step;
        debug!(rule = %id, "Rule appended");
        id
    }

    /// Appends a node once `commit` accepts it.
    ///
    /// # Errors
    ///
    /// Returns the commit callback's error; the list is left unchanged.
    pub fn try_append<F>(&self, node: RuleNode, commit: F) -> Result<RuleId>
    where
        F: FnOnce(&RuleNode, Option<RulePosition>) -> Result<()>,
    {
        self.insert(node, None, commit)
    }

    /// Inserts a node directly after `anchor`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `anchor` is not in the list.
    pub fn insert_after(&self, anchor: RuleId, node: RuleNode) -> Result<RuleId> {
        self.insert(node, Some(RulePosition::After(anchor)), |_, _| Ok(()))
    }

    /// Inserts a node directly before `anchor`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `anchor` is not in the list.
    pub fn insert_before(&self, anchor: RuleId, node: RuleNode) -> Result<RuleId> {
        self.insert(node, Some(RulePosition::Before(anchor)), |_, _| Ok(()))
    }

    /// Inserts a node at `position` once `commit` accepts it.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the anchor is missing or `commit` fails.
    pub fn try_insert<F>(&self, node: RuleNode, position: RulePosition, commit: F) -> Result<RuleId>
    where
        F: FnOnce(&RuleNode, Option<RulePosition>) -> Result<()>,
    {
        self.insert(node, Some(position), commit)
    }

    fn insert<F>(&self, mut node: RuleNode, position: Option<RulePosition>, commit: F) -> Result<RuleId>
    where
        F: FnOnce(&RuleNode, Option<RulePosition>) -> Result<()>,
    {
        let mut inner = self.inner.write();

        let index = match position {
            None => inner.nodes.len(),
            Some(pos) => {
                let anchor = pos.anchor();
                let found = inner
                    .nodes
                    .iter()
                    .position(|n| n.id == anchor)
                    .ok_or_else(|| Error::not_found(ObjectKind::Rule, anchor.to_string()))?;
                match pos {
                    RulePosition::After(_) => found + 1,
                    RulePosition::Before(_) => found,
                }
            }
        };

        node.id = RuleId(inner.next_id);
        commit(&node, position)?;

        let id = node.id;
        inner.nodes.insert(index, node);
        inner.next_id += self.step;
        debug!(rule = %id, index, "Rule inserted");
        Ok(id)
    }

    /// Removes the node with the given identifier.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if no node has that identifier.
    pub fn remove(&self, id: RuleId) -> Result<RuleNode> {
        self.try_remove(id, |_| Ok(()))
    }

    /// Removes a node once `commit` accepts the removal.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the node is missing, or the callback's error.
    pub fn try_remove<F>(&self, id: RuleId, commit: F) -> Result<RuleNode>
    where
        F: FnOnce(&RuleNode) -> Result<()>,
    {
        let mut inner = self.inner.write();
        let index = inner
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| Error::not_found(ObjectKind::Rule, id.to_string()))?;

        commit(&inner.nodes[index])?;
        let node = inner.nodes.remove(index);
        debug!(rule = %id, remaining = inner.nodes.len(), "Rule removed");
        Ok(node)
    }

    /// Puts back a node read from the transport, keeping its identifier.
    ///
    /// The counter moves past the restored identifier so later insertions
    /// never reuse it. Returns `false` if a node with that identifier exists.
    pub fn restore(&self, node: RuleNode) -> bool {
        let mut inner = self.inner.write();
        if inner.nodes.iter().any(|n| n.id == node.id) {
            return false;
        }
        inner.next_id = inner.next_id.max(node.id.0 + self.step);
        inner.nodes.push(node);
        true
    }

    pub fn count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn contains(&self, id: RuleId) -> bool {
        self.inner.read().nodes.iter().any(|n| n.id == id)
    }

    pub fn get(&self, id: RuleId) -> Option<RuleNode> {
        self.inner.read().nodes.iter().find(|n| n.id == id).cloned()
    }

    /// Snapshot of all nodes in evaluation order
    pub fn dump(&self) -> Vec<RuleNode> {
        self.inner.read().nodes.clone()
    }

    /// Identifiers in evaluation order
    pub fn ids(&self) -> Vec<RuleId> {
        self.inner.read().nodes.iter().map(|n| n.id).collect()
    }

    /// Drops every node. Identifiers keep increasing afterwards.
    pub fn clear(&self) {
        self.inner.write().nodes.clear();
    }
}
