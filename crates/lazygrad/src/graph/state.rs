//! Internal graph bookkeeping shared by the arena, node handles, and the builder.

use std::fmt;

use crate::backend::spec::Shape;

use super::lowering::OpKind;

/// Index of a node record inside its [`GraphArena`](super::arena::GraphArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Mutable graph storage protected by the arena mutex. Records are append-only.
#[derive(Default)]
pub(crate) struct GraphInner {
    pub(crate) nodes: Vec<NodeRecord>,
}

impl GraphInner {
    pub(crate) fn record(&self, id: NodeId) -> &NodeRecord {
        &self.nodes[id.0]
    }

    pub(crate) fn record_mut(&mut self, id: NodeId) -> &mut NodeRecord {
        &mut self.nodes[id.0]
    }

    pub(crate) fn push(&mut self, record: NodeRecord) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(record);
        id
    }

    /// Label for diagnostics: the user label, or the node id.
    pub(crate) fn describe(&self, id: NodeId) -> String {
        match &self.record(id).label {
            Some(label) => label.clone(),
            None => id.to_string(),
        }
    }
}

pub(crate) struct NodeRecord {
    pub(crate) shape: Shape,
    pub(crate) label: Option<String>,
    pub(crate) data: Option<Vec<f32>>,
    pub(crate) kind: NodeKind,
}

/// A node is a leaf exactly when it carries no operator.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Leaf,
    Op { op: OpKind, parents: Vec<NodeId> },
}
