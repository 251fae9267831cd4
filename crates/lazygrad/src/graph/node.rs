use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::Shape;
use crate::error::GraphError;

use super::arena::GraphArena;
use super::lowering::OpKind;
use super::state::{NodeId, NodeKind};

/// Handle to a node in a [`GraphArena`].
///
/// Identity is the pair (arena, id): two handles are equal exactly when they refer to the same
/// record, regardless of structure or contents. Cloning a handle is cheap.
#[derive(Clone)]
pub struct Node {
    arena: Arc<GraphArena>,
    id: NodeId,
}

impl Node {
    pub(crate) fn from_parts(arena: Arc<GraphArena>, id: NodeId) -> Self {
        Node { arena, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn arena(&self) -> &Arc<GraphArena> {
        &self.arena
    }

    pub fn shape(&self) -> Shape {
        self.arena.lock().record(self.id).shape.clone()
    }

    pub fn element_count(&self) -> usize {
        self.shape().element_count().unwrap_or(0)
    }

    pub fn label(&self) -> Option<String> {
        self.arena.lock().record(self.id).label.clone()
    }

    /// Label for diagnostics, falling back to the node id.
    pub fn describe(&self) -> String {
        self.arena.lock().describe(self.id)
    }

    /// Attaches a diagnostic label.
    pub fn named(self, label: impl Into<String>) -> Self {
        self.arena.lock().record_mut(self.id).label = Some(label.into());
        self
    }

    /// Current host values: leaf data, or the last result materialised by the runtime.
    pub fn data(&self) -> Option<Vec<f32>> {
        self.arena.lock().record(self.id).data.clone()
    }

    pub fn has_data(&self) -> bool {
        self.arena.lock().record(self.id).data.is_some()
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.arena.lock().record(self.id).kind, NodeKind::Leaf)
    }

    pub fn op(&self) -> Option<OpKind> {
        match &self.arena.lock().record(self.id).kind {
            NodeKind::Leaf => None,
            NodeKind::Op { op, .. } => Some(op.clone()),
        }
    }

    pub fn parents(&self) -> Vec<Node> {
        let parents = match &self.arena.lock().record(self.id).kind {
            NodeKind::Leaf => Vec::new(),
            NodeKind::Op { parents, .. } => parents.clone(),
        };
        parents.into_iter().map(|id| self.arena.node(id)).collect()
    }

    /// Overwrites the node's values. The element count must match the shape.
    pub fn assign(&self, values: impl Into<Vec<f32>>) -> Result<()> {
        let values = values.into();
        let mut inner = self.arena.lock();
        let expected = inner.record(self.id).shape.element_count().unwrap_or(0);
        if values.len() != expected {
            return Err(GraphError::DimensionMismatch {
                label: inner.describe(self.id),
                expected,
                actual: values.len(),
            }
            .into());
        }
        inner.record_mut(self.id).data = Some(values);
        Ok(())
    }

    pub(crate) fn set_data(&self, values: Vec<f32>) {
        self.arena.lock().record_mut(self.id).data = Some(values);
    }

    pub(crate) fn same_graph(&self, other: &Node) -> bool {
        self.arena.id() == other.arena.id()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.same_graph(other) && self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.arena.id().hash(state);
        self.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.arena.lock();
        let record = inner.record(self.id);
        f.debug_struct("Node")
            .field("arena", &self.arena.id())
            .field("id", &self.id.0)
            .field("label", &record.label)
            .field("shape", &record.shape.dims())
            .field("has_data", &record.data.is_some())
            .finish()
    }
}
