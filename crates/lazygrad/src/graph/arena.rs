//! Shared arena that owns every node of one graph.
//!
//! Nodes are append-only records indexed by [`NodeId`]; handles ([`Node`]) pair an
//! `Arc<GraphArena>` with an id. Records are guarded by a mutex so handles can cross threads,
//! but the runtime does not isolate concurrent calls that touch the same nodes.

use std::sync::{
    atomic::{AtomicUsize, Ordering as AtomicOrdering},
    Arc, Mutex, MutexGuard,
};

use anyhow::Result;
use rand::Rng;

use crate::backend::spec::Shape;
use crate::error::GraphError;

use super::lowering::OpKind;
use super::node::Node;
use super::state::{GraphInner, NodeId, NodeKind, NodeRecord};

static ARENA_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub struct GraphArena {
    inner: Mutex<GraphInner>,
    id: usize,
}

impl GraphArena {
    pub fn new() -> Arc<Self> {
        Arc::new(GraphArena {
            inner: Mutex::new(GraphInner::default()),
            id: ARENA_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
        })
    }

    /// Process-unique arena identifier.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, GraphInner> {
        self.inner.lock().expect("graph arena poisoned")
    }

    /// Leaf with known values.
    pub fn constant(self: &Arc<Self>, values: impl Into<Vec<f32>>, shape: &[usize]) -> Result<Node> {
        self.leaf(None, Some(values.into()), shape)
    }

    /// Data-less leaf; its values are supplied through feeds at execution time.
    pub fn placeholder(self: &Arc<Self>, name: &str, shape: &[usize]) -> Result<Node> {
        self.leaf(Some(name.to_string()), None, shape)
    }

    /// Named data-bearing leaf intended to be updated by an optimizer.
    pub fn parameter(
        self: &Arc<Self>,
        name: &str,
        values: impl Into<Vec<f32>>,
        shape: &[usize],
    ) -> Result<Node> {
        self.leaf(Some(name.to_string()), Some(values.into()), shape)
    }

    /// Parameter drawn from `N(0, std^2)` with the Box-Muller transform.
    pub fn randn_parameter(
        self: &Arc<Self>,
        name: &str,
        shape: &[usize],
        std: f32,
        rng: &mut impl Rng,
    ) -> Result<Node> {
        let len = checked_count(Some(name), shape)?;
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        self.parameter(name, values, shape)
    }

    pub fn zeros(self: &Arc<Self>, shape: &[usize]) -> Result<Node> {
        let len = checked_count(None, shape)?;
        self.constant(vec![0.0; len], shape)
    }

    pub fn ones(self: &Arc<Self>, shape: &[usize]) -> Result<Node> {
        let len = checked_count(None, shape)?;
        self.constant(vec![1.0; len], shape)
    }

    /// Records an internal node. Parent arity is checked when the graph is lowered.
    pub fn record_op(
        self: &Arc<Self>,
        op: OpKind,
        parents: &[&Node],
        shape: Vec<usize>,
    ) -> Result<Node> {
        for parent in parents {
            if parent.arena().id() != self.id {
                return Err(GraphError::ForeignNode {
                    label: parent.describe(),
                }
                .into());
            }
        }
        checked_count(None, &shape)?;
        let record = NodeRecord {
            shape: Shape::new(shape),
            label: None,
            data: None,
            kind: NodeKind::Op {
                op,
                parents: parents.iter().map(|p| p.id()).collect(),
            },
        };
        let id = self.lock().push(record);
        Ok(Node::from_parts(Arc::clone(self), id))
    }

    fn leaf(
        self: &Arc<Self>,
        label: Option<String>,
        data: Option<Vec<f32>>,
        shape: &[usize],
    ) -> Result<Node> {
        let expected = checked_count(label.as_deref(), shape)?;
        if let Some(values) = &data {
            if values.len() != expected {
                return Err(GraphError::ElementCount {
                    label: label.unwrap_or_else(|| "<constant>".to_string()),
                    shape: shape.to_vec(),
                    expected,
                    actual: values.len(),
                }
                .into());
            }
        }
        let record = NodeRecord {
            shape: Shape::new(shape.to_vec()),
            label,
            data,
            kind: NodeKind::Leaf,
        };
        let id = self.lock().push(record);
        Ok(Node::from_parts(Arc::clone(self), id))
    }

    pub(crate) fn node(self: &Arc<Self>, id: NodeId) -> Node {
        Node::from_parts(Arc::clone(self), id)
    }
}

fn checked_count(label: Option<&str>, shape: &[usize]) -> Result<usize, GraphError> {
    let valid = Shape::new(shape.to_vec());
    match valid.element_count() {
        Some(count) if valid.is_valid() => Ok(count),
        _ => Err(GraphError::InvalidShape {
            label: label.unwrap_or("<unnamed>").to_string(),
            shape: shape.to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn kind_of(err: &anyhow::Error) -> &GraphError {
        err.downcast_ref::<GraphError>().expect("graph error")
    }

    #[test]
    fn leaf_constructors_validate_shape_and_count() {
        let arena = GraphArena::new();
        let err = arena.constant(vec![1.0, 2.0], &[3]).unwrap_err();
        assert!(matches!(kind_of(&err), GraphError::ElementCount { expected: 3, actual: 2, .. }));

        let err = arena.placeholder("x", &[2, 0]).unwrap_err();
        assert!(matches!(kind_of(&err), GraphError::InvalidShape { .. }));

        let err = arena.zeros(&[]).unwrap_err();
        assert!(matches!(kind_of(&err), GraphError::InvalidShape { .. }));
        assert!(arena.is_empty());
    }

    #[test]
    fn arenas_get_distinct_ids() {
        let a = GraphArena::new();
        let b = GraphArena::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn record_op_rejects_foreign_parents() {
        let a = GraphArena::new();
        let b = GraphArena::new();
        let x = a.constant(vec![1.0], &[1]).unwrap();
        let err = b
            .record_op(OpKind::StopGradient, &[&x], vec![1])
            .unwrap_err();
        assert!(matches!(kind_of(&err), GraphError::ForeignNode { .. }));
    }

    #[test]
    fn randn_parameter_is_seeded_and_scaled() {
        let arena = GraphArena::new();
        let mut rng = StdRng::seed_from_u64(3);
        let w = arena.randn_parameter("w", &[64, 16], 0.1, &mut rng).unwrap();
        let values = w.data().unwrap();
        assert_eq!(values.len(), 1024);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
        assert!(mean.abs() < 0.02, "mean {mean}");
        assert!((var.sqrt() - 0.1).abs() < 0.02, "std {}", var.sqrt());

        let mut again = StdRng::seed_from_u64(3);
        let w2 = arena.randn_parameter("w2", &[64, 16], 0.1, &mut again).unwrap();
        assert_eq!(w2.data(), w.data());
    }
}
