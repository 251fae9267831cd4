use std::collections::HashMap;
use std::time::Instant;

use anyhow::Result;

use crate::backend::spec::{ProgramBuilder, TensorSpec, ValueId};
use crate::error::GraphError;

use super::lowering::lower;
use super::node::Node;
use super::order::order_ids;
use super::state::{NodeId, NodeKind};

/// Result of lowering a node set into a fresh program.
///
/// The program is left unfinished so callers can append more instructions (gradients) before
/// choosing the result values.
#[derive(Debug)]
pub struct LoweredGraph {
    pub program: ProgramBuilder,
    pub mapping: HashMap<NodeId, ValueId>,
    /// Data-less leaves, in program parameter order.
    pub placeholders: Vec<(Node, ValueId)>,
    pub node_count: usize,
}

impl LoweredGraph {
    /// Value lowered for `node`, or `MissingMapping` if the node was not part of the build.
    pub fn value_of(&self, node: &Node) -> Result<ValueId, GraphError> {
        self.mapping
            .get(&node.id())
            .copied()
            .ok_or_else(|| GraphError::MissingMapping {
                label: node.describe(),
            })
    }
}

/// Lowers node graphs into programs. Nothing is cached between builds.
pub struct GraphBuilder;

impl GraphBuilder {
    /// Lowers every node reachable from `roots`. All roots must share one arena.
    pub fn build(roots: &[&Node]) -> Result<LoweredGraph> {
        let Some(first) = roots.first() else {
            return Err(GraphError::EmptyGraph.into());
        };
        for root in roots {
            if !root.same_graph(first) {
                return Err(GraphError::ForeignNode {
                    label: root.describe(),
                }
                .into());
            }
        }

        let start = Instant::now();
        let arena = first.arena();
        let root_ids: Vec<NodeId> = roots.iter().map(|root| root.id()).collect();

        let mut program = ProgramBuilder::new();
        let mut mapping = HashMap::new();
        let mut placeholders = Vec::new();

        // The arena stays locked for the whole pass; only record accessors are used below.
        let inner = arena.lock();
        let order = order_ids(&inner, &root_ids);
        for &id in &order {
            let record = inner.record(id);
            let value = match &record.kind {
                NodeKind::Leaf => match &record.data {
                    Some(values) => program
                        .constant(record.shape.clone(), values)
                        .map_err(|source| GraphError::Operator {
                            label: inner.describe(id),
                            op: "constant",
                            source,
                        })?,
                    None => {
                        let value = program.add_parameter(TensorSpec::new(record.shape.clone()));
                        placeholders.push((arena.node(id), value));
                        value
                    }
                },
                NodeKind::Op { op, parents } => {
                    let arity = op.arity();
                    if !arity.accepts(parents.len()) {
                        return Err(GraphError::Arity {
                            label: inner.describe(id),
                            op: op.name(),
                            expected: arity.minimum(),
                            actual: parents.len(),
                        }
                        .into());
                    }
                    let mut operands = Vec::with_capacity(parents.len());
                    for parent in parents {
                        let value = mapping.get(parent).copied().ok_or_else(|| {
                            GraphError::MissingMapping {
                                label: inner.describe(*parent),
                            }
                        })?;
                        operands.push(value);
                    }
                    lower(&mut program, op, &operands, &record.shape).map_err(|source| {
                        GraphError::Operator {
                            label: inner.describe(id),
                            op: op.name(),
                            source,
                        }
                    })?
                }
            };
            mapping.insert(id, value);
        }
        drop(inner);

        let elapsed = start.elapsed();
        log::debug!(
            "lowered {} nodes into {} instructions ({} placeholders) in {:?}",
            order.len(),
            program.instructions().len(),
            placeholders.len(),
            elapsed
        );

        Ok(LoweredGraph {
            program,
            mapping,
            placeholders,
            node_count: order.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{ElementwiseBinaryOp, Operation};
    use crate::graph::{GraphArena, OpKind, UnaryKind};

    #[test]
    fn leaves_become_constants_or_parameters() {
        let arena = GraphArena::new();
        let a = arena.constant(vec![1.0, 2.0], &[2]).unwrap();
        let x = arena.placeholder("x", &[2]).unwrap();
        let y = arena
            .record_op(OpKind::Binary(ElementwiseBinaryOp::Mul), &[&a, &x], vec![2])
            .unwrap();

        let lowered = GraphBuilder::build(&[&y]).unwrap();
        assert_eq!(lowered.node_count, 3);
        assert_eq!(lowered.placeholders.len(), 1);
        assert_eq!(lowered.placeholders[0].0, x);
        assert!(matches!(
            lowered.program.instructions()[0].op,
            Operation::Constant(_)
        ));
        assert!(lowered.value_of(&y).is_ok());
    }

    #[test]
    fn arity_is_checked_at_lowering() {
        let arena = GraphArena::new();
        let a = arena.constant(vec![1.0], &[1]).unwrap().named("a");
        let bad = arena
            .record_op(OpKind::Binary(ElementwiseBinaryOp::Add), &[&a], vec![1])
            .unwrap()
            .named("lonely_add");
        let err = GraphBuilder::build(&[&bad]).unwrap_err();
        match err.downcast_ref::<GraphError>() {
            Some(GraphError::Arity {
                label,
                expected,
                actual,
                ..
            }) => {
                assert_eq!(label, "lonely_add");
                assert_eq!((*expected, *actual), (2, 1));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn lowering_failures_name_the_node() {
        let arena = GraphArena::new();
        let a = arena.constant(vec![1.0, 2.0], &[2]).unwrap();
        // Declared shape disagrees with what exp produces.
        let bad = arena
            .record_op(OpKind::Unary(UnaryKind::Exp), &[&a], vec![3])
            .unwrap()
            .named("wrong_shape");
        let err = GraphBuilder::build(&[&bad]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::Operator { label, .. }) if label == "wrong_shape"
        ));
    }

    #[test]
    fn empty_roots_are_rejected() {
        let err = GraphBuilder::build(&[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::EmptyGraph)
        ));
    }
}
