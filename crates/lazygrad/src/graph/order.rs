//! Deduplicating multi-root topological ordering.

use std::collections::HashSet;

use anyhow::Result;

use crate::error::GraphError;

use super::node::Node;
use super::state::{GraphInner, NodeId, NodeKind};

/// Returns every node reachable from `roots`, parents before children, each exactly once.
///
/// Roots are deduplicated in first-occurrence order and the visited set is shared across them,
/// so nodes reachable from several roots are emitted once. Roots from different arenas are
/// rejected.
pub fn topological_order(roots: &[&Node]) -> Result<Vec<Node>> {
    let Some(first) = roots.first() else {
        return Ok(Vec::new());
    };
    for root in roots {
        if !root.same_graph(first) {
            return Err(GraphError::ForeignNode {
                label: root.describe(),
            }
            .into());
        }
    }
    let arena = first.arena();
    let ids: Vec<NodeId> = roots.iter().map(|root| root.id()).collect();
    let order = {
        let inner = arena.lock();
        order_ids(&inner, &ids)
    };
    Ok(order.into_iter().map(|id| arena.node(id)).collect())
}

/// Iterative post-order DFS over node records.
pub(crate) fn order_ids(inner: &GraphInner, roots: &[NodeId]) -> Vec<NodeId> {
    let mut seen_roots = HashSet::with_capacity(roots.len());
    let mut visited = vec![false; inner.nodes.len()];
    let mut order = Vec::new();
    let mut stack: Vec<(NodeId, bool)> = Vec::new();

    for &root in roots {
        if !seen_roots.insert(root) || visited[root.0] {
            continue;
        }
        stack.push((root, false));
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if visited[id.0] {
                continue;
            }
            visited[id.0] = true;
            stack.push((id, true));
            if let NodeKind::Op { parents, .. } = &inner.record(id).kind {
                for parent in parents.iter().rev() {
                    if !visited[parent.0] {
                        stack.push((*parent, false));
                    }
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphArena, OpKind};
    use crate::backend::spec::ElementwiseBinaryOp;

    fn add(a: &Node, b: &Node) -> Node {
        a.arena()
            .record_op(
                OpKind::Binary(ElementwiseBinaryOp::Add),
                &[a, b],
                a.shape().into_dims(),
            )
            .unwrap()
    }

    fn position(order: &[Node], node: &Node) -> usize {
        order.iter().position(|n| n == node).unwrap()
    }

    #[test]
    fn diamond_visits_shared_parent_once() {
        let arena = GraphArena::new();
        let x = arena.constant(vec![1.0], &[1]).unwrap();
        let left = add(&x, &x);
        let right = add(&x, &x);
        let top = add(&left, &right);

        let order = topological_order(&[&top]).unwrap();
        assert_eq!(order.len(), 4);
        assert!(position(&order, &x) < position(&order, &left));
        assert!(position(&order, &x) < position(&order, &right));
        assert_eq!(order.last(), Some(&top));
    }

    #[test]
    fn duplicate_and_overlapping_roots_are_deduplicated() {
        let arena = GraphArena::new();
        let a = arena.constant(vec![1.0], &[1]).unwrap();
        let b = arena.constant(vec![2.0], &[1]).unwrap();
        let c = add(&a, &b);
        let d = add(&c, &a);

        let order = topological_order(&[&c, &d, &c, &a]).unwrap();
        assert_eq!(order.len(), 4);
        let unique: HashSet<_> = order.iter().cloned().collect();
        assert_eq!(unique.len(), 4);
        assert!(position(&order, &c) < position(&order, &d));
    }

    #[test]
    fn empty_roots_give_empty_order() {
        assert!(topological_order(&[]).unwrap().is_empty());
    }

    #[test]
    fn deep_chains_do_not_overflow() {
        let arena = GraphArena::new();
        let mut node = arena.constant(vec![0.0], &[1]).unwrap();
        for _ in 0..50_000 {
            node = arena
                .record_op(OpKind::StopGradient, &[&node], vec![1])
                .unwrap();
        }
        let order = topological_order(&[&node]).unwrap();
        assert_eq!(order.len(), 50_001);
    }
}
