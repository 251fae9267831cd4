use std::collections::HashSet;

use lazygrad::backend::spec::ElementwiseBinaryOp;
use lazygrad::graph::{topological_order, OpKind};
use lazygrad::ops::functional;
use lazygrad::{GraphArena, GraphError, Node, NodeOps};

fn graph_error(err: &anyhow::Error) -> &GraphError {
    err.downcast_ref::<GraphError>()
        .unwrap_or_else(|| panic!("expected a GraphError, got {err:?}"))
}

fn position(order: &[Node], node: &Node) -> usize {
    order
        .iter()
        .position(|candidate| candidate == node)
        .expect("node missing from order")
}

#[test]
fn parents_precede_children_and_nodes_appear_once() {
    let arena = GraphArena::new();
    let a = arena.constant(vec![1.0; 4], &[2, 2]).unwrap();
    let b = arena.constant(vec![2.0], &[1]).unwrap();
    let c = a.add(&b).unwrap();
    let d = c.mul(&c).unwrap();
    let e = d.add(&a).unwrap();

    let order = topological_order(&[&e, &d, &c]).unwrap();
    assert_eq!(order.len(), 5);
    let unique: HashSet<&Node> = order.iter().collect();
    assert_eq!(unique.len(), order.len());

    for node in &order {
        for parent in node.parents() {
            assert!(position(&order, &parent) < position(&order, node));
        }
    }
}

#[test]
fn ordering_covers_only_ancestors() {
    let arena = GraphArena::new();
    let a = arena.constant(vec![1.0], &[1]).unwrap();
    let b = arena.constant(vec![2.0], &[1]).unwrap();
    let unrelated = b.exp().unwrap();
    let c = a.neg().unwrap();

    let order = topological_order(&[&c]).unwrap();
    assert_eq!(order, vec![a, c]);
    assert!(!order.contains(&unrelated));
}

#[test]
fn operators_infer_shapes_without_executing() {
    let arena = GraphArena::new();
    let a = arena.placeholder("a", &[4, 1, 3]).unwrap();
    let b = arena.placeholder("b", &[5, 1]).unwrap();
    let c = a.add(&b).unwrap();
    assert_eq!(c.shape().dims(), &[4, 5, 3]);
    assert!(!c.has_data());
    assert!(!c.is_leaf());
    assert!(matches!(
        c.op(),
        Some(OpKind::Binary(ElementwiseBinaryOp::Add))
    ));

    let pooled = functional::max_pool2d(
        &arena.placeholder("img", &[2, 6, 6, 3]).unwrap(),
        [2, 2],
        [2, 2],
    )
    .unwrap();
    assert_eq!(pooled.shape().dims(), &[2, 3, 3, 3]);

    let flat = functional::flatten(&pooled).unwrap();
    assert_eq!(flat.shape().dims(), &[2, 27]);
}

#[test]
fn incompatible_broadcast_is_a_shape_error() {
    let arena = GraphArena::new();
    let a = arena.placeholder("a", &[2, 3]).unwrap();
    let b = arena.placeholder("b", &[4]).unwrap();
    let err = a.add(&b).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::Shape { .. }));

    let err = a.matmul(&b).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::Shape { .. }));
}

#[test]
fn leaves_validate_shape_and_data() {
    let arena = GraphArena::new();
    let err = arena.constant(vec![1.0, 2.0, 3.0], &[2, 2]).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::ElementCount {
            expected: 4,
            actual: 3,
            ..
        }
    ));

    let err = arena.placeholder("empty", &[2, 0]).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::InvalidShape { .. }));

    let p = arena.parameter("p", vec![0.0; 2], &[2]).unwrap();
    assert!(p.assign(vec![1.0]).is_err());
    p.assign(vec![1.0, 2.0]).unwrap();
    assert_eq!(p.data().unwrap(), vec![1.0, 2.0]);
}

#[test]
fn mixing_arenas_is_rejected() {
    let first = GraphArena::new();
    let second = GraphArena::new();
    let a = first.constant(vec![1.0], &[1]).unwrap();
    let b = second.constant(vec![1.0], &[1]).unwrap().named("stranger");

    let err = a.add(&b).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::ForeignNode { label } if label == "stranger"
    ));

    let err = topological_order(&[&a, &b]).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::ForeignNode { .. }));
}
