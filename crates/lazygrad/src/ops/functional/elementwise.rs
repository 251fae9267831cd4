//! Elementwise operators with numpy-style broadcasting.

use anyhow::Result;

use crate::backend::shape_helpers::broadcast_shapes;
use crate::backend::spec::{ComparisonOp, ElementwiseBinaryOp};
use crate::graph::{Node, OpKind, UnaryKind};

use super::common::{record, shape_error};

fn broadcast_binary(op: OpKind, lhs: &Node, rhs: &Node) -> Result<Node> {
    let lhs_dims = lhs.shape().into_dims();
    let rhs_dims = rhs.shape().into_dims();
    let Some(out) = broadcast_shapes(&lhs_dims, &rhs_dims) else {
        return Err(shape_error(
            op.name(),
            format!("shapes {lhs_dims:?} and {rhs_dims:?} do not broadcast"),
        )
        .into());
    };
    record(op, &[lhs, rhs], out)
}

pub fn binary(op: ElementwiseBinaryOp, lhs: &Node, rhs: &Node) -> Result<Node> {
    broadcast_binary(OpKind::Binary(op), lhs, rhs)
}

pub fn add(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Add, lhs, rhs)
}

pub fn sub(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Sub, lhs, rhs)
}

pub fn mul(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Mul, lhs, rhs)
}

pub fn div(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Div, lhs, rhs)
}

pub fn maximum(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Maximum, lhs, rhs)
}

pub fn minimum(lhs: &Node, rhs: &Node) -> Result<Node> {
    binary(ElementwiseBinaryOp::Minimum, lhs, rhs)
}

/// Elementwise comparison producing 1.0 where it holds and 0.0 elsewhere.
pub fn compare(lhs: &Node, rhs: &Node, op: ComparisonOp) -> Result<Node> {
    broadcast_binary(OpKind::Compare(op), lhs, rhs)
}

fn scalar(x: &Node, op: ElementwiseBinaryOp, value: f32, reversed: bool) -> Result<Node> {
    let dims = x.shape().into_dims();
    record(
        OpKind::Scalar {
            op,
            value,
            reversed,
        },
        &[x],
        dims,
    )
}

pub fn add_scalar(x: &Node, value: f32) -> Result<Node> {
    scalar(x, ElementwiseBinaryOp::Add, value, false)
}

pub fn sub_scalar(x: &Node, value: f32) -> Result<Node> {
    scalar(x, ElementwiseBinaryOp::Sub, value, false)
}

/// `value - x`.
pub fn rsub_scalar(x: &Node, value: f32) -> Result<Node> {
    scalar(x, ElementwiseBinaryOp::Sub, value, true)
}

pub fn mul_scalar(x: &Node, value: f32) -> Result<Node> {
    scalar(x, ElementwiseBinaryOp::Mul, value, false)
}

pub fn div_scalar(x: &Node, value: f32) -> Result<Node> {
    scalar(x, ElementwiseBinaryOp::Div, value, false)
}

pub fn unary(kind: UnaryKind, x: &Node) -> Result<Node> {
    let dims = x.shape().into_dims();
    record(OpKind::Unary(kind), &[x], dims)
}

pub fn neg(x: &Node) -> Result<Node> {
    unary(UnaryKind::Neg, x)
}

pub fn abs(x: &Node) -> Result<Node> {
    unary(UnaryKind::Abs, x)
}

pub fn exp(x: &Node) -> Result<Node> {
    unary(UnaryKind::Exp, x)
}

pub fn log(x: &Node) -> Result<Node> {
    unary(UnaryKind::Log, x)
}

pub fn tanh(x: &Node) -> Result<Node> {
    unary(UnaryKind::Tanh, x)
}

pub fn sqrt(x: &Node) -> Result<Node> {
    unary(UnaryKind::Sqrt, x)
}

pub fn square(x: &Node) -> Result<Node> {
    unary(UnaryKind::Square, x)
}

pub fn reciprocal(x: &Node) -> Result<Node> {
    unary(UnaryKind::Reciprocal, x)
}

pub fn relu(x: &Node) -> Result<Node> {
    unary(UnaryKind::Relu, x)
}

pub fn sigmoid(x: &Node) -> Result<Node> {
    unary(UnaryKind::Sigmoid, x)
}

/// Identity in the forward pass; blocks gradient flow.
pub fn stop_gradient(x: &Node) -> Result<Node> {
    let dims = x.shape().into_dims();
    record(OpKind::StopGradient, &[x], dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::graph::GraphArena;

    #[test]
    fn broadcasting_infers_the_joint_shape() {
        let arena = GraphArena::new();
        let a = arena.zeros(&[2, 1, 3]).unwrap();
        let b = arena.ones(&[4, 1]).unwrap();
        let c = add(&a, &b).unwrap();
        assert_eq!(c.shape().dims(), &[2, 4, 3]);
        assert_eq!(c.parents(), vec![a, b]);
    }

    #[test]
    fn incompatible_shapes_are_rejected_at_construction() {
        let arena = GraphArena::new();
        let a = arena.zeros(&[2, 3]).unwrap();
        let b = arena.zeros(&[4]).unwrap();
        let err = mul(&a, &b).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::Shape { op: "binary", .. })
        ));
    }

    #[test]
    fn scalar_ops_keep_the_input_shape() {
        let arena = GraphArena::new();
        let a = arena.zeros(&[3, 2]).unwrap();
        let b = rsub_scalar(&a, 1.0).unwrap();
        assert_eq!(b.shape().dims(), &[3, 2]);
        assert_eq!(
            b.op(),
            Some(OpKind::Scalar {
                op: ElementwiseBinaryOp::Sub,
                value: 1.0,
                reversed: true
            })
        );
    }
}
