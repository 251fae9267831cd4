//! Shared helpers backing the functional node API.

use anyhow::Result;

use crate::backend::spec::ComparisonOp;
use crate::error::GraphError;
use crate::graph::{Node, OpKind};

pub(crate) fn shape_error(op: &'static str, detail: impl Into<String>) -> GraphError {
    GraphError::Shape {
        op,
        detail: detail.into(),
    }
}

/// Appends a node to the arena of the first parent.
pub(crate) fn record(op: OpKind, parents: &[&Node], shape: Vec<usize>) -> Result<Node> {
    let Some(first) = parents.first() else {
        return Err(shape_error(op.name(), "operator needs at least one input").into());
    };
    first.arena().record_op(op, parents, shape)
}

/// Checks that `axes` are unique and within `rank`.
pub(crate) fn validate_axes(op: &'static str, axes: &[usize], rank: usize) -> Result<()> {
    let mut seen = vec![false; rank];
    for &axis in axes {
        if axis >= rank {
            return Err(shape_error(op, format!("axis {axis} out of range for rank {rank}")).into());
        }
        if std::mem::replace(&mut seen[axis], true) {
            return Err(shape_error(op, format!("axis {axis} listed twice")).into());
        }
    }
    Ok(())
}

/// Extension trait exposing the functional operators as methods on [`Node`].
pub trait NodeOps: Sized {
    fn add(&self, rhs: &Self) -> Result<Self>;
    fn sub(&self, rhs: &Self) -> Result<Self>;
    fn mul(&self, rhs: &Self) -> Result<Self>;
    fn div(&self, rhs: &Self) -> Result<Self>;
    fn maximum(&self, rhs: &Self) -> Result<Self>;
    fn minimum(&self, rhs: &Self) -> Result<Self>;
    fn add_scalar(&self, value: f32) -> Result<Self>;
    fn mul_scalar(&self, value: f32) -> Result<Self>;
    fn div_scalar(&self, value: f32) -> Result<Self>;
    fn neg(&self) -> Result<Self>;
    fn exp(&self) -> Result<Self>;
    fn log(&self) -> Result<Self>;
    fn relu(&self) -> Result<Self>;
    fn compare(&self, rhs: &Self, op: ComparisonOp) -> Result<Self>;
    /// Sum of every element, shape `[1]`.
    fn sum(&self) -> Result<Self>;
    fn mean(&self) -> Result<Self>;
    fn matmul(&self, rhs: &Self) -> Result<Self>;
    fn reshape(&self, dims: &[usize]) -> Result<Self>;
    fn transpose(&self, perm: &[usize]) -> Result<Self>;
    fn stop_gradient(&self) -> Result<Self>;
}

impl NodeOps for Node {
    fn add(&self, rhs: &Self) -> Result<Self> {
        super::elementwise::add(self, rhs)
    }

    fn sub(&self, rhs: &Self) -> Result<Self> {
        super::elementwise::sub(self, rhs)
    }

    fn mul(&self, rhs: &Self) -> Result<Self> {
        super::elementwise::mul(self, rhs)
    }

    fn div(&self, rhs: &Self) -> Result<Self> {
        super::elementwise::div(self, rhs)
    }

    fn maximum(&self, rhs: &Self) -> Result<Self> {
        super::elementwise::maximum(self, rhs)
    }

    fn minimum(&self, rhs: &Self) -> Result<Self> {
        super::elementwise::minimum(self, rhs)
    }

    fn add_scalar(&self, value: f32) -> Result<Self> {
        super::elementwise::add_scalar(self, value)
    }

    fn mul_scalar(&self, value: f32) -> Result<Self> {
        super::elementwise::mul_scalar(self, value)
    }

    fn div_scalar(&self, value: f32) -> Result<Self> {
        super::elementwise::div_scalar(self, value)
    }

    fn neg(&self) -> Result<Self> {
        super::elementwise::neg(self)
    }

    fn exp(&self) -> Result<Self> {
        super::elementwise::exp(self)
    }

    fn log(&self) -> Result<Self> {
        super::elementwise::log(self)
    }

    fn relu(&self) -> Result<Self> {
        super::elementwise::relu(self)
    }

    fn compare(&self, rhs: &Self, op: ComparisonOp) -> Result<Self> {
        super::elementwise::compare(self, rhs, op)
    }

    fn sum(&self) -> Result<Self> {
        super::reduce::sum(self)
    }

    fn mean(&self) -> Result<Self> {
        super::reduce::mean(self)
    }

    fn matmul(&self, rhs: &Self) -> Result<Self> {
        super::linalg::matmul(self, rhs)
    }

    fn reshape(&self, dims: &[usize]) -> Result<Self> {
        super::shape::reshape(self, dims)
    }

    fn transpose(&self, perm: &[usize]) -> Result<Self> {
        super::shape::transpose(self, perm)
    }

    fn stop_gradient(&self) -> Result<Self> {
        super::elementwise::stop_gradient(self)
    }
}
