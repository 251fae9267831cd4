use anyhow::Result;

use crate::backend::emit::reduced_dims;
use crate::graph::{Node, OpKind, ReduceOp};

use super::common::{record, validate_axes};

pub fn reduce(x: &Node, op: ReduceOp, axes: &[usize], keepdims: bool) -> Result<Node> {
    let dims = x.shape().into_dims();
    validate_axes("reduce", axes, dims.len())?;
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    let out = reduced_dims(&dims, &sorted, keepdims);
    record(
        OpKind::Reduce {
            op,
            axes: sorted,
            keepdims,
        },
        &[x],
        out,
    )
}

fn all_axes(x: &Node) -> Vec<usize> {
    (0..x.shape().rank()).collect()
}

/// Sum of every element, shape `[1]`.
pub fn sum(x: &Node) -> Result<Node> {
    reduce(x, ReduceOp::Sum, &all_axes(x), false)
}

pub fn sum_axes(x: &Node, axes: &[usize], keepdims: bool) -> Result<Node> {
    reduce(x, ReduceOp::Sum, axes, keepdims)
}

/// Mean of every element, shape `[1]`.
pub fn mean(x: &Node) -> Result<Node> {
    reduce(x, ReduceOp::Mean, &all_axes(x), false)
}

pub fn mean_axes(x: &Node, axes: &[usize], keepdims: bool) -> Result<Node> {
    reduce(x, ReduceOp::Mean, axes, keepdims)
}

pub fn max_axes(x: &Node, axes: &[usize], keepdims: bool) -> Result<Node> {
    reduce(x, ReduceOp::Max, axes, keepdims)
}

pub fn min_axes(x: &Node, axes: &[usize], keepdims: bool) -> Result<Node> {
    reduce(x, ReduceOp::Min, axes, keepdims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphArena;

    #[test]
    fn full_reduction_yields_a_single_element() {
        let arena = GraphArena::new();
        let x = arena.zeros(&[2, 3, 4]).unwrap();
        assert_eq!(sum(&x).unwrap().shape().dims(), &[1]);
        assert_eq!(mean_axes(&x, &[2, 0], false).unwrap().shape().dims(), &[3]);
        assert_eq!(max_axes(&x, &[1], true).unwrap().shape().dims(), &[2, 1, 4]);
    }

    #[test]
    fn duplicate_or_out_of_range_axes_fail() {
        let arena = GraphArena::new();
        let x = arena.zeros(&[2, 3]).unwrap();
        assert!(sum_axes(&x, &[0, 0], false).is_err());
        assert!(sum_axes(&x, &[2], false).is_err());
    }
}
