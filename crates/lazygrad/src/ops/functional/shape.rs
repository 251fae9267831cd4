use anyhow::{bail, ensure, Result};

use crate::backend::shape_helpers::{broadcasts_to, is_permutation};
use crate::backend::spec::Shape;
use crate::graph::{Node, OpKind};

use super::common::{record, shape_error};

pub fn reshape(x: &Node, dims: &[usize]) -> Result<Node> {
    let input = x.shape();
    let target = Shape::new(dims.to_vec());
    ensure!(
        target.is_valid(),
        shape_error("reshape", format!("target shape {dims:?} has a zero or no extent"))
    );
    ensure!(
        target.element_count() == input.element_count(),
        shape_error("reshape", format!("cannot reshape {input} into {target}"))
    );
    record(OpKind::Reshape, &[x], dims.to_vec())
}

/// Collapses every axis after the first: `[n, a, b, ...]` becomes `[n, a * b * ...]`.
pub fn flatten(x: &Node) -> Result<Node> {
    let dims = x.shape().into_dims();
    let rest: usize = dims[1..].iter().product();
    reshape(x, &[dims[0], rest])
}

pub fn transpose(x: &Node, perm: &[usize]) -> Result<Node> {
    let dims = x.shape().into_dims();
    if perm.len() != dims.len() {
        bail!(shape_error(
            "transpose",
            format!("permutation {perm:?} does not match rank {}", dims.len())
        ));
    }
    if !is_permutation(perm) {
        bail!(shape_error("transpose", format!("{perm:?} is not a permutation")));
    }
    let out = perm.iter().map(|&axis| dims[axis]).collect();
    record(OpKind::Transpose { perm: perm.to_vec() }, &[x], out)
}

/// Expands size-1 or missing leading axes to `dims`.
pub fn broadcast_to(x: &Node, dims: &[usize]) -> Result<Node> {
    let input = x.shape().into_dims();
    ensure!(
        broadcasts_to(&input, dims),
        shape_error("broadcast_to", format!("{input:?} cannot broadcast to {dims:?}"))
    );
    record(OpKind::BroadcastTo, &[x], dims.to_vec())
}

/// Contiguous window `[starts[i], starts[i] + sizes[i])` on every axis.
pub fn slice(x: &Node, starts: &[usize], sizes: &[usize]) -> Result<Node> {
    let dims = x.shape().into_dims();
    ensure!(
        starts.len() == dims.len() && sizes.len() == dims.len(),
        shape_error("slice", format!("bounds do not match rank {}", dims.len()))
    );
    for axis in 0..dims.len() {
        ensure!(
            sizes[axis] > 0
                && starts[axis]
                    .checked_add(sizes[axis])
                    .is_some_and(|end| end <= dims[axis]),
            shape_error(
                "slice",
                format!(
                    "[{}, +{}) out of bounds on axis {axis} of extent {}",
                    starts[axis], sizes[axis], dims[axis]
                )
            )
        );
    }
    record(
        OpKind::Slice {
            starts: starts.to_vec(),
        },
        &[x],
        sizes.to_vec(),
    )
}

pub fn concat(inputs: &[&Node], axis: usize) -> Result<Node> {
    let Some(first) = inputs.first() else {
        bail!(shape_error("concat", "needs at least one input"));
    };
    let mut out = first.shape().into_dims();
    ensure!(
        axis < out.len(),
        shape_error("concat", format!("axis {axis} out of range for rank {}", out.len()))
    );
    for input in &inputs[1..] {
        let dims = input.shape().into_dims();
        let compatible = dims.len() == out.len()
            && dims
                .iter()
                .zip(&out)
                .enumerate()
                .all(|(a, (d, o))| a == axis || d == o);
        ensure!(
            compatible,
            shape_error("concat", format!("{dims:?} does not line up with {out:?} on axis {axis}"))
        );
        out[axis] += dims[axis];
    }
    record(OpKind::Concat { axis }, inputs, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use crate::graph::GraphArena;

    #[test]
    fn reshape_preserves_element_count() {
        let arena = GraphArena::new();
        let x = arena.zeros(&[2, 6]).unwrap();
        assert_eq!(reshape(&x, &[3, 4]).unwrap().shape().dims(), &[3, 4]);
        assert!(reshape(&x, &[5]).is_err());
        assert!(reshape(&x, &[12, 0]).is_err());

        let y = arena.zeros(&[2, 3, 4]).unwrap();
        assert_eq!(flatten(&y).unwrap().shape().dims(), &[2, 12]);
    }

    #[test]
    fn transpose_and_slice_shapes() {
        let arena = GraphArena::new();
        let x = arena.zeros(&[2, 3, 4]).unwrap();
        assert_eq!(transpose(&x, &[2, 0, 1]).unwrap().shape().dims(), &[4, 2, 3]);
        assert!(transpose(&x, &[0, 0, 1]).is_err());
        assert_eq!(slice(&x, &[1, 0, 2], &[1, 3, 2]).unwrap().shape().dims(), &[1, 3, 2]);
        assert!(slice(&x, &[1, 0, 3], &[1, 3, 2]).is_err());
        let err = slice(&x, &[usize::MAX, 0, 0], &[1, 3, 4]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::Shape { op: "slice", .. })
        ));
    }

    #[test]
    fn concat_sums_the_axis() {
        let arena = GraphArena::new();
        let a = arena.zeros(&[2, 3]).unwrap();
        let b = arena.zeros(&[2, 5]).unwrap();
        assert_eq!(concat(&[&a, &b], 1).unwrap().shape().dims(), &[2, 8]);
        assert!(concat(&[&a, &b], 0).is_err());
        assert!(broadcast_to(&a, &[4, 2, 3]).is_ok());
        assert!(broadcast_to(&a, &[3, 3]).is_err());
    }
}
