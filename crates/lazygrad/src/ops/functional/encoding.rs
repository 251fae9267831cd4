use anyhow::{ensure, Result};

use crate::graph::{Node, OpKind};

use super::common::{record, shape_error};

/// One-hot encoding of float class indices along a new trailing axis of size `depth`.
///
/// Indices outside `0..depth` or with a fractional part produce an all-zero row.
pub fn one_hot(indices: &Node, depth: usize) -> Result<Node> {
    ensure!(depth > 0, shape_error("one_hot", "depth must be positive"));
    let mut dims = indices.shape().into_dims();
    dims.push(depth);
    record(OpKind::OneHot { depth }, &[indices], dims)
}
