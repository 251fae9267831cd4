use anyhow::{ensure, Result};

use crate::graph::{Node, OpKind};

use super::common::{record, shape_error};

fn along_axis(op: OpKind, x: &Node, axis: usize) -> Result<Node> {
    let dims = x.shape().into_dims();
    ensure!(
        axis < dims.len(),
        shape_error(op.name(), format!("axis {axis} out of range for rank {}", dims.len()))
    );
    record(op, &[x], dims)
}

pub fn softmax(x: &Node, axis: usize) -> Result<Node> {
    along_axis(OpKind::Softmax { axis }, x, axis)
}

pub fn log_softmax(x: &Node, axis: usize) -> Result<Node> {
    along_axis(OpKind::LogSoftmax { axis }, x, axis)
}
