use anyhow::{ensure, Result};

use crate::backend::shape_helpers::window_output_extent;
use crate::graph::{Node, OpKind, PoolKind};

use super::common::{record, shape_error};

fn pool2d(kind: PoolKind, x: &Node, window: [usize; 2], strides: [usize; 2]) -> Result<Node> {
    let dims = x.shape().into_dims();
    ensure!(
        dims.len() == 4,
        shape_error("pool2d", format!("expects rank-4 NHWC input, got {dims:?}"))
    );
    ensure!(
        window.iter().chain(&strides).all(|&v| v > 0),
        shape_error("pool2d", "window and strides must be positive")
    );
    let out_h = window_output_extent(dims[1], window[0], strides[0], 0, 0);
    let out_w = window_output_extent(dims[2], window[1], strides[1], 0, 0);
    let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
        return Err(shape_error(
            "pool2d",
            format!("window {window:?} does not fit input {}x{}", dims[1], dims[2]),
        )
        .into());
    };
    record(
        OpKind::Pool2d {
            kind,
            window,
            strides,
        },
        &[x],
        vec![dims[0], out_h, out_w, dims[3]],
    )
}

/// Max over each `window` of an NHWC input, without padding.
pub fn max_pool2d(x: &Node, window: [usize; 2], strides: [usize; 2]) -> Result<Node> {
    pool2d(PoolKind::Max, x, window, strides)
}

/// Mean over each `window` of an NHWC input, without padding.
pub fn avg_pool2d(x: &Node, window: [usize; 2], strides: [usize; 2]) -> Result<Node> {
    pool2d(PoolKind::Avg, x, window, strides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphArena;

    #[test]
    fn pooled_shape() {
        let arena = GraphArena::new();
        let x = arena.zeros(&[1, 4, 6, 2]).unwrap();
        assert_eq!(max_pool2d(&x, [2, 2], [2, 2]).unwrap().shape().dims(), &[1, 2, 3, 2]);
        assert!(avg_pool2d(&x, [5, 2], [1, 1]).is_err());
    }
}
