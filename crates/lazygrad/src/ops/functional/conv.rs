//! 2-D convolution lowered as patch extraction plus a contraction.

use anyhow::{ensure, Result};

use crate::backend::shape_helpers::window_output_extent;
use crate::graph::{Node, OpKind};

use super::common::{record, shape_error};

/// Convolution of an NHWC `input` with an HWIO `kernel` (`[kh, kw, c_in, c_out]`).
///
/// `padding` adds the same number of zeros on both sides of each spatial axis.
pub fn conv2d(
    input: &Node,
    kernel: &Node,
    strides: [usize; 2],
    padding: [usize; 2],
) -> Result<Node> {
    let x = input.shape().into_dims();
    let k = kernel.shape().into_dims();
    ensure!(
        x.len() == 4,
        shape_error("conv2d", format!("expects rank-4 NHWC input, got {x:?}"))
    );
    ensure!(
        k.len() == 4,
        shape_error("conv2d", format!("expects rank-4 [kh, kw, c_in, c_out] kernel, got {k:?}"))
    );
    ensure!(
        x[3] == k[2],
        shape_error("conv2d", format!("input has {} channels, kernel expects {}", x[3], k[2]))
    );
    ensure!(
        strides.iter().all(|&s| s > 0),
        shape_error("conv2d", "strides must be positive")
    );
    let out_h = window_output_extent(x[1], k[0], strides[0], padding[0], padding[0]);
    let out_w = window_output_extent(x[2], k[1], strides[1], padding[1], padding[1]);
    let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
        return Err(shape_error(
            "conv2d",
            format!("kernel {}x{} does not fit padded input {}x{}", k[0], k[1], x[1], x[2]),
        )
        .into());
    };
    record(
        OpKind::Conv2d { strides, padding },
        &[input, kernel],
        vec![x[0], out_h, out_w, k[3]],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphArena;

    #[test]
    fn output_extent_follows_stride_and_padding() {
        let arena = GraphArena::new();
        let x = arena.zeros(&[2, 5, 5, 3]).unwrap();
        let k = arena.zeros(&[3, 3, 3, 8]).unwrap();
        let y = conv2d(&x, &k, [1, 1], [0, 0]).unwrap();
        assert_eq!(y.shape().dims(), &[2, 3, 3, 8]);
        let y = conv2d(&x, &k, [2, 2], [1, 1]).unwrap();
        assert_eq!(y.shape().dims(), &[2, 3, 3, 8]);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let arena = GraphArena::new();
        let x = arena.zeros(&[1, 4, 4, 2]).unwrap();
        let k = arena.zeros(&[3, 3, 1, 1]).unwrap();
        assert!(conv2d(&x, &k, [1, 1], [0, 0]).is_err());
    }
}
