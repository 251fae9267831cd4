//! Shared shape arithmetic used by lowering, gradient rules, and backends.

/// Numpy-style broadcast of two shapes, right-aligned. Returns `None` when incompatible.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![0usize; rank];
    for axis in 0..rank {
        let l = axis
            .checked_sub(rank - lhs.len())
            .map(|index| lhs[index])
            .unwrap_or(1);
        let r = axis
            .checked_sub(rank - rhs.len())
            .map(|index| rhs[index])
            .unwrap_or(1);
        out[axis] = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
    }
    Some(out)
}

/// Returns true when `input` can be broadcast to `output` without changing `output`.
pub fn broadcasts_to(input: &[usize], output: &[usize]) -> bool {
    if input.len() > output.len() {
        return false;
    }
    let rank_diff = output.len() - input.len();
    input
        .iter()
        .enumerate()
        .all(|(axis, &dim)| dim == 1 || dim == output[rank_diff + axis])
}

/// Axes of `output` that a broadcast from `input` expanded, in ascending order.
///
/// Summing the broadcast result over these axes (keeping dims) and reshaping to `input`
/// undoes the expansion.
pub fn expanded_axes(input: &[usize], output: &[usize]) -> Vec<usize> {
    let rank_diff = output.len().saturating_sub(input.len());
    (0..output.len())
        .filter(|&axis| {
            axis < rank_diff || (input[axis - rank_diff] == 1 && output[axis] != 1)
        })
        .collect()
}

pub fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0usize; perm.len()];
    for (axis, &source) in perm.iter().enumerate() {
        inverse[source] = axis;
    }
    inverse
}

pub fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &axis in perm {
        if axis >= perm.len() || seen[axis] {
            return false;
        }
        seen[axis] = true;
    }
    true
}

/// Spatial output extent of a sliding window; `None` when the window does not fit.
pub fn window_output_extent(
    input: usize,
    window: usize,
    stride: usize,
    pad_low: usize,
    pad_high: usize,
) -> Option<usize> {
    if window == 0 || stride == 0 {
        return None;
    }
    let padded = input.checked_add(pad_low)?.checked_add(pad_high)?;
    if padded < window {
        return None;
    }
    Some((padded - window) / stride + 1)
}

/// Row-major contiguous strides.
pub fn contiguous_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; dims.len()];
    let mut stride = 1usize;
    for axis in (0..dims.len()).rev() {
        strides[axis] = stride;
        stride *= dims[axis];
    }
    strides
}
