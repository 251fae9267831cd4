use anyhow::{ensure, Result};

use crate::graph::{Node, OpKind};

use super::common::{record, shape_error};

/// Matrix product over the last axis of `lhs` and the first matrix axis of `rhs`.
///
/// Supports `[m, k] x [k, n]`, batched `[b, m, k] x [b, k, n]`, and a shared right-hand matrix
/// `[b, m, k] x [k, n]`.
pub fn matmul(lhs: &Node, rhs: &Node) -> Result<Node> {
    let a = lhs.shape().into_dims();
    let b = rhs.shape().into_dims();
    let out = match (a.as_slice(), b.as_slice()) {
        (&[m, k], &[k2, n]) => {
            ensure!(k == k2, shape_error("matmul", format!("inner dims differ: {a:?} x {b:?}")));
            vec![m, n]
        }
        (&[batch, m, k], &[batch2, k2, n]) => {
            ensure!(
                batch == batch2 && k == k2,
                shape_error("matmul", format!("batched shapes disagree: {a:?} x {b:?}"))
            );
            vec![batch, m, n]
        }
        (&[batch, m, k], &[k2, n]) => {
            ensure!(k == k2, shape_error("matmul", format!("inner dims differ: {a:?} x {b:?}")));
            vec![batch, m, n]
        }
        _ => {
            return Err(shape_error(
                "matmul",
                format!("unsupported operand ranks {} and {}", a.len(), b.len()),
            )
            .into())
        }
    };
    record(OpKind::MatMul, &[lhs, rhs], out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphArena;

    #[test]
    fn output_shapes_per_layout() {
        let arena = GraphArena::new();
        let a = arena.zeros(&[2, 3]).unwrap();
        let b = arena.zeros(&[3, 4]).unwrap();
        assert_eq!(matmul(&a, &b).unwrap().shape().dims(), &[2, 4]);

        let x = arena.zeros(&[5, 2, 3]).unwrap();
        let y = arena.zeros(&[5, 3, 4]).unwrap();
        assert_eq!(matmul(&x, &y).unwrap().shape().dims(), &[5, 2, 4]);
        assert_eq!(matmul(&x, &b).unwrap().shape().dims(), &[5, 2, 4]);

        assert!(matmul(&a, &a).is_err());
        assert!(matmul(&b, &x).is_err());
    }
}
