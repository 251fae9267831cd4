use anyhow::{ensure, Result};

use super::activation::log_softmax;
use super::common::shape_error;
use super::elementwise::{mul, mul_scalar, square, sub};
use super::reduce::{mean, sum};
use crate::graph::Node;

/// Mean squared error, shape `[1]`.
pub fn mse_loss(prediction: &Node, target: &Node) -> Result<Node> {
    let p = prediction.shape();
    let t = target.shape();
    ensure!(
        p == t,
        shape_error("mse_loss", format!("prediction {p} and target {t} differ"))
    );
    let diff = sub(prediction, target)?;
    mean(&square(&diff)?)
}

/// Cross entropy between `[batch, classes]` logits and one-hot (or soft) labels, averaged over
/// the batch. Shape `[1]`.
pub fn cross_entropy_with_logits(logits: &Node, labels: &Node) -> Result<Node> {
    let l = logits.shape();
    let y = labels.shape();
    ensure!(
        l.rank() == 2 && l == y,
        shape_error(
            "cross_entropy_with_logits",
            format!("expects matching [batch, classes] logits and labels, got {l} and {y}")
        )
    );
    let log_probs = log_softmax(logits, 1)?;
    let picked = sum(&mul(labels, &log_probs)?)?;
    mul_scalar(&picked, -1.0 / l.dims()[0] as f32)
}
