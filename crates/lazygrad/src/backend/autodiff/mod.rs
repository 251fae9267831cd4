//! Reverse-mode differentiation as a program-to-program transform.
//!
//! The transform appends gradient instructions to the same [`ProgramBuilder`] that holds the
//! forward computation, so forward and gradient values execute in one submission. Only values
//! that depend on a requested `wrt` value receive gradients; everything else is skipped.

mod rules;

use std::collections::{HashMap, HashSet};

use log::trace;
use thiserror::Error;

use crate::backend::spec::{
    BackendError, Instruction, Operation, ProgramBuilder, Shape, SpecErrorCode, ValueId,
};

#[derive(Debug, Error)]
pub enum AutodiffError {
    #[error("value {0} is not defined in the program")]
    UnknownValue(ValueId),
    #[error("no gradient rule for {op}: {reason}")]
    Unsupported { op: &'static str, reason: String },
    #[error(transparent)]
    Emit(#[from] BackendError),
}

impl From<AutodiffError> for BackendError {
    fn from(err: AutodiffError) -> Self {
        match err {
            AutodiffError::UnknownValue(id) => BackendError::spec(
                SpecErrorCode::UnknownValue,
                format!("gradient requested for undefined value {id}"),
            ),
            AutodiffError::Unsupported { op, reason } => BackendError::unimplemented(op, reason),
            AutodiffError::Emit(inner) => inner,
        }
    }
}

/// Emits `d(of)/d(w)` for each `w` in `wrt` and returns the gradient value ids.
///
/// Values in `wrt` that `of` does not depend on are absent from the result. The seed gradient
/// is a tensor of ones shaped like `of`, so a non-scalar `of` yields the gradient of its sum.
pub fn reverse_mode(
    builder: &mut ProgramBuilder,
    of: ValueId,
    wrt: &[ValueId],
) -> Result<HashMap<ValueId, ValueId>, AutodiffError> {
    let of_shape = builder
        .value_spec(of)
        .map(|spec| spec.shape.clone())
        .ok_or(AutodiffError::UnknownValue(of))?;
    for &id in wrt {
        if builder.value_spec(id).is_none() {
            return Err(AutodiffError::UnknownValue(id));
        }
    }

    let primal: Vec<Instruction> = builder.instructions().to_vec();
    let active = active_values(&primal, wrt);
    if !active.contains(&of) {
        return Ok(HashMap::new());
    }

    let before = primal.len();
    let mut engine = GradientBuilder {
        builder,
        grads: HashMap::new(),
        active,
    };
    engine.seed(of, &of_shape)?;

    for instruction in primal.iter().rev() {
        let Some(&upstream) = engine.grads.get(&instruction.id) else {
            continue;
        };
        rules::apply_rule(&mut engine, instruction, upstream)?;
    }

    trace!(
        "reverse mode emitted {} gradient instructions for {} targets",
        engine.builder.instructions().len() - before,
        wrt.len()
    );

    Ok(wrt
        .iter()
        .filter_map(|id| engine.grads.get(id).map(|grad| (*id, *grad)))
        .collect())
}

/// Values that transitively depend on `wrt` through differentiable operations.
fn active_values(primal: &[Instruction], wrt: &[ValueId]) -> HashSet<ValueId> {
    let mut active: HashSet<ValueId> = wrt.iter().copied().collect();
    for instruction in primal {
        if !differentiable(&instruction.op) {
            continue;
        }
        if instruction.operands.iter().any(|id| active.contains(id)) {
            active.insert(instruction.id);
        }
    }
    active
}

fn differentiable(op: &Operation) -> bool {
    !matches!(
        op,
        Operation::Constant(_) | Operation::Iota(_) | Operation::Compare(_) | Operation::StopGradient
    )
}

pub(crate) struct GradientBuilder<'a> {
    builder: &'a mut ProgramBuilder,
    grads: HashMap<ValueId, ValueId>,
    active: HashSet<ValueId>,
}

impl GradientBuilder<'_> {
    fn seed(&mut self, output: ValueId, shape: &Shape) -> Result<(), AutodiffError> {
        let ones = self.builder.splat(1.0, shape)?;
        self.grads.insert(output, ones);
        Ok(())
    }

    /// True when `id` should receive a gradient contribution.
    fn needs(&self, id: ValueId) -> bool {
        self.active.contains(&id)
    }

    fn shape(&self, id: ValueId) -> Result<Shape, AutodiffError> {
        self.builder
            .value_spec(id)
            .map(|spec| spec.shape.clone())
            .ok_or(AutodiffError::UnknownValue(id))
    }

    fn add_grad(&mut self, target: ValueId, contribution: ValueId) -> Result<(), AutodiffError> {
        if !self.needs(target) {
            return Ok(());
        }
        let summed = match self.grads.get(&target).copied() {
            None => contribution,
            Some(existing) => self.builder.add(existing, contribution)?,
        };
        self.grads.insert(target, summed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{ElementwiseUnaryOp, ReduceKind, TensorSpec};

    fn param(builder: &mut ProgramBuilder, dims: &[usize]) -> ValueId {
        builder.add_parameter(TensorSpec::new(Shape::new(dims.to_vec())))
    }

    #[test]
    fn independent_targets_are_omitted() {
        let mut b = ProgramBuilder::new();
        let x = param(&mut b, &[3]);
        let unused = param(&mut b, &[3]);
        let y = b.unary(ElementwiseUnaryOp::Exp, x).unwrap();
        let loss = b.reduce(ReduceKind::Sum, y, &[0], false).unwrap();

        let grads = reverse_mode(&mut b, loss, &[x, unused]).unwrap();
        assert!(grads.contains_key(&x));
        assert!(!grads.contains_key(&unused));
        let gx = grads[&x];
        assert_eq!(b.value_spec(gx).unwrap().shape.dims(), &[3]);
    }

    #[test]
    fn stop_gradient_blocks_propagation() {
        let mut b = ProgramBuilder::new();
        let x = param(&mut b, &[2]);
        let frozen = b.stop_gradient(x).unwrap();
        let loss = b.reduce(ReduceKind::Sum, frozen, &[0], false).unwrap();
        let grads = reverse_mode(&mut b, loss, &[x]).unwrap();
        assert!(grads.is_empty());
    }

    #[test]
    fn shared_operand_accumulates_contributions() {
        let mut b = ProgramBuilder::new();
        let x = param(&mut b, &[2]);
        let sq = b.mul(x, x).unwrap();
        let loss = b.reduce(ReduceKind::Sum, sq, &[0], false).unwrap();
        let before = b.instructions().len();
        let grads = reverse_mode(&mut b, loss, &[x]).unwrap();
        let gx = grads[&x];
        let last = b.instructions().last().unwrap();
        assert_eq!(last.id, gx);
        assert!(matches!(
            last.op,
            Operation::ElementwiseBinary(crate::backend::spec::ElementwiseBinaryOp::Add)
        ));
        assert!(b.instructions().len() > before);
    }

    #[test]
    fn unknown_values_are_rejected() {
        let mut b = ProgramBuilder::new();
        let x = param(&mut b, &[2]);
        assert!(matches!(
            reverse_mode(&mut b, ValueId(42), &[x]),
            Err(AutodiffError::UnknownValue(ValueId(42)))
        ));
        assert!(matches!(
            reverse_mode(&mut b, x, &[ValueId(9)]),
            Err(AutodiffError::UnknownValue(ValueId(9)))
        ));
    }
}
