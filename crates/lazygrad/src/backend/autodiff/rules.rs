//! Local derivative rules, one arm per operation.

use crate::backend::emit::reduced_dims;
use crate::backend::shape_helpers::{expanded_axes, inverse_permutation};
use crate::backend::spec::{
    ComparisonOp, DotGeneralSpec, ElementwiseBinaryOp, ElementwiseUnaryOp, Instruction,
    Operation, ReduceKind, ReduceSpec, Shape, ValueId,
};

use super::{AutodiffError, GradientBuilder};

pub(super) fn apply_rule(
    g: &mut GradientBuilder<'_>,
    instruction: &Instruction,
    upstream: ValueId,
) -> Result<(), AutodiffError> {
    let out = instruction.id;
    match &instruction.op {
        Operation::Constant(_)
        | Operation::Iota(_)
        | Operation::Compare(_)
        | Operation::StopGradient => Ok(()),
        Operation::ElementwiseUnary(op) => {
            let x = operand(instruction, 0)?;
            unary_rule(g, *op, x, out, upstream)
        }
        Operation::ElementwiseBinary(op) => {
            let lhs = operand(instruction, 0)?;
            let rhs = operand(instruction, 1)?;
            binary_rule(g, *op, lhs, rhs, out, upstream)
        }
        Operation::BroadcastTo(_) => {
            let x = operand(instruction, 0)?;
            if !g.needs(x) {
                return Ok(());
            }
            let target = g.shape(x)?;
            let reduced = unbroadcast(g, upstream, &target)?;
            g.add_grad(x, reduced)
        }
        Operation::Reshape(_) => {
            let x = operand(instruction, 0)?;
            if !g.needs(x) {
                return Ok(());
            }
            let target = g.shape(x)?;
            let grad = g.builder.reshape(upstream, &target)?;
            g.add_grad(x, grad)
        }
        Operation::Transpose(spec) => {
            let x = operand(instruction, 0)?;
            if !g.needs(x) {
                return Ok(());
            }
            let grad = g
                .builder
                .transpose(upstream, &inverse_permutation(&spec.perm))?;
            g.add_grad(x, grad)
        }
        Operation::Reduce(spec) => {
            let x = operand(instruction, 0)?;
            reduce_rule(g, spec, x, out, upstream)
        }
        Operation::DotGeneral(spec) => {
            let lhs = operand(instruction, 0)?;
            let rhs = operand(instruction, 1)?;
            dot_rule(g, spec, lhs, rhs, upstream)
        }
        Operation::Slice(spec) => {
            let x = operand(instruction, 0)?;
            if !g.needs(x) {
                return Ok(());
            }
            let dims = g.shape(x)?.into_dims();
            let high: Vec<usize> = dims
                .iter()
                .zip(spec.starts.iter().zip(&spec.sizes))
                .map(|(&dim, (&start, &size))| dim - start - size)
                .collect();
            let grad = g.builder.pad(upstream, &spec.starts, &high, 0.0)?;
            g.add_grad(x, grad)
        }
        Operation::Pad(spec) => {
            let x = operand(instruction, 0)?;
            if !g.needs(x) {
                return Ok(());
            }
            let dims = g.shape(x)?.into_dims();
            let grad = g.builder.slice(upstream, &spec.low, &dims)?;
            g.add_grad(x, grad)
        }
        Operation::Concat(spec) => {
            let mut offset = 0usize;
            for &input in &instruction.operands {
                let dims = g.shape(input)?.into_dims();
                if g.needs(input) {
                    let mut starts = vec![0usize; dims.len()];
                    starts[spec.axis] = offset;
                    let grad = g.builder.slice(upstream, &starts, &dims)?;
                    g.add_grad(input, grad)?;
                }
                offset += dims[spec.axis];
            }
            Ok(())
        }
        Operation::ExtractPatches(spec) => {
            let x = operand(instruction, 0)?;
            if !g.needs(x) {
                return Ok(());
            }
            let target = g.shape(x)?;
            let grad = g.builder.fold_patches(upstream, spec.clone(), &target)?;
            g.add_grad(x, grad)
        }
        Operation::FoldPatches(spec) => {
            let x = operand(instruction, 0)?;
            if !g.needs(x) {
                return Ok(());
            }
            let grad = g.builder.extract_patches(upstream, spec.clone())?;
            g.add_grad(x, grad)
        }
    }
}

fn operand(instruction: &Instruction, index: usize) -> Result<ValueId, AutodiffError> {
    instruction
        .operands
        .get(index)
        .copied()
        .ok_or_else(|| AutodiffError::Unsupported {
            op: instruction.op.name(),
            reason: format!("instruction {} lacks operand #{index}", instruction.id),
        })
}

fn unary_rule(
    g: &mut GradientBuilder<'_>,
    op: ElementwiseUnaryOp,
    x: ValueId,
    out: ValueId,
    up: ValueId,
) -> Result<(), AutodiffError> {
    if !g.needs(x) {
        return Ok(());
    }
    let shape = g.shape(x)?;
    let b = &mut *g.builder;
    let grad = match op {
        ElementwiseUnaryOp::Neg => b.neg(up)?,
        ElementwiseUnaryOp::Abs => {
            let zero = b.splat(0.0, &shape)?;
            let positive = b.compare(ComparisonOp::Greater, x, zero)?;
            let negative = b.compare(ComparisonOp::Less, x, zero)?;
            let sign = b.sub(positive, negative)?;
            b.mul(up, sign)?
        }
        ElementwiseUnaryOp::Exp => b.mul(up, out)?,
        ElementwiseUnaryOp::Log => b.div(up, x)?,
        ElementwiseUnaryOp::Tanh => {
            let one = b.splat(1.0, &shape)?;
            let squared = b.mul(out, out)?;
            let slope = b.sub(one, squared)?;
            b.mul(up, slope)?
        }
        ElementwiseUnaryOp::Sqrt => {
            let two = b.splat(2.0, &shape)?;
            let denom = b.mul(out, two)?;
            b.div(up, denom)?
        }
        ElementwiseUnaryOp::Reciprocal => {
            let squared = b.mul(out, out)?;
            let scaled = b.mul(up, squared)?;
            b.neg(scaled)?
        }
    };
    g.add_grad(x, grad)
}

fn binary_rule(
    g: &mut GradientBuilder<'_>,
    op: ElementwiseBinaryOp,
    lhs: ValueId,
    rhs: ValueId,
    out: ValueId,
    up: ValueId,
) -> Result<(), AutodiffError> {
    let (need_lhs, need_rhs) = (g.needs(lhs), g.needs(rhs));
    match op {
        ElementwiseBinaryOp::Add => {
            if need_lhs {
                g.add_grad(lhs, up)?;
            }
            if need_rhs {
                g.add_grad(rhs, up)?;
            }
        }
        ElementwiseBinaryOp::Sub => {
            if need_lhs {
                g.add_grad(lhs, up)?;
            }
            if need_rhs {
                let grad = g.builder.neg(up)?;
                g.add_grad(rhs, grad)?;
            }
        }
        ElementwiseBinaryOp::Mul => {
            if need_lhs {
                let grad = g.builder.mul(up, rhs)?;
                g.add_grad(lhs, grad)?;
            }
            if need_rhs {
                let grad = g.builder.mul(up, lhs)?;
                g.add_grad(rhs, grad)?;
            }
        }
        ElementwiseBinaryOp::Div => {
            if need_lhs {
                let grad = g.builder.div(up, rhs)?;
                g.add_grad(lhs, grad)?;
            }
            if need_rhs {
                let ratio = g.builder.div(out, rhs)?;
                let scaled = g.builder.mul(up, ratio)?;
                let grad = g.builder.neg(scaled)?;
                g.add_grad(rhs, grad)?;
            }
        }
        ElementwiseBinaryOp::Maximum | ElementwiseBinaryOp::Minimum => {
            // Ties route the whole gradient to the left operand.
            let cmp = if op == ElementwiseBinaryOp::Maximum {
                ComparisonOp::GreaterEqual
            } else {
                ComparisonOp::LessEqual
            };
            let mask = g.builder.compare(cmp, lhs, rhs)?;
            if need_lhs {
                let grad = g.builder.mul(up, mask)?;
                g.add_grad(lhs, grad)?;
            }
            if need_rhs {
                let shape = g.shape(rhs)?;
                let one = g.builder.splat(1.0, &shape)?;
                let inverse = g.builder.sub(one, mask)?;
                let grad = g.builder.mul(up, inverse)?;
                g.add_grad(rhs, grad)?;
            }
        }
    }
    Ok(())
}

/// Sums `grad` over the axes a broadcast to its shape expanded, then reshapes to `target`.
fn unbroadcast(
    g: &mut GradientBuilder<'_>,
    grad: ValueId,
    target: &Shape,
) -> Result<ValueId, AutodiffError> {
    let grad_dims = g.shape(grad)?.into_dims();
    let axes = expanded_axes(target.dims(), &grad_dims);
    let summed = g.builder.reduce(ReduceKind::Sum, grad, &axes, true)?;
    Ok(g.builder.reshape(summed, target)?)
}

fn reduce_rule(
    g: &mut GradientBuilder<'_>,
    spec: &ReduceSpec,
    x: ValueId,
    out: ValueId,
    up: ValueId,
) -> Result<(), AutodiffError> {
    if !g.needs(x) {
        return Ok(());
    }
    let x_shape = g.shape(x)?;
    let kept = Shape::new(reduced_dims(x_shape.dims(), &spec.axes, true));
    let b = &mut *g.builder;
    let up_kept = b.reshape(up, &kept)?;
    let spread = b.broadcast_to(up_kept, &x_shape)?;
    let grad = match spec.kind {
        ReduceKind::Sum => spread,
        ReduceKind::Max | ReduceKind::Min => {
            // Every element equal to the extremum receives the upstream gradient.
            let out_kept = b.reshape(out, &kept)?;
            let extremum = b.broadcast_to(out_kept, &x_shape)?;
            let mask = b.compare(ComparisonOp::Equal, x, extremum)?;
            b.mul(spread, mask)?
        }
    };
    g.add_grad(x, grad)
}

fn free_axes(rank: usize, batch: &[usize], contract: &[usize]) -> Vec<usize> {
    (0..rank)
        .filter(|axis| !batch.contains(axis) && !contract.contains(axis))
        .collect()
}

/// Permutation that reorders a result whose axis `p` came from target axis `sources[p]`.
fn restore_permutation(sources: &[usize]) -> Vec<usize> {
    let mut perm = vec![0usize; sources.len()];
    for (position, &axis) in sources.iter().enumerate() {
        perm[axis] = position;
    }
    perm
}

fn dot_rule(
    g: &mut GradientBuilder<'_>,
    spec: &DotGeneralSpec,
    lhs: ValueId,
    rhs: ValueId,
    up: ValueId,
) -> Result<(), AutodiffError> {
    let lhs_rank = g.shape(lhs)?.rank();
    let rhs_rank = g.shape(rhs)?.rank();
    let up_rank = g.shape(up)?.rank();
    let lhs_free = free_axes(lhs_rank, &spec.batch_lhs, &spec.contract_lhs);
    let rhs_free = free_axes(rhs_rank, &spec.batch_rhs, &spec.contract_rhs);
    let batch = spec.batch_lhs.len();
    if batch + lhs_free.len() + rhs_free.len() != up_rank {
        return Err(AutodiffError::Unsupported {
            op: "dot_general",
            reason: "full contractions to a single value are not differentiable".to_string(),
        });
    }
    let up_batch: Vec<usize> = (0..batch).collect();
    let up_lhs_free: Vec<usize> = (batch..batch + lhs_free.len()).collect();
    let up_rhs_free: Vec<usize> = (batch + lhs_free.len()..up_rank).collect();

    if g.needs(lhs) {
        // d(lhs) = up . rhs over the rhs free axes; result is [batch, lhs free, rhs contract].
        let grad = g.builder.dot_general(
            up,
            rhs,
            DotGeneralSpec {
                batch_lhs: up_batch.clone(),
                batch_rhs: spec.batch_rhs.clone(),
                contract_lhs: up_rhs_free.clone(),
                contract_rhs: rhs_free.clone(),
            },
        )?;
        let mut sources = spec.batch_lhs.clone();
        sources.extend(&lhs_free);
        sources.extend(remaining_in_order(rhs_rank, &spec.batch_rhs, &rhs_free).map(|axis| {
            let k = position_of(&spec.contract_rhs, axis);
            spec.contract_lhs[k]
        }));
        let grad = g.builder.transpose(grad, &restore_permutation(&sources))?;
        g.add_grad(lhs, grad)?;
    }

    if g.needs(rhs) {
        // d(rhs) = lhs . up over the lhs free axes; result is [batch, lhs contract, rhs free].
        let grad = g.builder.dot_general(
            lhs,
            up,
            DotGeneralSpec {
                batch_lhs: spec.batch_lhs.clone(),
                batch_rhs: up_batch,
                contract_lhs: lhs_free.clone(),
                contract_rhs: up_lhs_free,
            },
        )?;
        let mut sources = spec.batch_rhs.clone();
        sources.extend(remaining_in_order(lhs_rank, &spec.batch_lhs, &lhs_free).map(|axis| {
            let k = position_of(&spec.contract_lhs, axis);
            spec.contract_rhs[k]
        }));
        sources.extend(&rhs_free);
        let grad = g.builder.transpose(grad, &restore_permutation(&sources))?;
        g.add_grad(rhs, grad)?;
    }
    Ok(())
}

/// Axes of a rank-`rank` operand that are neither batch nor in `used`, ascending.
fn remaining_in_order<'a>(
    rank: usize,
    batch: &'a [usize],
    used: &'a [usize],
) -> impl Iterator<Item = usize> + 'a {
    (0..rank).filter(move |axis| !batch.contains(axis) && !used.contains(axis))
}

fn position_of(axes: &[usize], axis: usize) -> usize {
    axes.iter().position(|&a| a == axis).unwrap_or(0)
}
