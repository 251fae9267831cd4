//! Operator descriptors and their lowering into program instructions.
//!
//! Every frontend operator is one [`OpKind`] variant; [`lower`] is the dispatch table that
//! turns a node's operator plus its parents' values into instructions. Composite operators
//! (softmax, convolution, pooling, one-hot) expand into several primitive instructions here.

use crate::backend::spec::{
    BackendError, BackendResult, ComparisonOp, DotGeneralSpec, ElementwiseBinaryOp,
    ElementwiseUnaryOp, ExtractPatchesSpec, ProgramBuilder, ReduceKind, Shape, SpecErrorCode,
    ValueId,
};

/// Unary operators exposed by the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryKind {
    Neg,
    Abs,
    Exp,
    Log,
    Tanh,
    Sqrt,
    Reciprocal,
    Square,
    Relu,
    Sigmoid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Max,
    Avg,
}

/// Operator attached to an internal node.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Elementwise binary op with numpy-style broadcasting to the node shape.
    Binary(ElementwiseBinaryOp),
    /// `x op value`, or `value op x` when `reversed`.
    Scalar {
        op: ElementwiseBinaryOp,
        value: f32,
        reversed: bool,
    },
    Unary(UnaryKind),
    /// Broadcasting comparison producing a 0/1 mask.
    Compare(ComparisonOp),
    Reduce {
        op: ReduceOp,
        axes: Vec<usize>,
        keepdims: bool,
    },
    /// 2-D, batched 3-D, or 3-D by shared 2-D matrix product.
    MatMul,
    Reshape,
    Transpose {
        perm: Vec<usize>,
    },
    BroadcastTo,
    Slice {
        starts: Vec<usize>,
    },
    Concat {
        axis: usize,
    },
    /// NHWC input, `[kh, kw, cin, cout]` kernel.
    Conv2d {
        strides: [usize; 2],
        padding: [usize; 2],
    },
    Pool2d {
        kind: PoolKind,
        window: [usize; 2],
        strides: [usize; 2],
    },
    OneHot {
        depth: usize,
    },
    Softmax {
        axis: usize,
    },
    LogSoftmax {
        axis: usize,
    },
    StopGradient,
}

/// Expected parent count for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }

    pub fn minimum(self) -> usize {
        match self {
            Arity::Exact(n) | Arity::AtLeast(n) => n,
        }
    }
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Binary(_) => "binary",
            OpKind::Scalar { .. } => "scalar",
            OpKind::Unary(_) => "unary",
            OpKind::Compare(_) => "compare",
            OpKind::Reduce { .. } => "reduce",
            OpKind::MatMul => "matmul",
            OpKind::Reshape => "reshape",
            OpKind::Transpose { .. } => "transpose",
            OpKind::BroadcastTo => "broadcast_to",
            OpKind::Slice { .. } => "slice",
            OpKind::Concat { .. } => "concat",
            OpKind::Conv2d { .. } => "conv2d",
            OpKind::Pool2d { .. } => "pool2d",
            OpKind::OneHot { .. } => "one_hot",
            OpKind::Softmax { .. } => "softmax",
            OpKind::LogSoftmax { .. } => "log_softmax",
            OpKind::StopGradient => "stop_gradient",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            OpKind::Binary(_) | OpKind::Compare(_) | OpKind::MatMul | OpKind::Conv2d { .. } => {
                Arity::Exact(2)
            }
            OpKind::Concat { .. } => Arity::AtLeast(1),
            _ => Arity::Exact(1),
        }
    }
}

fn invalid(detail: String) -> BackendError {
    BackendError::spec(SpecErrorCode::InvalidAttributeValue, detail)
}

fn shape_of(builder: &ProgramBuilder, id: ValueId) -> BackendResult<Shape> {
    builder
        .value_spec(id)
        .map(|spec| spec.shape.clone())
        .ok_or_else(|| BackendError::spec(SpecErrorCode::UnknownValue, format!("value {id} is undefined")))
}

/// Emits the instructions for one node. `operands` holds the parents' values in order and has
/// already been checked against [`OpKind::arity`]; `output` is the node shape.
pub(crate) fn lower(
    builder: &mut ProgramBuilder,
    op: &OpKind,
    operands: &[ValueId],
    output: &Shape,
) -> BackendResult<ValueId> {
    let value = match op {
        OpKind::Binary(kind) => {
            let lhs = builder.broadcast_to(operands[0], output)?;
            let rhs = builder.broadcast_to(operands[1], output)?;
            builder.binary(*kind, lhs, rhs)?
        }
        OpKind::Scalar {
            op,
            value,
            reversed,
        } => {
            let x = operands[0];
            let shape = shape_of(builder, x)?;
            let scalar = builder.splat(*value, &shape)?;
            if *reversed {
                builder.binary(*op, scalar, x)?
            } else {
                builder.binary(*op, x, scalar)?
            }
        }
        OpKind::Unary(kind) => lower_unary(builder, *kind, operands[0])?,
        OpKind::Compare(cmp) => {
            let lhs = builder.broadcast_to(operands[0], output)?;
            let rhs = builder.broadcast_to(operands[1], output)?;
            builder.compare(*cmp, lhs, rhs)?
        }
        OpKind::Reduce { op, axes, keepdims } => {
            lower_reduce(builder, *op, operands[0], axes, *keepdims)?
        }
        OpKind::MatMul => lower_matmul(builder, operands[0], operands[1])?,
        OpKind::Reshape => builder.reshape(operands[0], output)?,
        OpKind::Transpose { perm } => builder.transpose(operands[0], perm)?,
        OpKind::BroadcastTo => builder.broadcast_to(operands[0], output)?,
        OpKind::Slice { starts } => builder.slice(operands[0], starts, output.dims())?,
        OpKind::Concat { axis } => builder.concat(operands, *axis)?,
        OpKind::Conv2d { strides, padding } => {
            lower_conv2d(builder, operands[0], operands[1], *strides, *padding)?
        }
        OpKind::Pool2d {
            kind,
            window,
            strides,
        } => lower_pool2d(builder, *kind, operands[0], *window, *strides)?,
        OpKind::OneHot { depth } => lower_one_hot(builder, operands[0], *depth, output)?,
        OpKind::Softmax { axis } => lower_softmax(builder, operands[0], *axis, false)?,
        OpKind::LogSoftmax { axis } => lower_softmax(builder, operands[0], *axis, true)?,
        OpKind::StopGradient => builder.stop_gradient(operands[0])?,
    };

    let produced = shape_of(builder, value)?;
    if &produced != output {
        return Err(BackendError::spec(
            SpecErrorCode::ShapeMismatch,
            format!("{} produced {produced} but the node declares {output}", op.name()),
        ));
    }
    Ok(value)
}

fn lower_unary(
    builder: &mut ProgramBuilder,
    kind: UnaryKind,
    x: ValueId,
) -> BackendResult<ValueId> {
    let primitive = match kind {
        UnaryKind::Neg => ElementwiseUnaryOp::Neg,
        UnaryKind::Abs => ElementwiseUnaryOp::Abs,
        UnaryKind::Exp => ElementwiseUnaryOp::Exp,
        UnaryKind::Log => ElementwiseUnaryOp::Log,
        UnaryKind::Tanh => ElementwiseUnaryOp::Tanh,
        UnaryKind::Sqrt => ElementwiseUnaryOp::Sqrt,
        UnaryKind::Reciprocal => ElementwiseUnaryOp::Reciprocal,
        UnaryKind::Square => return builder.mul(x, x),
        UnaryKind::Relu => {
            let shape = shape_of(builder, x)?;
            let zero = builder.splat(0.0, &shape)?;
            return builder.binary(ElementwiseBinaryOp::Maximum, x, zero);
        }
        UnaryKind::Sigmoid => {
            // 1 / (1 + exp(-x))
            let shape = shape_of(builder, x)?;
            let negated = builder.neg(x)?;
            let exp = builder.unary(ElementwiseUnaryOp::Exp, negated)?;
            let one = builder.splat(1.0, &shape)?;
            let denom = builder.add(one, exp)?;
            return builder.unary(ElementwiseUnaryOp::Reciprocal, denom);
        }
    };
    builder.unary(primitive, x)
}

fn lower_reduce(
    builder: &mut ProgramBuilder,
    op: ReduceOp,
    x: ValueId,
    axes: &[usize],
    keepdims: bool,
) -> BackendResult<ValueId> {
    let kind = match op {
        ReduceOp::Sum | ReduceOp::Mean => ReduceKind::Sum,
        ReduceOp::Max => ReduceKind::Max,
        ReduceOp::Min => ReduceKind::Min,
    };
    let reduced = builder.reduce(kind, x, axes, keepdims)?;
    if op != ReduceOp::Mean {
        return Ok(reduced);
    }
    let dims = shape_of(builder, x)?.into_dims();
    let count: usize = axes.iter().map(|&axis| dims[axis]).product();
    let out_shape = shape_of(builder, reduced)?;
    let scale = builder.splat(1.0 / count as f32, &out_shape)?;
    builder.mul(reduced, scale)
}

fn lower_matmul(
    builder: &mut ProgramBuilder,
    lhs: ValueId,
    rhs: ValueId,
) -> BackendResult<ValueId> {
    let lhs_rank = shape_of(builder, lhs)?.rank();
    let rhs_rank = shape_of(builder, rhs)?.rank();
    let spec = match (lhs_rank, rhs_rank) {
        (2, 2) | (3, 2) => DotGeneralSpec {
            batch_lhs: vec![],
            batch_rhs: vec![],
            contract_lhs: vec![lhs_rank - 1],
            contract_rhs: vec![0],
        },
        (3, 3) => DotGeneralSpec {
            batch_lhs: vec![0],
            batch_rhs: vec![0],
            contract_lhs: vec![2],
            contract_rhs: vec![1],
        },
        _ => {
            return Err(invalid(format!(
                "matmul does not support ranks {lhs_rank} and {rhs_rank}"
            )))
        }
    };
    builder.dot_general(lhs, rhs, spec)
}

fn lower_conv2d(
    builder: &mut ProgramBuilder,
    input: ValueId,
    kernel: ValueId,
    strides: [usize; 2],
    padding: [usize; 2],
) -> BackendResult<ValueId> {
    let k = shape_of(builder, kernel)?.into_dims();
    if k.len() != 4 {
        return Err(invalid(format!("conv2d kernel must be rank 4, got rank {}", k.len())));
    }
    let (kh, kw, cin, cout) = (k[0], k[1], k[2], k[3]);
    let patches = builder.extract_patches(
        input,
        ExtractPatchesSpec {
            window: vec![kh, kw],
            strides: strides.to_vec(),
            padding: vec![(padding[0], padding[0]), (padding[1], padding[1])],
            pad_value: 0.0,
        },
    )?;
    // Patch layout is (kh, kw, c), matching the row-major flattening of the kernel.
    let matrix = builder.reshape(kernel, &Shape::new([kh * kw * cin, cout]))?;
    builder.dot_general(
        patches,
        matrix,
        DotGeneralSpec {
            batch_lhs: vec![],
            batch_rhs: vec![],
            contract_lhs: vec![3],
            contract_rhs: vec![0],
        },
    )
}

fn lower_pool2d(
    builder: &mut ProgramBuilder,
    kind: PoolKind,
    input: ValueId,
    window: [usize; 2],
    strides: [usize; 2],
) -> BackendResult<ValueId> {
    let channels = shape_of(builder, input)?
        .dims()
        .last()
        .copied()
        .unwrap_or(1);
    let patches = builder.extract_patches(
        input,
        ExtractPatchesSpec {
            window: window.to_vec(),
            strides: strides.to_vec(),
            padding: vec![(0, 0), (0, 0)],
            pad_value: 0.0,
        },
    )?;
    let p = shape_of(builder, patches)?.into_dims();
    let taps = window[0] * window[1];
    let grouped = builder.reshape(patches, &Shape::new([p[0], p[1], p[2], taps, channels]))?;
    match kind {
        PoolKind::Max => builder.reduce(ReduceKind::Max, grouped, &[3], false),
        PoolKind::Avg => {
            let summed = builder.reduce(ReduceKind::Sum, grouped, &[3], false)?;
            let shape = shape_of(builder, summed)?;
            let scale = builder.splat(1.0 / taps as f32, &shape)?;
            builder.mul(summed, scale)
        }
    }
}

fn lower_one_hot(
    builder: &mut ProgramBuilder,
    indices: ValueId,
    depth: usize,
    output: &Shape,
) -> BackendResult<ValueId> {
    let mut widened = shape_of(builder, indices)?.into_dims();
    widened.push(1);
    let column = builder.reshape(indices, &Shape::new(widened))?;
    let spread = builder.broadcast_to(column, output)?;
    let classes = builder.iota(output.clone(), output.rank() - 1)?;
    debug_assert_eq!(output.dims().last(), Some(&depth));
    builder.compare(ComparisonOp::Equal, spread, classes)
}

/// Numerically stable softmax: the row maximum is subtracted under a stop-gradient.
fn lower_softmax(
    builder: &mut ProgramBuilder,
    x: ValueId,
    axis: usize,
    log: bool,
) -> BackendResult<ValueId> {
    let shape = shape_of(builder, x)?;
    let max = builder.reduce(ReduceKind::Max, x, &[axis], true)?;
    let max = builder.stop_gradient(max)?;
    let max = builder.broadcast_to(max, &shape)?;
    let shifted = builder.sub(x, max)?;
    let exp = builder.unary(ElementwiseUnaryOp::Exp, shifted)?;
    let total = builder.reduce(ReduceKind::Sum, exp, &[axis], true)?;
    if log {
        let log_total = builder.unary(ElementwiseUnaryOp::Log, total)?;
        let log_total = builder.broadcast_to(log_total, &shape)?;
        builder.sub(shifted, log_total)
    } else {
        let total = builder.broadcast_to(total, &shape)?;
        builder.div(exp, total)
    }
}
