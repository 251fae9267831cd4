use std::collections::HashMap;
use std::sync::Arc;

use lazygrad::backend::spec::{
    BackendError, BackendResult, BroadcastToSpec, CompareSpec, ComparisonOp, ConcatSpec,
    DotGeneralSpec, ElementwiseBinaryOp, ElementwiseUnaryOp, ExtractPatchesSpec, Instruction,
    IotaSpec, Operation, PadSpec, PortableBackend, Program, ReduceKind, ReduceSpec, SliceSpec,
    TensorLiteral, TensorSpec, TransposeSpec, ValueId,
};

/// Dense row-major f32 tensor.
#[derive(Debug, Clone)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: Arc<[f32]>,
}

impl CpuTensor {
    pub fn new(spec: TensorSpec, data: Vec<f32>) -> Self {
        CpuTensor {
            spec,
            data: Arc::from(data),
        }
    }

    pub fn dims(&self) -> &[usize] {
        self.spec.shape.dims()
    }
}

/// Hook that may take over an operation before the reference kernel runs.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        op: &Operation,
        inputs: &[CpuTensor],
        output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>>;
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _op: &Operation,
        _inputs: &[CpuTensor],
        _output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>> {
        None
    }
}

#[derive(Clone)]
pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuPortableBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor> PortableBackend for GenericCpuBackend<I> {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-portable"
    }

    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle> {
        literal_to_tensor(&literal)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        Ok(TensorLiteral::from_f32(tensor.spec.clone(), &tensor.data))
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Self::TensorHandle> {
        execute_operation(self.interceptor.as_ref(), instruction, inputs)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        let function = program
            .entry_function()
            .ok_or_else(|| BackendError::execution("entry function not found"))?;

        if function.parameter_ids.len() != entry_inputs.len() {
            return Err(BackendError::execution(format!(
                "entry expects {} inputs, got {}",
                function.parameter_ids.len(),
                entry_inputs.len()
            )));
        }

        let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
        for ((param_id, spec), handle) in function
            .parameter_ids
            .iter()
            .zip(&function.parameters)
            .zip(entry_inputs)
        {
            if handle.spec.shape != spec.shape {
                return Err(BackendError::execution(format!(
                    "input {param_id} has shape {} but the entry declares {}",
                    handle.spec.shape, spec.shape
                )));
            }
            values.insert(*param_id, handle.clone());
        }

        log::trace!(
            "cpu backend running `{}`: {} instructions",
            function.name,
            function.body.len()
        );

        for (instr_index, instruction) in function.body.iter().enumerate() {
            let mut inputs = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                let tensor = values.get(operand).cloned().ok_or_else(|| {
                    BackendError::execution(format!("operand value {operand} missing"))
                })?;
                inputs.push(tensor);
            }
            let output = execute_operation(self.interceptor.as_ref(), instruction, &inputs)
                .map_err(|err| {
                    augment_backend_error(err, &function.name, instr_index, instruction, &inputs)
                })?;
            values.insert(instruction.id, output);
        }

        let mut results = Vec::with_capacity(function.result_ids.len());
        for id in &function.result_ids {
            let value = values.get(id).cloned().ok_or_else(|| {
                BackendError::execution(format!("missing function result value {id}"))
            })?;
            results.push(value);
        }
        Ok(results)
    }
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let data = literal.to_f32_vec()?;
    Ok(CpuTensor::new(literal.spec.clone(), data))
}

fn execute_operation(
    interceptor: &dyn CpuKernelInterceptor,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendResult<CpuTensor> {
    let output = &instruction.output;
    if let Some(result) = interceptor.try_execute(&instruction.op, inputs, output) {
        return result;
    }

    let result = match &instruction.op {
        Operation::Constant(literal) => literal_to_tensor(literal)?,
        Operation::Iota(spec) => op_iota(output, spec)?,
        Operation::StopGradient => op_identity(inputs, output)?,
        Operation::Reshape(_) => op_identity(inputs, output)?,
        Operation::Slice(spec) => op_slice(inputs, output, spec)?,
        Operation::Pad(spec) => op_pad(inputs, output, spec)?,
        Operation::Transpose(spec) => op_transpose(inputs, output, spec)?,
        Operation::BroadcastTo(spec) => op_broadcast_to(inputs, output, spec)?,
        Operation::DotGeneral(spec) => op_dot_general(inputs, output, spec)?,
        Operation::ElementwiseBinary(op) => op_elementwise_binary(inputs, output, *op)?,
        Operation::ElementwiseUnary(op) => op_elementwise_unary(inputs, output, *op)?,
        Operation::Reduce(spec) => op_reduce(inputs, output, spec)?,
        Operation::ExtractPatches(spec) => op_extract_patches(inputs, output, spec)?,
        Operation::FoldPatches(spec) => op_fold_patches(inputs, output, spec)?,
        Operation::Compare(spec) => op_compare(inputs, output, spec)?,
        Operation::Concat(spec) => op_concat(inputs, output, spec)?,
    };
    Ok(result)
}

fn augment_backend_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendError {
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!(
                "{message} (at function `{}` instruction #{}, {} id {} operands [{}])",
                function_name,
                instruction_index,
                instruction.op.name(),
                instruction.id,
                format_operands(&instruction.operands, inputs)
            ),
        },
        BackendError::Unimplemented { op, reason } => BackendError::Unimplemented {
            op,
            reason: format!(
                "{} (while executing function `{}` instruction #{}, id {})",
                reason, function_name, instruction_index, instruction.id
            ),
        },
        other => other,
    }
}

fn format_operands(operands: &[ValueId], inputs: &[CpuTensor]) -> String {
    if operands.is_empty() {
        return String::from("<none>");
    }

    operands
        .iter()
        .zip(inputs.iter())
        .map(|(id, tensor)| format!("{id} {}", tensor.spec.shape))
        .collect::<Vec<_>>()
        .join(", ")
}

fn op_identity(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if input.data.len() != element_count(output)? {
        return Err(BackendError::execution("reshape element count mismatch"));
    }
    Ok(CpuTensor {
        spec: output.clone(),
        data: input.data.clone(),
    })
}

fn op_slice(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &SliceSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let input_dims = input.dims();
    if spec.starts.len() != input_dims.len() || spec.sizes.len() != input_dims.len() {
        return Err(BackendError::execution("slice rank mismatch"));
    }
    let out_dims = output.shape.dims();
    if out_dims != spec.sizes.as_slice() {
        return Err(BackendError::execution("slice output shape mismatch"));
    }
    for axis in 0..input_dims.len() {
        if spec.starts[axis] + out_dims[axis] > input_dims[axis] {
            return Err(BackendError::execution("slice out of bounds"));
        }
    }
    let values = input.data.as_ref();
    let mut result = vec![0.0f32; element_count(output)?];

    if input_dims.len() == 2 {
        let n_in = input_dims[1];
        let (m_out, n_out) = (out_dims[0], out_dims[1]);
        let (m_start, n_start) = (spec.starts[0], spec.starts[1]);
        for row in 0..m_out {
            let src_offset = (m_start + row) * n_in + n_start;
            let dst_offset = row * n_out;
            result[dst_offset..dst_offset + n_out]
                .copy_from_slice(&values[src_offset..src_offset + n_out]);
        }
    } else {
        let strides = compute_strides(input_dims);
        for (idx, slot) in result.iter_mut().enumerate() {
            let coord = unravel_index(idx, out_dims);
            let in_index: usize = coord
                .iter()
                .enumerate()
                .map(|(dim, &c)| (spec.starts[dim] + c) * strides[dim])
                .sum();
            *slot = values[in_index];
        }
    }
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_pad(inputs: &[CpuTensor], output: &TensorSpec, spec: &PadSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let input_dims = input.dims();
    let out_dims = output.shape.dims();
    if spec.low.len() != input_dims.len()
        || spec.high.len() != input_dims.len()
        || out_dims.len() != input_dims.len()
    {
        return Err(BackendError::execution("pad rank mismatch"));
    }
    for axis in 0..input_dims.len() {
        if input_dims[axis] + spec.low[axis] + spec.high[axis] != out_dims[axis] {
            return Err(BackendError::execution("pad output shape mismatch"));
        }
    }
    let out_strides = compute_strides(out_dims);
    let mut result = vec![spec.pad_value; element_count(output)?];
    for (idx, &value) in input.data.iter().enumerate() {
        let coord = unravel_index(idx, input_dims);
        let out_index: usize = coord
            .iter()
            .enumerate()
            .map(|(axis, &c)| (c + spec.low[axis]) * out_strides[axis])
            .sum();
        result[out_index] = value;
    }
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_transpose(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &TransposeSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let input_dims = input.dims();
    if spec.perm.len() != input_dims.len() {
        return Err(BackendError::execution("transpose rank mismatch"));
    }
    let values = input.data.as_ref();
    let out_dims = output.shape.dims();
    let mut result = vec![0.0f32; element_count(output)?];
    let input_strides = compute_strides(input_dims);
    for (idx, slot) in result.iter_mut().enumerate() {
        let out_coord = unravel_index(idx, out_dims);
        let mut in_index = 0usize;
        for (out_axis, &out_c) in out_coord.iter().enumerate() {
            let in_axis = spec.perm[out_axis];
            in_index += out_c * input_strides[in_axis];
        }
        *slot = values[in_index];
    }
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_broadcast_to(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &BroadcastToSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let input_dims = input.dims();
    let out_dims = output.shape.dims();
    if out_dims != spec.result_shape.dims() {
        return Err(BackendError::execution(
            "broadcast_to result shape mismatch",
        ));
    }
    if out_dims.len() < input_dims.len() {
        return Err(BackendError::execution(
            "broadcast_to result rank must be >= operand rank",
        ));
    }
    let rank_diff = out_dims.len() - input_dims.len();
    for (axis, &dim) in input_dims.iter().enumerate() {
        let out_dim = out_dims[rank_diff + axis];
        if dim != 1 && dim != out_dim {
            return Err(BackendError::execution("broadcast_to dim mismatch"));
        }
    }
    let out_len = element_count(output)?;
    Ok(CpuTensor::new(
        output.clone(),
        broadcast_to_f32(input.data.as_ref(), input_dims, out_dims, out_len),
    ))
}

fn broadcast_to_f32(
    input: &[f32],
    input_dims: &[usize],
    out_dims: &[usize],
    out_len: usize,
) -> Vec<f32> {
    if input_dims == out_dims {
        return input.to_vec();
    }
    let rank_diff = out_dims.len().saturating_sub(input_dims.len());
    let mut aligned_in_dims = vec![1usize; out_dims.len()];
    aligned_in_dims[rank_diff..].copy_from_slice(input_dims);
    let in_strides = compute_strides(&aligned_in_dims);
    let out_strides = compute_strides(out_dims);
    let mut out = vec![0.0f32; out_len];
    broadcast_rec_f32(
        &mut out,
        input,
        0,
        0,
        0,
        out_dims,
        &aligned_in_dims,
        &out_strides,
        &in_strides,
    );
    out
}

#[allow(clippy::too_many_arguments)]
fn broadcast_rec_f32(
    out: &mut [f32],
    input: &[f32],
    axis: usize,
    out_offset: usize,
    in_offset: usize,
    out_dims: &[usize],
    in_dims: &[usize],
    out_strides: &[usize],
    in_strides: &[usize],
) {
    let rank = out_dims.len();
    if axis >= rank {
        out[out_offset] = input[in_offset];
        return;
    }

    if in_dims[axis..] == out_dims[axis..] {
        let block_len: usize = out_dims[axis..].iter().product();
        out[out_offset..out_offset + block_len]
            .copy_from_slice(&input[in_offset..in_offset + block_len]);
        return;
    }

    if in_dims[axis..].iter().all(|&dim| dim == 1) {
        let block_len: usize = out_dims[axis..].iter().product();
        out[out_offset..out_offset + block_len].fill(input[in_offset]);
        return;
    }

    let out_step = out_strides[axis];
    let in_step = if in_dims[axis] == 1 {
        0
    } else {
        in_strides[axis]
    };
    for i in 0..out_dims[axis] {
        broadcast_rec_f32(
            out,
            input,
            axis + 1,
            out_offset + i * out_step,
            in_offset + i * in_step,
            out_dims,
            in_dims,
            out_strides,
            in_strides,
        );
    }
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseBinaryOp,
) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution(
            "elementwise binary expects 2 inputs",
        ));
    }
    let (a, b) = (&inputs[0].data, &inputs[1].data);
    if a.len() != b.len() {
        return Err(BackendError::execution("elementwise size mismatch"));
    }
    let result: Vec<f32> = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| match op {
            ElementwiseBinaryOp::Add => x + y,
            ElementwiseBinaryOp::Sub => x - y,
            ElementwiseBinaryOp::Mul => x * y,
            ElementwiseBinaryOp::Div => x / y,
            ElementwiseBinaryOp::Maximum => x.max(*y),
            ElementwiseBinaryOp::Minimum => x.min(*y),
        })
        .collect();
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_elementwise_unary(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ElementwiseUnaryOp,
) -> BackendResult<CpuTensor> {
    let values = expect_single(inputs)?.data.as_ref();
    let result: Vec<f32> = match op {
        ElementwiseUnaryOp::Neg => values.iter().map(|&x| -x).collect(),
        ElementwiseUnaryOp::Abs => values.iter().map(|&x| x.abs()).collect(),
        ElementwiseUnaryOp::Exp => values.iter().map(|&x| x.exp()).collect(),
        ElementwiseUnaryOp::Log => values.iter().map(|&x| x.ln()).collect(),
        ElementwiseUnaryOp::Tanh => values.iter().map(|&x| x.tanh()).collect(),
        ElementwiseUnaryOp::Sqrt => values.iter().map(|&x| x.sqrt()).collect(),
        ElementwiseUnaryOp::Reciprocal => values.iter().map(|&x| 1.0 / x).collect(),
    };
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_reduce(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ReduceSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let dims = input.dims();
    if spec.axes.iter().any(|&axis| axis >= dims.len()) {
        return Err(BackendError::execution("reduce axis out of range"));
    }
    // Reduced axes collapse to extent 1; the memory layout is the same with or without keepdims.
    let kept: Vec<usize> = dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if spec.axes.contains(&axis) { 1 } else { dim })
        .collect();
    let kept_strides = compute_strides(&kept);
    let out_len = element_count(output)?;
    if out_len != kept.iter().product::<usize>() {
        return Err(BackendError::execution("reduce output shape mismatch"));
    }
    let init = match spec.kind {
        ReduceKind::Sum => 0.0f32,
        ReduceKind::Max => f32::NEG_INFINITY,
        ReduceKind::Min => f32::INFINITY,
    };
    let mut result = vec![init; out_len];
    for (idx, &value) in input.data.iter().enumerate() {
        let coord = unravel_index(idx, dims);
        let out_index: usize = coord
            .iter()
            .zip(&kept)
            .zip(&kept_strides)
            .map(|((&c, &extent), &stride)| if extent == 1 { 0 } else { c * stride })
            .sum();
        let acc = &mut result[out_index];
        *acc = match spec.kind {
            ReduceKind::Sum => *acc + value,
            ReduceKind::Max => acc.max(value),
            ReduceKind::Min => acc.min(value),
        };
    }
    Ok(CpuTensor::new(output.clone(), result))
}

/// Validated geometry shared by patch extraction and folding.
struct PatchGeometry {
    n: usize,
    h: usize,
    w: usize,
    c: usize,
    k_h: usize,
    k_w: usize,
    s_h: usize,
    s_w: usize,
    pad_top: usize,
    pad_left: usize,
    out_h: usize,
    out_w: usize,
}

impl PatchGeometry {
    fn new(input_dims: &[usize], spec: &ExtractPatchesSpec) -> BackendResult<Self> {
        if input_dims.len() != 4 {
            return Err(BackendError::unimplemented(
                "extract_patches",
                "only rank-4 NHWC inputs are supported",
            ));
        }
        if spec.window.len() != 2 || spec.strides.len() != 2 || spec.padding.len() != 2 {
            return Err(BackendError::execution(
                "extract_patches expects 2D window/stride/padding",
            ));
        }
        let (n, h, w, c) = (input_dims[0], input_dims[1], input_dims[2], input_dims[3]);
        let (k_h, k_w) = (spec.window[0], spec.window[1]);
        let (s_h, s_w) = (spec.strides[0], spec.strides[1]);
        let (pad_top, pad_bottom) = spec.padding[0];
        let (pad_left, pad_right) = spec.padding[1];
        if k_h == 0 || k_w == 0 || s_h == 0 || s_w == 0 {
            return Err(BackendError::execution(
                "extract_patches window/stride must be > 0",
            ));
        }
        let padded_h = h + pad_top + pad_bottom;
        let padded_w = w + pad_left + pad_right;
        if padded_h < k_h || padded_w < k_w {
            return Err(BackendError::execution(
                "extract_patches window exceeds padded input",
            ));
        }
        Ok(PatchGeometry {
            n,
            h,
            w,
            c,
            k_h,
            k_w,
            s_h,
            s_w,
            pad_top,
            pad_left,
            out_h: (padded_h - k_h) / s_h + 1,
            out_w: (padded_w - k_w) / s_w + 1,
        })
    }

    fn patch_dims(&self) -> [usize; 4] {
        [self.n, self.out_h, self.out_w, self.k_h * self.k_w * self.c]
    }

    /// Calls `visit(patch_offset, input_offset)` for every in-bounds window tap, one channel
    /// run of length `c` at a time.
    fn for_each_tap(&self, mut visit: impl FnMut(usize, usize)) {
        let patch_dim = self.k_h * self.k_w * self.c;
        for n_idx in 0..self.n {
            for oh in 0..self.out_h {
                let base_h = oh as isize * self.s_h as isize - self.pad_top as isize;
                for ow in 0..self.out_w {
                    let base_w = ow as isize * self.s_w as isize - self.pad_left as isize;
                    let out_base = ((n_idx * self.out_h + oh) * self.out_w + ow) * patch_dim;
                    for kh in 0..self.k_h {
                        let in_h = base_h + kh as isize;
                        if in_h < 0 || in_h >= self.h as isize {
                            continue;
                        }
                        for kw in 0..self.k_w {
                            let in_w = base_w + kw as isize;
                            if in_w < 0 || in_w >= self.w as isize {
                                continue;
                            }
                            let in_offset =
                                ((n_idx * self.h + in_h as usize) * self.w + in_w as usize)
                                    * self.c;
                            let patch_offset = out_base + (kh * self.k_w + kw) * self.c;
                            visit(patch_offset, in_offset);
                        }
                    }
                }
            }
        }
    }
}

fn op_extract_patches(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ExtractPatchesSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let geometry = PatchGeometry::new(input.dims(), spec)?;
    let expected = geometry.patch_dims();
    if output.shape.dims() != expected {
        return Err(BackendError::execution(format!(
            "extract_patches output shape mismatch: expected {expected:?}, got {}",
            output.shape
        )));
    }

    let values = input.data.as_ref();
    let c = geometry.c;
    let mut result = vec![spec.pad_value; element_count(output)?];
    geometry.for_each_tap(|dst, src| {
        result[dst..dst + c].copy_from_slice(&values[src..src + c]);
    });
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_fold_patches(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ExtractPatchesSpec,
) -> BackendResult<CpuTensor> {
    let patches = expect_single(inputs)?;
    let geometry = PatchGeometry::new(output.shape.dims(), spec)?;
    let expected = geometry.patch_dims();
    if patches.dims() != expected {
        return Err(BackendError::execution(format!(
            "fold_patches operand shape mismatch: expected {expected:?}, got {}",
            patches.spec.shape
        )));
    }

    let values = patches.data.as_ref();
    let c = geometry.c;
    let mut result = vec![0.0f32; element_count(output)?];
    geometry.for_each_tap(|src, dst| {
        for (acc, &value) in result[dst..dst + c].iter_mut().zip(&values[src..src + c]) {
            *acc += value;
        }
    });
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_dot_general(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &DotGeneralSpec,
) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution("dot_general expects two inputs"));
    }
    let lhs = &inputs[0];
    let rhs = &inputs[1];
    let lhs_values = lhs.data.as_ref();
    let rhs_values = rhs.data.as_ref();
    let lhs_dims = lhs.dims();
    let rhs_dims = rhs.dims();
    let lhs_strides = compute_strides(lhs_dims);
    let rhs_strides = compute_strides(rhs_dims);

    let lhs_batch_axes = &spec.batch_lhs;
    let rhs_batch_axes = &spec.batch_rhs;
    let lhs_contract_axes = &spec.contract_lhs;
    let rhs_contract_axes = &spec.contract_rhs;
    if lhs_batch_axes.len() != rhs_batch_axes.len()
        || lhs_contract_axes.len() != rhs_contract_axes.len()
    {
        return Err(BackendError::execution("dot_general axis lists disagree"));
    }

    let lhs_free_axes: Vec<usize> = (0..lhs_dims.len())
        .filter(|ax| !lhs_batch_axes.contains(ax) && !lhs_contract_axes.contains(ax))
        .collect();
    let rhs_free_axes: Vec<usize> = (0..rhs_dims.len())
        .filter(|ax| !rhs_batch_axes.contains(ax) && !rhs_contract_axes.contains(ax))
        .collect();

    let batch_shape: Vec<usize> = lhs_batch_axes.iter().map(|&ax| lhs_dims[ax]).collect();
    let lhs_free_shape: Vec<usize> = lhs_free_axes.iter().map(|&ax| lhs_dims[ax]).collect();
    let rhs_free_shape: Vec<usize> = rhs_free_axes.iter().map(|&ax| rhs_dims[ax]).collect();
    let contract_shape: Vec<usize> = lhs_contract_axes.iter().map(|&ax| lhs_dims[ax]).collect();

    let mut output_data = vec![0.0f32; element_count(output)?];
    let mut out_index = 0usize;

    for batch_index in MultiIndex::new(&batch_shape) {
        for lhs_free_index in MultiIndex::new(&lhs_free_shape) {
            for rhs_free_index in MultiIndex::new(&rhs_free_shape) {
                let mut sum = 0.0f32;
                for contract_index in MultiIndex::new(&contract_shape) {
                    let lhs_idx = build_index(
                        &lhs_strides,
                        lhs_batch_axes,
                        &lhs_free_axes,
                        lhs_contract_axes,
                        &batch_index,
                        &lhs_free_index,
                        &contract_index,
                    );
                    let rhs_idx = build_index(
                        &rhs_strides,
                        rhs_batch_axes,
                        &rhs_free_axes,
                        rhs_contract_axes,
                        &batch_index,
                        &rhs_free_index,
                        &contract_index,
                    );
                    sum += lhs_values[lhs_idx] * rhs_values[rhs_idx];
                }
                let slot = output_data
                    .get_mut(out_index)
                    .ok_or_else(|| BackendError::execution("dot_general output too small"))?;
                *slot = sum;
                out_index += 1;
            }
        }
    }

    Ok(CpuTensor::new(output.clone(), output_data))
}

fn op_compare(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &CompareSpec,
) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution("compare expects two inputs"));
    }
    let (a, b) = (&inputs[0].data, &inputs[1].data);
    if a.len() != b.len() {
        return Err(BackendError::execution("compare size mismatch"));
    }
    let result: Vec<f32> = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let flag = match spec.op {
                ComparisonOp::Less => x < y,
                ComparisonOp::LessEqual => x <= y,
                ComparisonOp::Equal => x == y,
                ComparisonOp::GreaterEqual => x >= y,
                ComparisonOp::Greater => x > y,
                ComparisonOp::NotEqual => x != y,
            };
            if flag {
                1.0
            } else {
                0.0
            }
        })
        .collect();
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_concat(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &ConcatSpec,
) -> BackendResult<CpuTensor> {
    if inputs.is_empty() {
        return Err(BackendError::execution("concat expects at least one input"));
    }

    let out_dims = output.shape.dims();
    let rank = out_dims.len();
    let axis = spec.axis;
    if axis >= rank {
        return Err(BackendError::execution("concat axis out of range"));
    }

    let axis_inner = out_dims.iter().skip(axis + 1).product::<usize>();
    let outer = out_dims.iter().take(axis).product::<usize>();

    let mut axis_total = 0usize;
    for tensor in inputs {
        let dims = tensor.dims();
        if dims.len() != rank {
            return Err(BackendError::execution("concat rank mismatch"));
        }
        for (idx, (&dim, &out_dim)) in dims.iter().zip(out_dims.iter()).enumerate() {
            if idx != axis && dim != out_dim {
                return Err(BackendError::execution("concat dimension mismatch"));
            }
        }
        axis_total += dims[axis];
    }
    if axis_total != out_dims[axis] {
        return Err(BackendError::execution(
            "concat inputs do not match output axis length",
        ));
    }

    let mut result = vec![0.0f32; element_count(output)?];
    let stride_outer = out_dims[axis] * axis_inner;
    for outer_idx in 0..outer {
        let mut dst_offset = outer_idx * stride_outer;
        for tensor in inputs {
            let chunk = tensor.dims()[axis] * axis_inner;
            let src_start = outer_idx * chunk;
            result[dst_offset..dst_offset + chunk]
                .copy_from_slice(&tensor.data[src_start..src_start + chunk]);
            dst_offset += chunk;
        }
    }
    Ok(CpuTensor::new(output.clone(), result))
}

fn op_iota(output: &TensorSpec, spec: &IotaSpec) -> BackendResult<CpuTensor> {
    let dims = spec.shape.dims();
    let axis = spec.axis;
    if axis >= dims.len() {
        return Err(BackendError::execution("iota axis out of range"));
    }
    if output.shape != spec.shape {
        return Err(BackendError::execution("iota output shape mismatch"));
    }
    let result = (0..element_count(output)?)
        .map(|idx| unravel_index(idx, dims)[axis] as f32)
        .collect();
    Ok(CpuTensor::new(output.clone(), result))
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    if inputs.len() != 1 {
        Err(BackendError::execution("operation expects single input"))
    } else {
        Ok(&inputs[0])
    }
}

fn element_count(spec: &TensorSpec) -> BackendResult<usize> {
    spec.element_count()
        .ok_or_else(|| BackendError::execution("tensor element count overflows"))
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

struct MultiIndex {
    shape: Vec<usize>,
    current: Vec<usize>,
    first: bool,
}

impl MultiIndex {
    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            current: vec![0; shape.len()],
            first: true,
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first {
            self.first = false;
            return Some(self.current.clone());
        }
        for i in (0..self.current.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.shape[i] {
                return Some(self.current.clone());
            }
            self.current[i] = 0;
        }
        None
    }
}

fn build_index(
    strides: &[usize],
    batch_axes: &[usize],
    free_axes: &[usize],
    contract_axes: &[usize],
    batch_index: &[usize],
    free_index: &[usize],
    contract_index: &[usize],
) -> usize {
    batch_axes
        .iter()
        .zip(batch_index)
        .chain(free_axes.iter().zip(free_index))
        .chain(contract_axes.iter().zip(contract_index))
        .map(|(&axis, &coord)| coord * strides[axis])
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazygrad::backend::spec::Shape;

    fn tensor(dims: &[usize], data: Vec<f32>) -> CpuTensor {
        CpuTensor::new(TensorSpec::new(Shape::new(dims.to_vec())), data)
    }

    fn spec(dims: &[usize]) -> TensorSpec {
        TensorSpec::new(Shape::new(dims.to_vec()))
    }

    #[test]
    fn multi_index_over_empty_shape_yields_once() {
        assert_eq!(MultiIndex::new(&[]).count(), 1);
        assert_eq!(MultiIndex::new(&[2, 3]).count(), 6);
    }

    #[test]
    fn reduce_handles_several_axes() {
        let x = tensor(&[2, 2, 3], (0..12).map(|v| v as f32).collect());
        let reduced = op_reduce(
            &[x],
            &spec(&[2]),
            &ReduceSpec {
                kind: ReduceKind::Sum,
                axes: vec![1, 2],
                keepdims: false,
            },
        )
        .unwrap();
        assert_eq!(reduced.data.as_ref(), &[15.0, 51.0]);
    }

    #[test]
    fn pad_places_input_inside_border() {
        let x = tensor(&[2], vec![1.0, 2.0]);
        let padded = op_pad(
            &[x],
            &spec(&[5]),
            &PadSpec {
                low: vec![1],
                high: vec![2],
                pad_value: -1.0,
            },
        )
        .unwrap();
        assert_eq!(padded.data.as_ref(), &[-1.0, 1.0, 2.0, -1.0, -1.0]);
    }

    #[test]
    fn fold_patches_counts_overlapping_taps() {
        let patch_spec = ExtractPatchesSpec {
            window: vec![2, 2],
            strides: vec![1, 1],
            padding: vec![(0, 0), (0, 0)],
            pad_value: 0.0,
        };
        let ones = tensor(&[1, 2, 2, 4], vec![1.0; 16]);
        let folded = op_fold_patches(&[ones], &spec(&[1, 3, 3, 1]), &patch_spec).unwrap();
        assert_eq!(
            folded.data.as_ref(),
            &[1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]
        );
    }

    #[test]
    fn broadcast_repeats_size_one_axes() {
        let x = tensor(&[2, 1], vec![1.0, 2.0]);
        let out = op_broadcast_to(
            &[x],
            &spec(&[2, 3]),
            &BroadcastToSpec {
                result_shape: Shape::new([2, 3]),
            },
        )
        .unwrap();
        assert_eq!(out.data.as_ref(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }
}
