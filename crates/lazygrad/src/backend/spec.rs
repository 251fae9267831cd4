use std::{collections::HashMap, fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Version tag stamped into every serialized program.
pub const SPEC_VERSION: &str = "lazygrad.ir.v1";

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// Static tensor shape. Every extent is known when the program is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn into_dims(self) -> Vec<usize> {
        self.dims
    }

    /// Product of all extents; `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    /// A shape is usable when it has at least one axis and no zero extent.
    pub fn is_valid(&self) -> bool {
        !self.dims.is_empty() && self.dims.iter().all(|&dim| dim > 0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .dims
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join("x");
        write!(f, "[{dims}]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

/// Tensor metadata. Element type is always f32.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }

    pub fn element_count(&self) -> Option<usize> {
        self.shape.element_count()
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(4)
    }
}

/// Dense literal tensor payload stored as little-endian f32 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn from_f32(spec: TensorSpec, values: &[f32]) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for &value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            spec,
            bytes: Arc::from(bytes.into_boxed_slice()),
        }
    }

    /// Decodes the payload, checking it against the declared element count.
    pub fn to_f32_vec(&self) -> BackendResult<Vec<f32>> {
        let expected = self
            .spec
            .byte_len()
            .ok_or_else(|| BackendError::execution("literal element count overflows"))?;
        if self.bytes.len() != expected {
            return Err(BackendError::execution(format!(
                "literal holds {} bytes but {} declares {expected}",
                self.bytes.len(),
                self.spec.shape
            )));
        }
        Ok(self
            .bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Comparator used by the `compare` op. Results are encoded as 0.0 / 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseUnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Tanh,
    Sqrt,
    Reciprocal,
}

/// Binary ops require operands of identical shape; broadcasting is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Max,
    Min,
}

/// Fully describes a `dot_general` contraction. Output axes are ordered batch, lhs free, rhs free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotGeneralSpec {
    pub batch_lhs: Vec<usize>,
    pub batch_rhs: Vec<usize>,
    pub contract_lhs: Vec<usize>,
    pub contract_rhs: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareSpec {
    pub op: ComparisonOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Numpy-style: the operand is right-aligned against `result_shape`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastToSpec {
    pub result_shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub starts: Vec<usize>,
    pub sizes: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadSpec {
    pub low: Vec<usize>,
    pub high: Vec<usize>,
    pub pad_value: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IotaSpec {
    pub shape: Shape,
    pub axis: usize,
}

/// Sliding-window patch extraction over NHWC tensors.
///
/// `extract_patches` maps `[n, h, w, c]` to `[n, oh, ow, kh * kw * c]` with the patch axis laid
/// out as `(kh, kw, c)`. `fold_patches` is its adjoint: it scatters-adds patches back into the
/// input layout declared by the instruction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractPatchesSpec {
    pub window: Vec<usize>,
    pub strides: Vec<usize>,
    pub padding: Vec<(usize, usize)>,
    pub pad_value: f32,
}

/// Unique identifier for SSA values in a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    Iota(IotaSpec),
    ElementwiseUnary(ElementwiseUnaryOp),
    ElementwiseBinary(ElementwiseBinaryOp),
    Compare(CompareSpec),
    StopGradient,
    BroadcastTo(BroadcastToSpec),
    Reshape(ReshapeSpec),
    Transpose(TransposeSpec),
    Reduce(ReduceSpec),
    DotGeneral(DotGeneralSpec),
    Slice(SliceSpec),
    Pad(PadSpec),
    Concat(ConcatSpec),
    ExtractPatches(ExtractPatchesSpec),
    FoldPatches(ExtractPatchesSpec),
}

impl Operation {
    /// Short lowercase name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::Iota(_) => "iota",
            Operation::ElementwiseUnary(_) => "elementwise_unary",
            Operation::ElementwiseBinary(_) => "elementwise_binary",
            Operation::Compare(_) => "compare",
            Operation::StopGradient => "stop_gradient",
            Operation::BroadcastTo(_) => "broadcast_to",
            Operation::Reshape(_) => "reshape",
            Operation::Transpose(_) => "transpose",
            Operation::Reduce(_) => "reduce",
            Operation::DotGeneral(_) => "dot_general",
            Operation::Slice(_) => "slice",
            Operation::Pad(_) => "pad",
            Operation::Concat(_) => "concat",
            Operation::ExtractPatches(_) => "extract_patches",
            Operation::FoldPatches(_) => "fold_patches",
        }
    }
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub output: TensorSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<TensorSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub results: Vec<TensorSpec>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
}

/// Complete program: a set of functions and the name of the one to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    pub entry: String,
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum ProgramSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("program spec version '{found}' does not match expected '{expected}'")]
    SpecVersionMismatch {
        found: String,
        expected: &'static str,
    },
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            spec_version: SPEC_VERSION.to_string(),
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == self.entry)
    }

    pub fn to_json_string(&self) -> Result<String, ProgramSerdeError> {
        serde_json::to_string_pretty(self).map_err(ProgramSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ProgramSerdeError> {
        let program: Program = serde_json::from_str(src)?;
        if program.spec_version != SPEC_VERSION {
            return Err(ProgramSerdeError::SpecVersionMismatch {
                found: program.spec_version,
                expected: SPEC_VERSION,
            });
        }
        Ok(program)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "program @{} (spec_version = {}) {{",
            self.entry, self.spec_version
        )?;
        for function in &self.functions {
            writeln!(f, "  func @{} {{", function.name)?;
            for (id, spec) in function.parameter_ids.iter().zip(&function.parameters) {
                writeln!(f, "    param {id} : {}", spec.shape)?;
            }
            for instruction in &function.body {
                let operands = instruction
                    .operands
                    .iter()
                    .map(ValueId::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(
                    f,
                    "    {} = {}({operands}) -> {}",
                    instruction.id,
                    instruction.op.name(),
                    instruction.output.shape
                )?;
            }
            let results = function
                .result_ids
                .iter()
                .map(ValueId::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "    return {results}")?;
            writeln!(f, "  }}")?;
        }
        writeln!(f, "}}")
    }
}

/// Incremental builder for a single function. Lowering and gradient construction share it.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProgramBuilder {
    next_value_id: u32,
    parameters: Vec<(ValueId, TensorSpec)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, TensorSpec>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter(&mut self, spec: TensorSpec) -> ValueId {
        let id = self.allocate();
        self.value_types.insert(id, spec.clone());
        self.parameters.push((id, spec));
        id
    }

    pub fn emit_single(
        &mut self,
        op: Operation,
        operands: Vec<ValueId>,
        output: TensorSpec,
    ) -> ValueId {
        let id = self.allocate();
        self.value_types.insert(id, output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    pub fn value_spec(&self, id: ValueId) -> Option<&TensorSpec> {
        self.value_types.get(&id)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn finish(self, name: impl Into<String>, result_ids: Vec<ValueId>) -> BackendResult<Function> {
        let mut results = Vec::with_capacity(result_ids.len());
        for id in &result_ids {
            let spec = self.value_types.get(id).ok_or_else(|| {
                BackendError::spec(
                    SpecErrorCode::UnknownValue,
                    format!("result {id} was never defined"),
                )
            })?;
            results.push(spec.clone());
        }
        let (parameter_ids, parameters): (Vec<_>, Vec<_>) = self.parameters.into_iter().unzip();
        Ok(Function {
            name: name.into(),
            parameters,
            parameter_ids,
            results,
            body: self.instructions,
            result_ids,
        })
    }

    fn allocate(&mut self) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecErrorCode {
    UnknownValue,
    InvalidShape,
    ShapeMismatch,
    RankMismatch,
    AxisOutOfRange,
    BroadcastIncompatible,
    InvalidAttributeValue,
}

impl SpecErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecErrorCode::UnknownValue => "SpecError: unknown value",
            SpecErrorCode::InvalidShape => "SpecError: invalid shape",
            SpecErrorCode::ShapeMismatch => "SpecError: operand shapes do not match",
            SpecErrorCode::RankMismatch => "SpecError: rank mismatch",
            SpecErrorCode::AxisOutOfRange => "SpecError: axis out of range",
            SpecErrorCode::BroadcastIncompatible => "SpecError: shapes are not broadcast compatible",
            SpecErrorCode::InvalidAttributeValue => "SpecError: invalid attribute value",
        }
    }
}

/// Validation failure captured before execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecError {
    pub code: SpecErrorCode,
    pub detail: Option<String>,
}

impl SpecError {
    pub fn new(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{} ({detail})", self.code.as_str()),
            None => write!(f, "{}", self.code.as_str()),
        }
    }
}

impl std::error::Error for SpecError {}

/// Backend error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    SpecViolation(SpecError),
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn spec(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        BackendError::SpecViolation(SpecError::new(code, detail))
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Contract every execution backend fulfils.
///
/// A backend turns host literals into device handles, runs whole programs in a single
/// submission, and reads handles back. Gradient construction defaults to the portable
/// reverse-mode transform in [`crate::backend::autodiff`]; backends with native
/// differentiation may override it.
pub trait PortableBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Uploads host data as a device handle.
    fn materialize(&self, literal: TensorLiteral) -> BackendResult<Self::TensorHandle>;

    /// Reads a device handle back into a dense literal.
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Executes a single instruction given already materialised operand handles.
    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Self::TensorHandle>;

    /// Executes the entry function once and returns its results in declaration order.
    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;

    /// Appends gradient computations for `of` with respect to each `wrt` value.
    ///
    /// The returned map omits any `wrt` value that `of` does not depend on.
    fn gradients(
        &self,
        builder: &mut ProgramBuilder,
        of: ValueId,
        wrt: &[ValueId],
    ) -> BackendResult<HashMap<ValueId, ValueId>> {
        crate::backend::autodiff::reverse_mode(builder, of, wrt).map_err(BackendError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_validity_rejects_zero_and_empty() {
        assert!(Shape::new([2, 3]).is_valid());
        assert!(!Shape::new([2, 0]).is_valid());
        assert!(!Shape::new(Vec::<usize>::new()).is_valid());
        assert_eq!(Shape::new([2, 3, 4]).element_count(), Some(24));
    }

    #[test]
    fn literal_decodes_little_endian_f32() {
        let spec = TensorSpec::new(Shape::new([3]));
        let literal = TensorLiteral::from_f32(spec, &[1.5, -2.0, 0.25]);
        assert_eq!(literal.byte_len(), 12);
        assert_eq!(literal.to_f32_vec().unwrap(), vec![1.5, -2.0, 0.25]);
    }

    #[test]
    fn literal_rejects_truncated_payload() {
        let spec = TensorSpec::new(Shape::new([2]));
        let literal = TensorLiteral::new(spec, Arc::from(vec![0u8; 4].into_boxed_slice()));
        assert!(literal.to_f32_vec().is_err());
    }

    #[test]
    fn program_json_rejects_foreign_version() {
        let mut builder = ProgramBuilder::new();
        let x = builder.add_parameter(TensorSpec::new(Shape::new([2])));
        let function = builder.finish("main", vec![x]).unwrap();
        let program = Program::new("main").with_functions(vec![function]);

        let json = program.to_json_string().unwrap();
        let decoded = Program::from_json_str(&json).unwrap();
        assert_eq!(decoded, program);

        let tampered = json.replace(SPEC_VERSION, "other.v0");
        assert!(matches!(
            Program::from_json_str(&tampered),
            Err(ProgramSerdeError::SpecVersionMismatch { .. })
        ));
    }

    #[test]
    fn finish_reports_undefined_result() {
        let builder = ProgramBuilder::new();
        let err = builder.finish("main", vec![ValueId(7)]).unwrap_err();
        assert!(matches!(err, BackendError::SpecViolation(_)));
    }

    #[test]
    fn display_lists_instructions() {
        let mut builder = ProgramBuilder::new();
        let x = builder.add_parameter(TensorSpec::new(Shape::new([2])));
        let y = builder.emit_single(
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp),
            vec![x],
            TensorSpec::new(Shape::new([2])),
        );
        let function = builder.finish("main", vec![y]).unwrap();
        let text = Program::new("main").with_functions(vec![function]).to_string();
        assert!(text.contains("%1 = elementwise_unary(%0) -> [2]"));
        assert!(text.contains("return %1"));
    }
}
