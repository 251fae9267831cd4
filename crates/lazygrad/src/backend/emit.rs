//! Shape-checked emission helpers on [`ProgramBuilder`].
//!
//! Each helper validates its operands against the recorded value specs, infers the output
//! shape, and appends one instruction (two for [`ProgramBuilder::splat`]). Lowering and the
//! gradient rules both emit through these helpers so every program the runtime submits is
//! shape-consistent by construction.

use crate::backend::shape_helpers::{
    broadcasts_to, is_permutation, window_output_extent,
};
use crate::backend::spec::{
    BackendError, BackendResult, BroadcastToSpec, CompareSpec, ComparisonOp, ConcatSpec,
    DotGeneralSpec, ElementwiseBinaryOp, ElementwiseUnaryOp, ExtractPatchesSpec, IotaSpec,
    Operation, PadSpec, ProgramBuilder, ReduceKind, ReduceSpec, ReshapeSpec, Shape, SliceSpec,
    SpecErrorCode, TensorLiteral, TensorSpec, TransposeSpec, ValueId,
};

fn spec_error(code: SpecErrorCode, detail: String) -> BackendError {
    BackendError::spec(code, detail)
}

/// Output shape of `extract_patches` for an NHWC input.
pub fn patches_shape(input: &[usize], spec: &ExtractPatchesSpec) -> BackendResult<Shape> {
    if input.len() != 4 {
        return Err(spec_error(
            SpecErrorCode::RankMismatch,
            format!("extract_patches expects a rank-4 NHWC input, got rank {}", input.len()),
        ));
    }
    if spec.window.len() != 2 || spec.strides.len() != 2 || spec.padding.len() != 2 {
        return Err(spec_error(
            SpecErrorCode::InvalidAttributeValue,
            "extract_patches expects 2D window/strides/padding".to_string(),
        ));
    }
    let (n, h, w, c) = (input[0], input[1], input[2], input[3]);
    let out_h = window_output_extent(
        h,
        spec.window[0],
        spec.strides[0],
        spec.padding[0].0,
        spec.padding[0].1,
    );
    let out_w = window_output_extent(
        w,
        spec.window[1],
        spec.strides[1],
        spec.padding[1].0,
        spec.padding[1].1,
    );
    match (out_h, out_w) {
        (Some(out_h), Some(out_w)) => Ok(Shape::new([
            n,
            out_h,
            out_w,
            spec.window[0] * spec.window[1] * c,
        ])),
        _ => Err(spec_error(
            SpecErrorCode::InvalidAttributeValue,
            format!(
                "window {:?} with strides {:?} does not fit input {h}x{w}",
                spec.window, spec.strides
            ),
        )),
    }
}

impl ProgramBuilder {
    fn dims_of(&self, id: ValueId) -> BackendResult<Vec<usize>> {
        self.value_spec(id)
            .map(|spec| spec.shape.dims().to_vec())
            .ok_or_else(|| spec_error(SpecErrorCode::UnknownValue, format!("value {id} is undefined")))
    }

    fn emit_shaped(&mut self, op: Operation, operands: Vec<ValueId>, dims: Vec<usize>) -> ValueId {
        self.emit_single(op, operands, TensorSpec::new(Shape::new(dims)))
    }

    pub fn constant(&mut self, shape: Shape, values: &[f32]) -> BackendResult<ValueId> {
        if !shape.is_valid() {
            return Err(spec_error(
                SpecErrorCode::InvalidShape,
                format!("constant shape {shape} is not valid"),
            ));
        }
        if shape.element_count() != Some(values.len()) {
            return Err(spec_error(
                SpecErrorCode::ShapeMismatch,
                format!("constant of shape {shape} given {} values", values.len()),
            ));
        }
        let spec = TensorSpec::new(shape);
        let literal = TensorLiteral::from_f32(spec.clone(), values);
        Ok(self.emit_single(Operation::Constant(literal), Vec::new(), spec))
    }

    /// A single value broadcast to `shape`.
    pub fn splat(&mut self, value: f32, shape: &Shape) -> BackendResult<ValueId> {
        let scalar = self.constant(Shape::new([1]), &[value])?;
        self.broadcast_to(scalar, shape)
    }

    pub fn iota(&mut self, shape: Shape, axis: usize) -> BackendResult<ValueId> {
        if !shape.is_valid() || axis >= shape.rank() {
            return Err(spec_error(
                SpecErrorCode::AxisOutOfRange,
                format!("iota axis {axis} invalid for shape {shape}"),
            ));
        }
        let spec = TensorSpec::new(shape.clone());
        Ok(self.emit_single(Operation::Iota(IotaSpec { shape, axis }), Vec::new(), spec))
    }

    pub fn unary(&mut self, op: ElementwiseUnaryOp, x: ValueId) -> BackendResult<ValueId> {
        let dims = self.dims_of(x)?;
        Ok(self.emit_shaped(Operation::ElementwiseUnary(op), vec![x], dims))
    }

    pub fn binary(
        &mut self,
        op: ElementwiseBinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> BackendResult<ValueId> {
        let dims = self.same_dims(lhs, rhs, "elementwise_binary")?;
        Ok(self.emit_shaped(Operation::ElementwiseBinary(op), vec![lhs, rhs], dims))
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> BackendResult<ValueId> {
        self.binary(ElementwiseBinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> BackendResult<ValueId> {
        self.binary(ElementwiseBinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> BackendResult<ValueId> {
        self.binary(ElementwiseBinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: ValueId, rhs: ValueId) -> BackendResult<ValueId> {
        self.binary(ElementwiseBinaryOp::Div, lhs, rhs)
    }

    pub fn neg(&mut self, x: ValueId) -> BackendResult<ValueId> {
        self.unary(ElementwiseUnaryOp::Neg, x)
    }

    /// Elementwise comparison producing a 0.0 / 1.0 mask.
    pub fn compare(
        &mut self,
        op: ComparisonOp,
        lhs: ValueId,
        rhs: ValueId,
    ) -> BackendResult<ValueId> {
        let dims = self.same_dims(lhs, rhs, "compare")?;
        Ok(self.emit_shaped(Operation::Compare(CompareSpec { op }), vec![lhs, rhs], dims))
    }

    pub fn stop_gradient(&mut self, x: ValueId) -> BackendResult<ValueId> {
        let dims = self.dims_of(x)?;
        Ok(self.emit_shaped(Operation::StopGradient, vec![x], dims))
    }

    /// Broadcasts `x` to `shape`. Returns `x` unchanged when the shapes already agree.
    pub fn broadcast_to(&mut self, x: ValueId, shape: &Shape) -> BackendResult<ValueId> {
        let dims = self.dims_of(x)?;
        if dims.as_slice() == shape.dims() {
            return Ok(x);
        }
        if !shape.is_valid() || !broadcasts_to(&dims, shape.dims()) {
            return Err(spec_error(
                SpecErrorCode::BroadcastIncompatible,
                format!("cannot broadcast {} to {shape}", Shape::new(dims)),
            ));
        }
        let op = Operation::BroadcastTo(BroadcastToSpec {
            result_shape: shape.clone(),
        });
        Ok(self.emit_shaped(op, vec![x], shape.dims().to_vec()))
    }

    /// Reinterprets `x` with a new shape of equal element count; no-op for identical shapes.
    pub fn reshape(&mut self, x: ValueId, shape: &Shape) -> BackendResult<ValueId> {
        let dims = self.dims_of(x)?;
        if dims.as_slice() == shape.dims() {
            return Ok(x);
        }
        let current = Shape::new(dims);
        if !shape.is_valid() || current.element_count() != shape.element_count() {
            return Err(spec_error(
                SpecErrorCode::ShapeMismatch,
                format!("cannot reshape {current} to {shape}"),
            ));
        }
        let op = Operation::Reshape(ReshapeSpec {
            new_shape: shape.clone(),
        });
        Ok(self.emit_shaped(op, vec![x], shape.dims().to_vec()))
    }

    pub fn transpose(&mut self, x: ValueId, perm: &[usize]) -> BackendResult<ValueId> {
        let dims = self.dims_of(x)?;
        if perm.len() != dims.len() || !is_permutation(perm) {
            return Err(spec_error(
                SpecErrorCode::InvalidAttributeValue,
                format!("{perm:?} is not a permutation of rank {}", dims.len()),
            ));
        }
        if perm.iter().enumerate().all(|(axis, &p)| axis == p) {
            return Ok(x);
        }
        let out = perm.iter().map(|&axis| dims[axis]).collect();
        let op = Operation::Transpose(TransposeSpec {
            perm: perm.to_vec(),
        });
        Ok(self.emit_shaped(op, vec![x], out))
    }

    /// Reduces over `axes`. Without `keepdims` the reduced axes are removed; reducing every
    /// axis that way yields shape `[1]`.
    pub fn reduce(
        &mut self,
        kind: ReduceKind,
        x: ValueId,
        axes: &[usize],
        keepdims: bool,
    ) -> BackendResult<ValueId> {
        let dims = self.dims_of(x)?;
        let mut sorted = axes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != axes.len() || sorted.iter().any(|&axis| axis >= dims.len()) {
            return Err(spec_error(
                SpecErrorCode::AxisOutOfRange,
                format!("reduce axes {axes:?} invalid for rank {}", dims.len()),
            ));
        }
        if sorted.is_empty() {
            return Ok(x);
        }
        let out = reduced_dims(&dims, &sorted, keepdims);
        let op = Operation::Reduce(ReduceSpec {
            kind,
            axes: sorted,
            keepdims,
        });
        Ok(self.emit_shaped(op, vec![x], out))
    }

    pub fn dot_general(
        &mut self,
        lhs: ValueId,
        rhs: ValueId,
        spec: DotGeneralSpec,
    ) -> BackendResult<ValueId> {
        let lhs_dims = self.dims_of(lhs)?;
        let rhs_dims = self.dims_of(rhs)?;
        let out = dot_output_dims(&lhs_dims, &rhs_dims, &spec)?;
        Ok(self.emit_shaped(Operation::DotGeneral(spec), vec![lhs, rhs], out))
    }

    pub fn slice(
        &mut self,
        x: ValueId,
        starts: &[usize],
        sizes: &[usize],
    ) -> BackendResult<ValueId> {
        let dims = self.dims_of(x)?;
        if starts.len() != dims.len() || sizes.len() != dims.len() {
            return Err(spec_error(
                SpecErrorCode::RankMismatch,
                format!("slice bounds do not match rank {}", dims.len()),
            ));
        }
        for axis in 0..dims.len() {
            let end = starts[axis].checked_add(sizes[axis]);
            if sizes[axis] == 0 || end.map_or(true, |end| end > dims[axis]) {
                return Err(spec_error(
                    SpecErrorCode::InvalidAttributeValue,
                    format!(
                        "slice [{}, +{}) out of bounds on axis {axis} of extent {}",
                        starts[axis], sizes[axis], dims[axis]
                    ),
                ));
            }
        }
        if starts.iter().all(|&s| s == 0) && sizes == dims.as_slice() {
            return Ok(x);
        }
        let op = Operation::Slice(SliceSpec {
            starts: starts.to_vec(),
            sizes: sizes.to_vec(),
        });
        Ok(self.emit_shaped(op, vec![x], sizes.to_vec()))
    }

    pub fn pad(
        &mut self,
        x: ValueId,
        low: &[usize],
        high: &[usize],
        pad_value: f32,
    ) -> BackendResult<ValueId> {
        let dims = self.dims_of(x)?;
        if low.len() != dims.len() || high.len() != dims.len() {
            return Err(spec_error(
                SpecErrorCode::RankMismatch,
                format!("pad widths do not match rank {}", dims.len()),
            ));
        }
        if low.iter().chain(high).all(|&p| p == 0) {
            return Ok(x);
        }
        let out = dims
            .iter()
            .zip(low.iter().zip(high))
            .map(|(&dim, (&l, &h))| dim + l + h)
            .collect();
        let op = Operation::Pad(PadSpec {
            low: low.to_vec(),
            high: high.to_vec(),
            pad_value,
        });
        Ok(self.emit_shaped(op, vec![x], out))
    }

    pub fn concat(&mut self, inputs: &[ValueId], axis: usize) -> BackendResult<ValueId> {
        let Some((&first, rest)) = inputs.split_first() else {
            return Err(spec_error(
                SpecErrorCode::InvalidAttributeValue,
                "concat expects at least one input".to_string(),
            ));
        };
        let mut out = self.dims_of(first)?;
        if axis >= out.len() {
            return Err(spec_error(
                SpecErrorCode::AxisOutOfRange,
                format!("concat axis {axis} invalid for rank {}", out.len()),
            ));
        }
        for &input in rest {
            let dims = self.dims_of(input)?;
            let compatible = dims.len() == out.len()
                && dims
                    .iter()
                    .zip(&out)
                    .enumerate()
                    .all(|(a, (d, o))| a == axis || d == o);
            if !compatible {
                return Err(spec_error(
                    SpecErrorCode::ShapeMismatch,
                    format!(
                        "concat operand {} incompatible with {} on axis {axis}",
                        Shape::new(dims),
                        Shape::new(out)
                    ),
                ));
            }
            out[axis] += dims[axis];
        }
        if rest.is_empty() {
            return Ok(first);
        }
        Ok(self.emit_shaped(
            Operation::Concat(ConcatSpec { axis }),
            inputs.to_vec(),
            out,
        ))
    }

    pub fn extract_patches(
        &mut self,
        x: ValueId,
        spec: ExtractPatchesSpec,
    ) -> BackendResult<ValueId> {
        let dims = self.dims_of(x)?;
        let out = patches_shape(&dims, &spec)?;
        Ok(self.emit_shaped(Operation::ExtractPatches(spec), vec![x], out.into_dims()))
    }

    /// Adjoint of [`ProgramBuilder::extract_patches`]: sums patches back into `input_shape`.
    pub fn fold_patches(
        &mut self,
        patches: ValueId,
        spec: ExtractPatchesSpec,
        input_shape: &Shape,
    ) -> BackendResult<ValueId> {
        let dims = self.dims_of(patches)?;
        let expected = patches_shape(input_shape.dims(), &spec)?;
        if expected.dims() != dims.as_slice() {
            return Err(spec_error(
                SpecErrorCode::ShapeMismatch,
                format!(
                    "fold_patches operand {} does not match patches of {input_shape} ({expected})",
                    Shape::new(dims)
                ),
            ));
        }
        Ok(self.emit_shaped(
            Operation::FoldPatches(spec),
            vec![patches],
            input_shape.dims().to_vec(),
        ))
    }

    fn same_dims(&self, lhs: ValueId, rhs: ValueId, op: &str) -> BackendResult<Vec<usize>> {
        let l = self.dims_of(lhs)?;
        let r = self.dims_of(rhs)?;
        if l != r {
            return Err(spec_error(
                SpecErrorCode::ShapeMismatch,
                format!("{op} operands {} and {} differ", Shape::new(l), Shape::new(r)),
            ));
        }
        Ok(l)
    }
}

/// Dims after reducing `axes` (sorted, unique).
pub fn reduced_dims(dims: &[usize], axes: &[usize], keepdims: bool) -> Vec<usize> {
    let mut out = Vec::with_capacity(dims.len());
    for (axis, &dim) in dims.iter().enumerate() {
        if axes.contains(&axis) {
            if keepdims {
                out.push(1);
            }
        } else {
            out.push(dim);
        }
    }
    if out.is_empty() {
        out.push(1);
    }
    out
}

/// Output dims of a `dot_general`: batch, then lhs free, then rhs free (`[1]` when empty).
pub fn dot_output_dims(
    lhs: &[usize],
    rhs: &[usize],
    spec: &DotGeneralSpec,
) -> BackendResult<Vec<usize>> {
    let axes_ok = |axes: &[usize], rank: usize| axes.iter().all(|&axis| axis < rank);
    if spec.batch_lhs.len() != spec.batch_rhs.len()
        || spec.contract_lhs.len() != spec.contract_rhs.len()
        || !axes_ok(&spec.batch_lhs, lhs.len())
        || !axes_ok(&spec.contract_lhs, lhs.len())
        || !axes_ok(&spec.batch_rhs, rhs.len())
        || !axes_ok(&spec.contract_rhs, rhs.len())
    {
        return Err(spec_error(
            SpecErrorCode::AxisOutOfRange,
            format!("dot_general axes {spec:?} invalid for ranks {} and {}", lhs.len(), rhs.len()),
        ));
    }
    let pairs = spec
        .batch_lhs
        .iter()
        .zip(&spec.batch_rhs)
        .chain(spec.contract_lhs.iter().zip(&spec.contract_rhs));
    for (&l, &r) in pairs {
        if lhs[l] != rhs[r] {
            return Err(spec_error(
                SpecErrorCode::ShapeMismatch,
                format!(
                    "dot_general extent mismatch: lhs axis {l} is {} but rhs axis {r} is {}",
                    lhs[l], rhs[r]
                ),
            ));
        }
    }
    let mut out: Vec<usize> = spec.batch_lhs.iter().map(|&axis| lhs[axis]).collect();
    out.extend(
        (0..lhs.len())
            .filter(|axis| !spec.batch_lhs.contains(axis) && !spec.contract_lhs.contains(axis))
            .map(|axis| lhs[axis]),
    );
    out.extend(
        (0..rhs.len())
            .filter(|axis| !spec.batch_rhs.contains(axis) && !spec.contract_rhs.contains(axis))
            .map(|axis| rhs[axis]),
    );
    if out.is_empty() {
        out.push(1);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_with(dims: &[&[usize]]) -> (ProgramBuilder, Vec<ValueId>) {
        let mut builder = ProgramBuilder::new();
        let ids = dims
            .iter()
            .map(|d| builder.add_parameter(TensorSpec::new(Shape::new(d.to_vec()))))
            .collect();
        (builder, ids)
    }

    fn shape_of(builder: &ProgramBuilder, id: ValueId) -> Vec<usize> {
        builder.value_spec(id).unwrap().shape.dims().to_vec()
    }

    #[test]
    fn reduce_without_keepdims_collapses_to_unit() {
        let (mut b, ids) = builder_with(&[&[2, 3]]);
        let all = b.reduce(ReduceKind::Sum, ids[0], &[0, 1], false).unwrap();
        assert_eq!(shape_of(&b, all), vec![1]);
        let rows = b.reduce(ReduceKind::Max, ids[0], &[1], true).unwrap();
        assert_eq!(shape_of(&b, rows), vec![2, 1]);
        assert!(b.reduce(ReduceKind::Sum, ids[0], &[2], false).is_err());
    }

    #[test]
    fn matmul_dims_follow_dot_general_layout() {
        let (mut b, ids) = builder_with(&[&[4, 2, 3], &[4, 3, 5]]);
        let spec = DotGeneralSpec {
            batch_lhs: vec![0],
            batch_rhs: vec![0],
            contract_lhs: vec![2],
            contract_rhs: vec![1],
        };
        let out = b.dot_general(ids[0], ids[1], spec).unwrap();
        assert_eq!(shape_of(&b, out), vec![4, 2, 5]);
    }

    #[test]
    fn binary_requires_identical_shapes() {
        let (mut b, ids) = builder_with(&[&[2, 3], &[3]]);
        assert!(b.add(ids[0], ids[1]).is_err());
        let widened = b.broadcast_to(ids[1], &Shape::new([2, 3])).unwrap();
        let sum = b.add(ids[0], widened).unwrap();
        assert_eq!(shape_of(&b, sum), vec![2, 3]);
    }

    #[test]
    fn identity_helpers_emit_nothing() {
        let (mut b, ids) = builder_with(&[&[2, 3]]);
        let before = b.instructions().len();
        assert_eq!(b.reshape(ids[0], &Shape::new([2, 3])).unwrap(), ids[0]);
        assert_eq!(b.transpose(ids[0], &[0, 1]).unwrap(), ids[0]);
        assert_eq!(b.pad(ids[0], &[0, 0], &[0, 0], 0.0).unwrap(), ids[0]);
        assert_eq!(b.instructions().len(), before);
    }

    #[test]
    fn patches_and_fold_agree_on_shapes() {
        let (mut b, ids) = builder_with(&[&[1, 4, 4, 2]]);
        let spec = ExtractPatchesSpec {
            window: vec![3, 3],
            strides: vec![1, 1],
            padding: vec![(1, 1), (1, 1)],
            pad_value: 0.0,
        };
        let patches = b.extract_patches(ids[0], spec.clone()).unwrap();
        assert_eq!(shape_of(&b, patches), vec![1, 4, 4, 18]);
        let folded = b
            .fold_patches(patches, spec, &Shape::new([1, 4, 4, 2]))
            .unwrap();
        assert_eq!(shape_of(&b, folded), vec![1, 4, 4, 2]);
    }

    #[test]
    fn slice_and_concat_validate_bounds() {
        let (mut b, ids) = builder_with(&[&[2, 3], &[2, 2]]);
        assert!(b.slice(ids[0], &[1, 0], &[2, 3]).is_err());
        assert!(b.slice(ids[0], &[usize::MAX, 0], &[1, 3]).is_err());
        let joined = b.concat(&[ids[0], ids[1]], 1).unwrap();
        assert_eq!(shape_of(&b, joined), vec![2, 5]);
        assert!(b.concat(&[ids[0], ids[1]], 0).is_err());
    }
}
