//! Error taxonomy for graph construction, lowering, execution, and optimization.
//!
//! Public entry points return `anyhow::Result`; callers recover the kind with
//! `err.downcast_ref::<GraphError>()`.

use thiserror::Error;

use crate::backend::spec::BackendError;
use crate::backend::topology::TopologyError;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cannot build a graph without roots")]
    EmptyGraph,
    #[error("node `{label}` has no lowered value; graph ordering is inconsistent")]
    MissingMapping { label: String },
    #[error("operator {op} on `{label}` expects {expected} inputs, got {actual}")]
    Arity {
        label: String,
        op: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("lowering {op} for `{label}` failed: {source}")]
    Operator {
        label: String,
        op: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("{op}: {detail}")]
    Shape { op: &'static str, detail: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("lowered program is malformed: {0}")]
    InvalidProgram(#[from] TopologyError),
    #[error("backend returned no usable result for `{label}`")]
    MissingResult { label: String },
    #[error("`{label}` expects {expected} elements, got {actual}")]
    DimensionMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("shape {shape:?} of `{label}` must be non-empty with positive extents")]
    InvalidShape { label: String, shape: Vec<usize> },
    #[error("`{label}` of shape {shape:?} needs {expected} values, got {actual}")]
    ElementCount {
        label: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("node `{label}` belongs to a different graph")]
    ForeignNode { label: String },
    #[error("no feed provided for placeholder `{label}`")]
    MissingFeed { label: String },
    #[error("parameter `{label}` is not part of the graph")]
    ParameterNotInGraph { label: String },
    #[error("parameter `{label}` holds no data to update")]
    MissingData { label: String },
    #[error("parameter `{label}` is computed by an operator and cannot be updated")]
    NotALeaf { label: String },
}
