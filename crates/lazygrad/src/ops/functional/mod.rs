//! Frontend operators that record nodes instead of executing.
//!
//! Every function validates its inputs, computes the output shape, and appends one node to the
//! arena its inputs live in. Nothing runs until a [`Runtime`](crate::Runtime) is asked for
//! results. The [`NodeOps`] extension trait exposes the common operators as methods.

pub mod activation;
pub(crate) mod common;
pub mod conv;
pub mod elementwise;
pub mod encoding;
pub mod linalg;
pub mod loss;
pub mod pooling;
pub mod reduce;
pub mod shape;

pub use activation::*;
pub use common::NodeOps;
pub use conv::*;
pub use elementwise::*;
pub use encoding::*;
pub use linalg::*;
pub use loss::*;
pub use pooling::*;
pub use reduce::*;
pub use shape::*;
