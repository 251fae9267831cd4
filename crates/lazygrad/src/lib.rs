//! Deferred tensor computation with reverse-mode gradients.
//!
//! Build a DAG of [`Node`]s with the operators in [`ops::functional`], then hand the roots to a
//! [`Runtime`] to lower them into a single backend program and materialise the results.
//! [`Runtime::backward`] differentiates a scalar loss and [`train::Sgd`] applies the gradients
//! to parameter nodes on the host.

pub mod backend;
mod env;
pub mod error;
pub mod graph;
pub mod ops;
pub mod runtime;
pub mod train;

pub use backend::spec::{PortableBackend, Shape};
pub use error::GraphError;
pub use graph::{GraphArena, Node};
pub use ops::functional::NodeOps;
pub use runtime::{Feeds, GradientMap, Runtime, RuntimeConfig};
