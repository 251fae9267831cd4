//! Execution entry points: forward materialisation and the backward pass.
//!
//! A [`Runtime`] owns the backend it submits to. Every call lowers the requested nodes from
//! scratch, submits exactly one program, and only writes host data back after every result has
//! been read successfully.

mod config;
mod feeds;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{debug, trace, warn};

use crate::backend::spec::{PortableBackend, Program, TensorLiteral, TensorSpec, ValueId};
use crate::backend::topology::validate_function_topology;
use crate::error::GraphError;
use crate::graph::{GraphBuilder, LoweredGraph, Node};

pub use config::RuntimeConfig;
pub use feeds::Feeds;

/// Gradient buffers keyed by parameter node.
pub type GradientMap = HashMap<Node, Vec<f32>>;

/// A requested program result and where diagnostics should point.
struct Target {
    value: ValueId,
    label: String,
    expected: usize,
}

pub struct Runtime<B: PortableBackend> {
    backend: Arc<B>,
    config: RuntimeConfig,
}

impl<B: PortableBackend> Runtime<B> {
    /// Runtime configured from [`RuntimeConfig::from_env`].
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_config(backend, RuntimeConfig::from_env())
    }

    pub fn with_config(backend: Arc<B>, config: RuntimeConfig) -> Self {
        Runtime { backend, config }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Computes every root and stores the values in each root's `data`.
    ///
    /// Leaf roots are left as they are: a placeholder stays unbound so later feeds still apply.
    pub fn run(&self, roots: &[&Node], feeds: &Feeds) -> Result<()> {
        let outputs = self.forward(roots, feeds)?;
        for (root, values) in roots.iter().zip(outputs) {
            if !root.is_leaf() {
                root.set_data(values);
            }
        }
        Ok(())
    }

    /// Runs `node` alone and returns its values.
    pub fn evaluate(&self, node: &Node, feeds: &Feeds) -> Result<Vec<f32>> {
        let mut outputs = self.forward(&[node], feeds)?;
        let values = outputs.pop().ok_or_else(|| GraphError::MissingResult {
            label: node.describe(),
        })?;
        if !node.is_leaf() {
            node.set_data(values.clone());
        }
        Ok(values)
    }

    fn forward(&self, roots: &[&Node], feeds: &Feeds) -> Result<Vec<Vec<f32>>> {
        let lowered = GraphBuilder::build(roots)?;
        let mut targets = Vec::with_capacity(roots.len());
        for root in roots {
            targets.push(Target {
                value: lowered.value_of(root)?,
                label: root.describe(),
                expected: root.element_count(),
            });
        }
        self.execute(lowered, &targets, feeds)
    }

    /// Gradients of `loss` with respect to each parameter, computed in the same submission as
    /// the forward pass. The forward loss value is written to `loss.data`.
    ///
    /// A parameter that `loss` does not depend on gets a zero buffer.
    pub fn backward(&self, loss: &Node, parameters: &[Node], feeds: &Feeds) -> Result<GradientMap> {
        let (loss_values, gradients) = self.loss_and_gradients(loss, parameters, feeds)?;
        loss.set_data(loss_values);
        Ok(gradients)
    }

    /// [`Runtime::backward`] without touching any node; the forward loss is returned instead.
    pub(crate) fn loss_and_gradients(
        &self,
        loss: &Node,
        parameters: &[Node],
        feeds: &Feeds,
    ) -> Result<(Vec<f32>, GradientMap)> {
        for param in parameters {
            if !param.same_graph(loss) {
                return Err(GraphError::ParameterNotInGraph {
                    label: param.describe(),
                }
                .into());
            }
        }

        let mut lowered = GraphBuilder::build(&[loss])?;
        let loss_value = lowered
            .value_of(loss)
            .map_err(|_| GraphError::EmptyGraph)?;

        // Parameters outside the loss's ancestry have no lowered value at all.
        let wrt: Vec<ValueId> = parameters
            .iter()
            .filter_map(|param| lowered.mapping.get(&param.id()).copied())
            .collect();
        let grads = self
            .backend
            .gradients(&mut lowered.program, loss_value, &wrt)
            .map_err(GraphError::Backend)?;

        let mut targets = vec![Target {
            value: loss_value,
            label: loss.describe(),
            expected: loss.element_count(),
        }];
        let mut slots = Vec::with_capacity(parameters.len());
        for param in parameters {
            let grad = lowered
                .mapping
                .get(&param.id())
                .and_then(|value| grads.get(value));
            match grad {
                Some(&grad) => {
                    slots.push(Some(targets.len()));
                    targets.push(Target {
                        value: grad,
                        label: format!("d/d {}", param.describe()),
                        expected: param.element_count(),
                    });
                }
                // No dependency: the gradient is defined to be zero.
                None => slots.push(None),
            }
        }

        let mut outputs = self.execute(lowered, &targets, feeds)?;
        let mut gradients = GradientMap::with_capacity(parameters.len());
        for (param, slot) in parameters.iter().zip(slots) {
            let buffer = match slot {
                Some(index) => std::mem::take(&mut outputs[index]),
                None => vec![0.0; param.element_count()],
            };
            gradients.insert(param.clone(), buffer);
        }
        let loss_values = std::mem::take(&mut outputs[0]);
        Ok((loss_values, gradients))
    }

    /// Binds feeds, finishes the program with `targets` as results, runs it once, and reads
    /// every result back. Nothing is written to nodes here.
    fn execute(
        &self,
        lowered: LoweredGraph,
        targets: &[Target],
        feeds: &Feeds,
    ) -> Result<Vec<Vec<f32>>> {
        let LoweredGraph {
            program,
            placeholders,
            node_count,
            ..
        } = lowered;

        let mut inputs = Vec::with_capacity(placeholders.len());
        for (node, _) in &placeholders {
            let label = node.describe();
            let values = feeds
                .get(node)
                .ok_or_else(|| GraphError::MissingFeed {
                    label: label.clone(),
                })?;
            let shape = node.shape();
            let expected = shape.element_count().unwrap_or(0);
            if values.len() != expected {
                return Err(GraphError::DimensionMismatch {
                    label,
                    expected,
                    actual: values.len(),
                }
                .into());
            }
            let literal = TensorLiteral::from_f32(TensorSpec::new(shape), values);
            inputs.push(self.backend.materialize(literal).map_err(GraphError::Backend)?);
        }

        let result_ids = targets.iter().map(|target| target.value).collect();
        let function = program
            .finish(self.config.entry_name.clone(), result_ids)
            .map_err(GraphError::Backend)?;
        if self.config.verify_programs {
            validate_function_topology(&function).map_err(GraphError::InvalidProgram)?;
        }
        let program = Program::new(self.config.entry_name.clone()).with_functions(vec![function]);
        if self.config.trace_programs && log::log_enabled!(log::Level::Trace) {
            match program.to_json_string() {
                Ok(json) => trace!("lowered program: {json}"),
                Err(err) => warn!("failed to serialise lowered program: {err}"),
            }
        }

        let start = Instant::now();
        let handles = self
            .backend
            .run_program(&program, &inputs)
            .map_err(GraphError::Backend)?;
        debug!(
            "{} executed {} nodes with {} inputs and {} results in {:?}",
            self.backend.backend_name(),
            node_count,
            inputs.len(),
            targets.len(),
            start.elapsed()
        );

        let mut outputs = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            let missing = || GraphError::MissingResult {
                label: target.label.clone(),
            };
            let handle = handles.get(index).ok_or_else(missing)?;
            let values = self
                .backend
                .to_literal(handle)
                .and_then(|literal| literal.to_f32_vec())
                .map_err(|err| {
                    debug!("reading back `{}` failed: {err}", target.label);
                    missing()
                })?;
            if values.len() != target.expected {
                return Err(missing().into());
            }
            outputs.push(values);
        }
        Ok(outputs)
    }
}
