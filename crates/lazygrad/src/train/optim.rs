use anyhow::Result;

use crate::backend::spec::PortableBackend;
use crate::error::GraphError;
use crate::graph::Node;
use crate::runtime::{Feeds, GradientMap, Runtime};

pub trait Optimizer {
    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32);

    /// Updates every parameter from `gradients`. Either all parameters are written or none.
    fn apply(&mut self, parameters: &[Node], gradients: &GradientMap) -> Result<()>;

    /// One backward pass followed by [`Optimizer::apply`]. The loss is written only once every
    /// parameter has been updated; on error neither the loss nor any parameter changes.
    fn step<B: PortableBackend>(
        &mut self,
        runtime: &Runtime<B>,
        loss: &Node,
        parameters: &[Node],
        feeds: &Feeds,
    ) -> Result<()>
    where
        Self: Sized,
    {
        check_parameters(parameters)?;
        let (loss_values, gradients) = runtime.loss_and_gradients(loss, parameters, feeds)?;
        self.apply(parameters, &gradients)?;
        loss.set_data(loss_values);
        Ok(())
    }
}

/// Every parameter must be a leaf that already holds values.
fn check_parameters(parameters: &[Node]) -> Result<()> {
    for param in parameters {
        if !param.is_leaf() {
            return Err(GraphError::NotALeaf {
                label: param.describe(),
            }
            .into());
        }
        if !param.has_data() {
            return Err(GraphError::MissingData {
                label: param.describe(),
            }
            .into());
        }
    }
    Ok(())
}

/// Plain gradient descent on host-resident parameter data.
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Sgd { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn apply(&mut self, parameters: &[Node], gradients: &GradientMap) -> Result<()> {
        check_parameters(parameters)?;
        let mut updates = Vec::with_capacity(parameters.len());
        for param in parameters {
            let label = param.describe();
            let mut values = param
                .data()
                .ok_or_else(|| GraphError::MissingData {
                    label: label.clone(),
                })?;
            // An absent entry means no dependency, which leaves the value unchanged.
            if let Some(grad) = gradients.get(param) {
                if grad.len() != values.len() {
                    return Err(GraphError::DimensionMismatch {
                        label,
                        expected: values.len(),
                        actual: grad.len(),
                    }
                    .into());
                }
                for (value, g) in values.iter_mut().zip(grad) {
                    *value -= self.learning_rate * g;
                }
            }
            updates.push(values);
        }
        for (param, values) in parameters.iter().zip(updates) {
            param.set_data(values);
        }
        Ok(())
    }
}

/// Single SGD step with an explicit learning rate.
pub fn step<B: PortableBackend>(
    runtime: &Runtime<B>,
    loss: &Node,
    parameters: &[Node],
    learning_rate: f32,
    feeds: &Feeds,
) -> Result<()> {
    Sgd::new(learning_rate).step(runtime, loss, parameters, feeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphArena;
    use crate::ops::functional::NodeOps;

    #[test]
    fn apply_follows_the_update_law() {
        let arena = GraphArena::new();
        let w = arena.parameter("w", vec![1.0, -2.0, 0.5], &[3]).unwrap();
        let mut grads = GradientMap::new();
        grads.insert(w.clone(), vec![0.5, 0.25, -1.0]);

        Sgd::new(0.1).apply(&[w.clone()], &grads).unwrap();
        let expected: Vec<f32> = [1.0f32, -2.0, 0.5]
            .iter()
            .zip([0.5f32, 0.25, -1.0])
            .map(|(v, g)| v - 0.1 * g)
            .collect();
        assert_eq!(w.data().unwrap(), expected);
    }

    #[test]
    fn mismatched_gradient_leaves_every_parameter_untouched() {
        let arena = GraphArena::new();
        let a = arena.parameter("a", vec![1.0, 1.0], &[2]).unwrap();
        let b = arena.parameter("b", vec![2.0, 2.0], &[2]).unwrap();
        let mut grads = GradientMap::new();
        grads.insert(a.clone(), vec![1.0, 1.0]);
        grads.insert(b.clone(), vec![1.0]);

        let err = Sgd::new(1.0).apply(&[a.clone(), b.clone()], &grads).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::DimensionMismatch { expected: 2, actual: 1, .. })
        ));
        assert_eq!(a.data().unwrap(), vec![1.0, 1.0]);
        assert_eq!(b.data().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn data_less_parameter_is_reported() {
        let arena = GraphArena::new();
        let p = arena.placeholder("p", &[2]).unwrap();
        let err = Sgd::new(1.0).apply(&[p], &GradientMap::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::MissingData { label }) if label == "p"
        ));
    }

    #[test]
    fn computed_nodes_are_not_parameters() {
        let arena = GraphArena::new();
        let w = arena.parameter("w", vec![1.0], &[1]).unwrap();
        let doubled = w.mul_scalar(2.0).unwrap().named("doubled");
        let mut grads = GradientMap::new();
        grads.insert(doubled.clone(), vec![1.0]);

        let err = Sgd::new(0.1).apply(&[w.clone(), doubled], &grads).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::NotALeaf { label }) if label == "doubled"
        ));
        assert_eq!(w.data().unwrap(), vec![1.0]);
    }
}
