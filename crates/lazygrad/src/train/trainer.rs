use anyhow::Result;

use crate::backend::spec::PortableBackend;
use crate::error::GraphError;
use crate::graph::Node;
use crate::runtime::{Feeds, Runtime};

use super::optim::{Optimizer, Sgd};
use super::schedule::LrSchedule;

pub struct Trainer<B: PortableBackend, S: LrSchedule> {
    pub runtime: Runtime<B>,
    pub parameters: Vec<Node>,
    pub optimizer: Sgd,
    pub schedule: S,
    pub step: usize,
}

impl<B: PortableBackend, S: LrSchedule> Trainer<B, S> {
    pub fn new(runtime: Runtime<B>, parameters: Vec<Node>, schedule: S) -> Self {
        let optimizer = Sgd::new(schedule.learning_rate(0));
        Trainer {
            runtime,
            parameters,
            optimizer,
            schedule,
            step: 0,
        }
    }

    /// Runs one optimizer step and returns the loss computed by that step's forward pass.
    ///
    /// `loss` must reduce to a single element.
    pub fn train_step(&mut self, loss: &Node, feeds: &Feeds) -> Result<f32> {
        let lr = self.schedule.learning_rate(self.step);
        self.optimizer.set_learning_rate(lr);
        self.optimizer
            .step(&self.runtime, loss, &self.parameters, feeds)?;
        let value = loss
            .data()
            .and_then(|values| values.first().copied())
            .ok_or_else(|| GraphError::MissingResult {
                label: loss.describe(),
            })?;
        log::debug!("step {} lr {lr:.6} loss {value:.6}", self.step);
        self.step += 1;
        Ok(value)
    }
}
