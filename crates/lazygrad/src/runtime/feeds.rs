use std::collections::HashMap;

use crate::graph::Node;

/// Values bound to placeholder nodes for one execution.
#[derive(Debug, Clone, Default)]
pub struct Feeds {
    values: HashMap<Node, Vec<f32>>,
}

impl Feeds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `values` to `placeholder`, replacing any earlier binding.
    pub fn insert(&mut self, placeholder: &Node, values: impl Into<Vec<f32>>) {
        self.values.insert(placeholder.clone(), values.into());
    }

    pub fn with(mut self, placeholder: &Node, values: impl Into<Vec<f32>>) -> Self {
        self.insert(placeholder, values);
        self
    }

    pub fn get(&self, placeholder: &Node) -> Option<&[f32]> {
        self.values.get(placeholder).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
