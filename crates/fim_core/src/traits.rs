use crate::simulation::{CancelToken, SimulationError, SimulationOptions, Trajectory};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Parameter overrides applied on top of a cached model's baseline values.
pub type ParameterOverrides = BTreeMap<String, f64>;

/// A model exposes its parameters by name. Nothing else about it is inspected.
pub trait ParameterizedModel {
    /// Baseline value of a named parameter, if the model defines it.
    fn parameter(&self, name: &str) -> Option<f64>;
}

/// The simulation backend the identifiability engine drives.
///
/// A model is cached once by `prepare_model` and re-simulated with overrides
/// until `release_model`. Every call receives the caller's [`CancelToken`] and
/// should return [`SimulationError::Cancelled`] once it trips.
#[async_trait]
pub trait Simulator: Send + Sync + 'static {
    type Model: ParameterizedModel + Send + Sync;
    type Handle: Clone + Send + Sync + 'static;

    async fn prepare_model(
        &self,
        model: &Self::Model,
        cancel: &CancelToken,
    ) -> Result<Self::Handle, SimulationError>;

    /// Simulates the cached model. `None` means "no overrides".
    async fn simulate_cached(
        &self,
        handle: &Self::Handle,
        overrides: Option<&ParameterOverrides>,
        options: &SimulationOptions,
        cancel: &CancelToken,
    ) -> Result<Trajectory, SimulationError>;

    /// Best effort; callers log and swallow failures.
    async fn release_model(&self, handle: Self::Handle) -> anyhow::Result<()>;
}

/// Ordered (name, baseline value) pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterVector {
    entries: Vec<(String, f64)>,
}

impl ParameterVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a parameter while preserving first-insertion order.
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for ParameterVector {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        let mut vector = ParameterVector::new();
        for (name, value) in iter {
            vector.set(name, value);
        }
        vector
    }
}

impl ParameterizedModel for ParameterVector {
    fn parameter(&self, name: &str) -> Option<f64> {
        self.get(name)
    }
}
