use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Name of the independent-variable column in every trajectory.
pub const TIME_COLUMN: &str = "time";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationMethod {
    /// Follow whatever method the model itself declares.
    Default,
    Ode,
    Ssa,
    Nf,
}

/// Options forwarded verbatim to the simulator on every call.
///
/// Unknown fields are rejected when deserializing so that a misspelled
/// option never silently falls back to a simulator default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationOptions {
    pub method: SimulationMethod,
    pub t_end: f64,
    pub n_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atol: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtol: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solver: Option<String>,
    #[serde(default, alias = "maxSteps", skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,
    #[serde(default, alias = "maxStep", skip_serializing_if = "Option::is_none")]
    pub max_step: Option<f64>,
    #[serde(default, alias = "steadyState")]
    pub steady_state: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            method: SimulationMethod::Ode,
            t_end: 10.0,
            n_steps: 10,
            atol: None,
            rtol: None,
            solver: None,
            max_steps: None,
            max_step: None,
            steady_state: false,
            seed: None,
        }
    }
}

/// Time-indexed simulator output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub headers: Vec<String>,
    pub data: Vec<BTreeMap<String, f64>>,
}

impl Trajectory {
    pub fn new(headers: Vec<String>, data: Vec<BTreeMap<String, f64>>) -> Self {
        Self { headers, data }
    }

    /// Observable columns, excluding `time`.
    ///
    /// Only columns present in the final row count, so a trajectory without
    /// rows has none. Header order wins when headers are present; otherwise
    /// the final row's keys are used.
    pub fn observable_keys(&self) -> Vec<String> {
        let Some(last_row) = self.data.last() else {
            return Vec::new();
        };
        if !self.headers.is_empty() {
            return self
                .headers
                .iter()
                .filter(|h| h.as_str() != TIME_COLUMN && last_row.contains_key(h.as_str()))
                .cloned()
                .collect();
        }
        last_row
            .keys()
            .filter(|k| k.as_str() != TIME_COLUMN)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn value(&self, row: usize, key: &str) -> f64 {
        self.data
            .get(row)
            .and_then(|r| r.get(key))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Fixed flattening of a trajectory into one vector of (timepoint, observable) values.
///
/// With `all_timepoints` the row index of an entry is
/// `time_index * keys.len() + observable_index`; otherwise only the final
/// timepoint of each trajectory contributes.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservableLayout {
    pub keys: Vec<String>,
    pub time_count: usize,
    pub all_timepoints: bool,
}

impl ObservableLayout {
    pub fn from_baseline(baseline: &Trajectory, all_timepoints: bool) -> Self {
        let time_count = if all_timepoints {
            baseline.len().max(1)
        } else {
            1
        };
        Self {
            keys: baseline.observable_keys(),
            time_count,
            all_timepoints,
        }
    }

    pub fn rows(&self) -> usize {
        self.keys.len() * self.time_count
    }

    pub fn row_index(&self, time_index: usize, observable_index: usize) -> usize {
        time_index * self.keys.len() + observable_index
    }

    pub fn flatten(&self, trajectory: &Trajectory) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.rows());
        for ti in 0..self.time_count {
            let row = if self.all_timepoints {
                ti
            } else {
                trajectory.len().saturating_sub(1)
            };
            for key in &self.keys {
                out.push(trajectory.value(row, key));
            }
        }
        out
    }
}

/// Failures reported by a simulator.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Simulation was cancelled.")]
    Cancelled,
    #[error("Simulation failed: {0}")]
    Failed(#[from] anyhow::Error),
}

/// Cooperative cancellation flag shared between a caller and every simulation it issues.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns [`SimulationError::Cancelled`] once the token has been tripped.
    pub fn check(&self) -> Result<(), SimulationError> {
        if self.is_cancelled() {
            Err(SimulationError::Cancelled)
        } else {
            Ok(())
        }
    }
}
