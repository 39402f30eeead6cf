use crate::simulation::SimulationError;
use thiserror::Error;

/// Errors surfaced by [`crate::analysis::compute_fim`] and the helpers it is built from.
#[derive(Debug, Error)]
pub enum FimError {
    #[error("No parameters specified.")]
    NoParameters,

    #[error("Parameter '{0}' is not defined by the model.")]
    UnknownParameter(String),

    #[error("Parameter '{0}' was requested more than once.")]
    DuplicateParameter(String),

    #[error("No observables found in simulation results to compute sensitivities.")]
    NoObservables,

    #[error("{what} is outside its domain (got {value}).")]
    Domain { what: &'static str, value: f64 },

    #[error("Invalid option {name}: {reason}")]
    InvalidOption {
        name: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Simulation(#[from] SimulationError),
}

impl FimError {
    /// True when the failure originates from a cancelled simulation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FimError::Simulation(SimulationError::Cancelled))
    }

    pub(crate) fn invalid_option(name: &'static str, reason: impl Into<String>) -> Self {
        FimError::InvalidOption {
            name,
            reason: reason.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FimError>;
