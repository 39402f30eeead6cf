use crate::error::{FimError, Result};
use crate::session::SimulationSession;
use crate::simulation::{ObservableLayout, Trajectory};
use crate::traits::{ParameterOverrides, Simulator};
use nalgebra::DMatrix;

/// Relative step for derivatives with respect to `ln(θ)`.
pub const LOG_RELATIVE_STEP: f64 = 1e-4;
/// Relative step for plain additive derivatives.
pub const ADDITIVE_RELATIVE_STEP: f64 = 1e-4;
/// Floor on the additive step.
pub const MIN_ADDITIVE_STEP: f64 = 1e-8;

/// Central-difference stencil for one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Perturbation {
    /// `θ(1 ± r)`; the quotient is a derivative in `ln θ`.
    Log { plus: f64, minus: f64, rel: f64 },
    /// `θ ± eps`, with the lower point clamped at zero.
    Additive { plus: f64, minus: f64, eps: f64 },
}

impl Perturbation {
    pub fn for_value(value: f64, use_log: bool) -> Self {
        if use_log && value > 0.0 {
            let rel = LOG_RELATIVE_STEP;
            Perturbation::Log {
                plus: value * (1.0 + rel),
                minus: value * (1.0 - rel).max(0.0),
                rel,
            }
        } else {
            let eps = MIN_ADDITIVE_STEP.max(value.abs() * ADDITIVE_RELATIVE_STEP);
            Perturbation::Additive {
                plus: value + eps,
                minus: (value - eps).max(0.0),
                eps,
            }
        }
    }

    pub fn plus(&self) -> f64 {
        match *self {
            Perturbation::Log { plus, .. } | Perturbation::Additive { plus, .. } => plus,
        }
    }

    pub fn minus(&self) -> f64 {
        match *self {
            Perturbation::Log { minus, .. } | Perturbation::Additive { minus, .. } => minus,
        }
    }

    /// Difference quotient; non-finite results collapse to zero.
    pub fn derivative(&self, f_plus: f64, f_minus: f64) -> f64 {
        let deriv = match *self {
            Perturbation::Log { rel, .. } => (f_plus - f_minus) / (2.0 * rel),
            Perturbation::Additive { plus, minus, eps } => {
                let span = plus - minus;
                let span = if span == 0.0 { eps } else { span };
                (f_plus - f_minus) / span
            }
        };
        if deriv.is_finite() {
            deriv
        } else {
            0.0
        }
    }
}

/// Jacobian of the flattened observables with respect to the requested parameters.
#[derive(Debug, Clone)]
pub struct Sensitivities {
    /// Rows follow `layout`, columns follow the requested parameter order.
    pub jacobian: DMatrix<f64>,
    pub layout: ObservableLayout,
    pub baseline: Trajectory,
}

/// Runs the baseline, then all `2p` perturbed simulations as one concurrent batch.
pub async fn build_jacobian<S: Simulator>(
    session: &SimulationSession<S>,
    parameters: &[(String, f64)],
    include_all_timepoints: bool,
    use_log_parameters: bool,
) -> Result<Sensitivities> {
    if parameters.is_empty() {
        return Err(FimError::NoParameters);
    }

    let baseline = session.simulate(None).await?;
    let layout = ObservableLayout::from_baseline(&baseline, include_all_timepoints);
    if layout.keys.is_empty() {
        return Err(FimError::NoObservables);
    }

    let stencils: Vec<Perturbation> = parameters
        .iter()
        .map(|(_, value)| Perturbation::for_value(*value, use_log_parameters))
        .collect();

    let mut jobs = Vec::with_capacity(2 * parameters.len());
    for ((name, _), stencil) in parameters.iter().zip(&stencils) {
        jobs.push(single_override(name, stencil.plus()));
        jobs.push(single_override(name, stencil.minus()));
    }
    let results = session.simulate_batch(jobs).await?;

    let mut jacobian = DMatrix::zeros(layout.rows(), parameters.len());
    for (j, stencil) in stencils.iter().enumerate() {
        let f_plus = layout.flatten(&results[2 * j]);
        let f_minus = layout.flatten(&results[2 * j + 1]);
        for (row, (hi, lo)) in f_plus.iter().zip(&f_minus).enumerate() {
            jacobian[(row, j)] = stencil.derivative(*hi, *lo);
        }
    }

    Ok(Sensitivities {
        jacobian,
        layout,
        baseline,
    })
}

pub(crate) fn single_override(name: &str, value: f64) -> ParameterOverrides {
    let mut overrides = ParameterOverrides::new();
    overrides.insert(name.to_string(), value);
    overrides
}
