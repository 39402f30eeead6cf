use crate::error::{FimError, Result};
use crate::numeric::chi_square_quantile;
use crate::optimize::{nelder_mead, NelderMeadSettings};
use crate::session::SimulationSession;
use crate::simulation::ObservableLayout;
use crate::traits::{ParameterOverrides, Simulator};
use serde::{Deserialize, Serialize};

/// Multiplicative grid around a positive baseline.
pub const POSITIVE_GRID_FACTORS: [f64; 9] = [0.2, 0.5, 0.8, 0.9, 1.0, 1.1, 1.5, 2.0, 5.0];
/// Additive grid around a zero or negative baseline.
pub const NON_POSITIVE_GRID_DELTAS: [f64; 7] = [-1e-2, -1e-3, -1e-4, 0.0, 1e-4, 1e-3, 1e-2];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileSettings {
    /// At most this many implicated parameters are profiled.
    pub max_parameters: usize,
    /// Significance level of the reported interval.
    pub alpha: f64,
    /// Relative SSR spread below which a profile is called flat.
    pub flat_tolerance: f64,
    pub optimizer: NelderMeadSettings,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            max_parameters: 8,
            alpha: 0.05,
            flat_tolerance: 1e-2,
            optimizer: NelderMeadSettings::default(),
        }
    }
}

impl ProfileSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(FimError::invalid_option("alpha", "must lie in (0, 1)"));
        }
        if !(self.flat_tolerance >= 0.0) {
            return Err(FimError::invalid_option(
                "flat_tolerance",
                "must be non-negative",
            ));
        }
        self.optimizer.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

/// One-dimensional SSR profile of a single parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileScan {
    pub parameter: String,
    pub grid: Vec<f64>,
    pub ssr: Vec<f64>,
    pub min: f64,
    pub flat: bool,
    pub alpha: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci: Option<ConfidenceInterval>,
}

pub fn profile_grid(baseline: f64) -> Vec<f64> {
    if baseline > 0.0 {
        POSITIVE_GRID_FACTORS.iter().map(|f| baseline * f).collect()
    } else {
        NON_POSITIVE_GRID_DELTAS.iter().map(|d| baseline + d).collect()
    }
}

pub fn sum_squared_residuals(values: &[f64], reference: &[f64]) -> f64 {
    values
        .iter()
        .zip(reference)
        .map(|(v, r)| (v - r) * (v - r))
        .sum()
}

pub fn is_flat(ssr: &[f64], tolerance: f64) -> bool {
    let min = ssr.iter().copied().fold(f64::INFINITY, f64::min);
    let max = ssr.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (max - min) / (min.abs() + 1e-12) < tolerance
}

/// Likelihood-ratio interval: every grid point whose SSR stays within
/// `chi_square_quantile(1-α, 1)` of the SSR nearest the baseline.
pub fn confidence_interval(
    grid: &[f64],
    ssr: &[f64],
    baseline: f64,
    alpha: f64,
) -> Result<Option<ConfidenceInterval>> {
    if grid.is_empty() || grid.len() != ssr.len() {
        return Ok(None);
    }
    let nearest = grid
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - baseline)
                .abs()
                .partial_cmp(&(*b - baseline).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map_or(0, |(idx, _)| idx);
    let min = ssr.iter().copied().fold(f64::INFINITY, f64::min);
    let reference = if ssr[nearest].is_finite() {
        ssr[nearest]
    } else {
        min
    };
    let threshold = reference + chi_square_quantile(1.0 - alpha, 1)?;

    let accepted = grid
        .iter()
        .zip(ssr)
        .filter(|(_, s)| **s <= threshold)
        .map(|(x, _)| *x);
    let mut bounds: Option<ConfidenceInterval> = None;
    for x in accepted {
        bounds = Some(match bounds {
            None => ConfidenceInterval { lower: x, upper: x },
            Some(ci) => ConfidenceInterval {
                lower: ci.lower.min(x),
                upper: ci.upper.max(x),
            },
        });
    }
    Ok(bounds)
}

/// Profiles the parameters at `targets` (indices into `parameters`), in order.
pub async fn profile_parameters<S: Simulator>(
    session: &SimulationSession<S>,
    parameters: &[(String, f64)],
    targets: &[usize],
    layout: &ObservableLayout,
    baseline_values: &[f64],
    reoptimize: bool,
    settings: &ProfileSettings,
) -> Result<Vec<ProfileScan>> {
    let mut scans = Vec::with_capacity(targets.len().min(settings.max_parameters));
    for &target in targets.iter().take(settings.max_parameters) {
        let (name, baseline) = &parameters[target];
        let grid = profile_grid(*baseline);
        let mut ssr = Vec::with_capacity(grid.len());

        for &value in &grid {
            session.cancel_token().check()?;
            let point = if reoptimize {
                reoptimize_at_fixed(
                    session,
                    parameters,
                    target,
                    value,
                    layout,
                    baseline_values,
                    &settings.optimizer,
                )
                .await?
            } else {
                let mut overrides = ParameterOverrides::new();
                overrides.insert(name.clone(), value);
                let trajectory = session.simulate(Some(&overrides)).await?;
                sum_squared_residuals(&layout.flatten(&trajectory), baseline_values)
            };
            ssr.push(point);
        }

        let min = ssr.iter().copied().fold(f64::INFINITY, f64::min);
        let flat = is_flat(&ssr, settings.flat_tolerance);
        let ci = confidence_interval(&grid, &ssr, *baseline, settings.alpha)?;
        tracing::debug!(parameter = %name, min, flat, has_ci = ci.is_some(), "profile scanned");
        scans.push(ProfileScan {
            parameter: name.clone(),
            grid,
            ssr,
            min,
            flat,
            alpha: settings.alpha,
            ci,
        });
    }
    Ok(scans)
}

/// Holds `parameters[fixed]` at `value` and minimizes SSR over the others.
async fn reoptimize_at_fixed<S: Simulator>(
    session: &SimulationSession<S>,
    parameters: &[(String, f64)],
    fixed: usize,
    value: f64,
    layout: &ObservableLayout,
    baseline_values: &[f64],
    settings: &NelderMeadSettings,
) -> Result<f64> {
    let free: Vec<usize> = (0..parameters.len()).filter(|&i| i != fixed).collect();
    let x0: Vec<f64> = free.iter().map(|&i| parameters[i].1).collect();

    let objective = move |x: Vec<f64>| {
        let mut overrides: ParameterOverrides = parameters
            .iter()
            .map(|(name, v)| (name.clone(), *v))
            .collect();
        overrides.insert(parameters[fixed].0.clone(), value);
        for (&idx, v) in free.iter().zip(&x) {
            overrides.insert(parameters[idx].0.clone(), *v);
        }
        async move {
            let trajectory = session.simulate(Some(&overrides)).await?;
            Ok::<f64, FimError>(sum_squared_residuals(
                &layout.flatten(&trajectory),
                baseline_values,
            ))
        }
    };

    let outcome = nelder_mead(objective, &x0, settings).await?;
    Ok(outcome.fx)
}
