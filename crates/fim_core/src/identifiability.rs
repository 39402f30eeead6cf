use crate::eigen::EigenPairs;
use crate::error::{FimError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Heuristic thresholds used to classify parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdentifiabilitySettings {
    /// Eigenvalues at or below `max(1e-12, |λ_max|·tol)` belong to the near-null space.
    pub nullspace_relative_tolerance: f64,
    /// A loading joins a combination once `|loading| ≥ fraction·max|loading|`.
    pub loading_fraction: f64,
    /// Components reaching this fraction of the top loading are listed in
    /// [`NullspaceCombination::highlighted`].
    pub highlight_fraction: f64,
    pub vif_threshold: f64,
    pub max_correlated_pairs: usize,
}

impl Default for IdentifiabilitySettings {
    fn default() -> Self {
        Self {
            nullspace_relative_tolerance: 1e-4,
            loading_fraction: 0.1,
            highlight_fraction: 0.2,
            vif_threshold: 10.0,
            max_correlated_pairs: 20,
        }
    }
}

impl IdentifiabilitySettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.nullspace_relative_tolerance >= 0.0 && self.nullspace_relative_tolerance.is_finite())
        {
            return Err(FimError::invalid_option(
                "nullspace_relative_tolerance",
                "must be finite and non-negative",
            ));
        }
        for (name, value) in [
            ("loading_fraction", self.loading_fraction),
            ("highlight_fraction", self.highlight_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FimError::invalid_option(name, "must lie in [0, 1]"));
            }
        }
        if self.vif_threshold.is_nan() {
            return Err(FimError::invalid_option("vif_threshold", "must not be NaN"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loading {
    pub name: String,
    pub loading: f64,
}

/// A near-null eigenvector restricted to its dominant parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullspaceCombination {
    pub eigenvalue: f64,
    /// Sorted by descending `|loading|`.
    pub components: Vec<Loading>,
    /// Names of the dominant components.
    pub highlighted: Vec<String>,
}

impl NullspaceCombination {
    /// Components whose loading reaches `fraction` of the largest one.
    pub fn components_above(&self, fraction: f64) -> impl Iterator<Item = &Loading> {
        let top = self
            .components
            .first()
            .map_or(0.0, |c| c.loading.abs());
        let cut = top * fraction;
        self.components
            .iter()
            .filter(move |c| c.loading.abs() >= cut)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.iter().any(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedPair {
    pub i: usize,
    pub j: usize,
    pub names: [String; 2],
    pub corr: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Classification {
    pub nullspace_combinations: Vec<NullspaceCombination>,
    pub identifiable: Vec<String>,
    pub unidentifiable: Vec<String>,
    /// Indices of parameters in first-seen order across the combinations.
    pub implicated: Vec<usize>,
}

/// Sweeps eigenvalues from the smallest upwards and stops at the first one
/// above the null threshold.
pub fn classify(
    eigen: &EigenPairs,
    names: &[String],
    settings: &IdentifiabilitySettings,
) -> Classification {
    let null_tol = 1e-12_f64.max(eigen.max().abs() * settings.nullspace_relative_tolerance);
    let mut combinations = Vec::new();
    let mut implicated: Vec<usize> = Vec::new();
    let mut mask = vec![false; names.len()];

    for (lambda, vec) in eigen.values.iter().zip(&eigen.vectors).rev() {
        if *lambda > null_tol {
            break;
        }
        let max_abs = vec
            .iter()
            .filter(|v| v.is_finite())
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let cut = max_abs * settings.loading_fraction;

        let mut components = Vec::new();
        for (i, &value) in vec.iter().enumerate().take(names.len()) {
            if value.is_finite() && value.abs() >= cut {
                components.push(Loading {
                    name: names[i].clone(),
                    loading: value,
                });
                mask[i] = true;
            }
        }
        components.sort_by(|a, b| {
            b.loading
                .abs()
                .partial_cmp(&a.loading.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for component in &components {
            if let Some(idx) = names.iter().position(|n| *n == component.name) {
                if !implicated.contains(&idx) {
                    implicated.push(idx);
                }
            }
        }
        let mut combination = NullspaceCombination {
            eigenvalue: *lambda,
            components,
            highlighted: Vec::new(),
        };
        combination.highlighted = combination
            .components_above(settings.highlight_fraction)
            .map(|c| c.name.clone())
            .collect();
        combinations.push(combination);
    }

    let (identifiable, unidentifiable) = if combinations.is_empty() {
        (names.to_vec(), Vec::new())
    } else {
        let mut identifiable = Vec::new();
        let mut unidentifiable = Vec::new();
        for (name, flagged) in names.iter().zip(&mask) {
            if *flagged {
                unidentifiable.push(name.clone());
            } else {
                identifiable.push(name.clone());
            }
        }
        (identifiable, unidentifiable)
    };

    Classification {
        nullspace_combinations: combinations,
        identifiable,
        unidentifiable,
        implicated,
    }
}

/// All unordered pairs ranked by `|corr|`, truncated to `limit`.
pub fn top_correlated_pairs(
    correlation: &DMatrix<f64>,
    names: &[String],
    limit: usize,
) -> Vec<CorrelatedPair> {
    let n = names.len().min(correlation.nrows());
    let mut pairs = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            pairs.push(CorrelatedPair {
                i,
                j,
                names: [names[i].clone(), names[j].clone()],
                corr: correlation[(i, j)],
            });
        }
    }
    pairs.sort_by(|a, b| {
        b.corr
            .abs()
            .partial_cmp(&a.corr.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    pairs.truncate(limit);
    pairs
}

pub fn high_vif_params(vif: &[f64], names: &[String], threshold: f64) -> Vec<String> {
    vif.iter()
        .zip(names)
        .filter(|(v, _)| **v > threshold)
        .map(|(_, name)| name.clone())
        .collect()
}
