use crate::identifiability::{CorrelatedPair, NullspaceCombination};
use crate::profile::ProfileScan;
use nalgebra::DMatrix;
use serde::Serialize;

/// Format tag written into every export.
pub const EXPORT_FORMAT: &str = "FIM-v1";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Benchmark {
    pub prepare_model_ms: f64,
    pub total_sim_ms: f64,
    pub sim_count: usize,
    pub total_ms: f64,
    pub per_sim_ms: f64,
}

/// Column of the Jacobian for one parameter, in row-layout order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensitivityProfile {
    pub name: String,
    pub time_profile: Vec<f64>,
}

/// Complete outcome of one identifiability analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FimResult {
    pub param_names: Vec<String>,
    /// Non-increasing.
    pub eigenvalues: Vec<f64>,
    /// `eigenvectors[k]` pairs with `eigenvalues[k]`.
    pub eigenvectors: Vec<Vec<f64>>,
    pub condition_number: f64,
    pub regularized_condition_number: f64,
    pub max_eigenvalue: f64,
    pub min_eigenvalue: f64,
    pub covariance_matrix: Vec<Vec<f64>>,
    pub correlations: Vec<Vec<f64>>,
    pub fim_matrix: Vec<Vec<f64>>,
    pub jacobian: Vec<Vec<f64>>,
    pub observable_keys: Vec<String>,
    pub sensitivity_profiles: Vec<SensitivityProfile>,
    pub identifiable_params: Vec<String>,
    pub unidentifiable_params: Vec<String>,
    pub vif: Vec<f64>,
    #[serde(rename = "highVIFParams")]
    pub high_vif_params: Vec<String>,
    pub nullspace_combinations: Vec<NullspaceCombination>,
    pub top_correlated_pairs: Vec<CorrelatedPair>,
    /// Empty unless profiling was requested.
    pub profiles: Vec<ProfileScan>,
    pub benchmark: Benchmark,
}

impl FimResult {
    pub fn profile(&self, name: &str) -> Option<&ProfileScan> {
        self.profiles.iter().find(|scan| scan.parameter == name)
    }

    pub fn is_identifiable(&self, name: &str) -> bool {
        self.identifiable_params.iter().any(|p| p == name)
    }
}

/// Portable projection of a [`FimResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FimExport {
    pub format: &'static str,
    pub condition_number: f64,
    pub regularized_condition_number: f64,
    pub eigenvalues: Vec<f64>,
    pub eigenvectors: Vec<Vec<f64>>,
    pub covariance: Vec<Vec<f64>>,
    pub correlations: Vec<Vec<f64>>,
    pub fim_matrix: Vec<Vec<f64>>,
    pub jacobian: Vec<Vec<f64>>,
}

impl FimExport {
    /// Non-finite numbers (an infinite condition number, say) become `null`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn export_fim(result: &FimResult) -> FimExport {
    FimExport {
        format: EXPORT_FORMAT,
        condition_number: result.condition_number,
        regularized_condition_number: result.regularized_condition_number,
        eigenvalues: result.eigenvalues.clone(),
        eigenvectors: result.eigenvectors.clone(),
        covariance: result.covariance_matrix.clone(),
        correlations: result.correlations.clone(),
        fim_matrix: result.fim_matrix.clone(),
        jacobian: result.jacobian.clone(),
    }
}

pub(crate) fn to_rows(matrix: &DMatrix<f64>) -> Vec<Vec<f64>> {
    matrix
        .row_iter()
        .map(|row| row.iter().copied().collect())
        .collect()
}
