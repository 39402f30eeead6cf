use crate::eigen::{EigenPairs, FallbackEigensolver, SymmetricEigensolver};
use nalgebra::DMatrix;

/// Everything derived from `F = JᵀJ`.
#[derive(Debug, Clone)]
pub struct InformationSummary {
    pub fim: DMatrix<f64>,
    pub eigen: EigenPairs,
    /// `λ_max / λ_min`, or `+∞` unless both are positive.
    pub condition_number: f64,
    /// Always finite: the denominator is floored at `max(|λ_max|·1e-12, 1e-16)`.
    pub regularized_condition_number: f64,
    pub covariance: DMatrix<f64>,
    pub correlation: DMatrix<f64>,
    pub vif: Vec<f64>,
}

/// `JᵀJ`, computed on the upper triangle and mirrored.
pub fn fisher_information(jacobian: &DMatrix<f64>) -> DMatrix<f64> {
    let p = jacobian.ncols();
    let mut fim = DMatrix::zeros(p, p);
    for i in 0..p {
        let ci = jacobian.column(i);
        for j in i..p {
            let sum = ci.dot(&jacobian.column(j));
            fim[(i, j)] = sum;
            fim[(j, i)] = sum;
        }
    }
    fim
}

pub fn condition_numbers(eigen: &EigenPairs) -> (f64, f64) {
    let max_eig = eigen.max();
    let min_eig = eigen.min();
    let raw = if max_eig > 0.0 && min_eig > 0.0 {
        max_eig / min_eig
    } else {
        f64::INFINITY
    };
    let floor = (max_eig.abs() * 1e-12).max(1e-16);
    let regularized = max_eig / min_eig.max(floor);
    (raw, regularized)
}

/// Normalizes a covariance matrix. Entries whose variances are not both positive are zero.
pub fn correlation_from_covariance(covariance: &DMatrix<f64>) -> DMatrix<f64> {
    let n = covariance.nrows();
    DMatrix::from_fn(n, n, |i, j| {
        let var_i = covariance[(i, i)];
        let var_j = covariance[(j, j)];
        if var_i > 0.0 && var_j > 0.0 {
            covariance[(i, j)] / (var_i * var_j).sqrt()
        } else {
            0.0
        }
    })
}

/// Diagonal of the pseudo-inverted correlation matrix, from its own decomposition.
pub fn variance_inflation_factors<P: SymmetricEigensolver>(
    correlation: &DMatrix<f64>,
    solver: &FallbackEigensolver<P>,
) -> Vec<f64> {
    let inverse = solver.decompose_or_fallback(correlation).pseudo_inverse();
    (0..inverse.nrows())
        .map(|i| {
            let v = inverse[(i, i)];
            if v.is_finite() {
                v
            } else {
                f64::INFINITY
            }
        })
        .collect()
}

pub fn analyze_information<P: SymmetricEigensolver>(
    jacobian: &DMatrix<f64>,
    solver: &FallbackEigensolver<P>,
) -> InformationSummary {
    let fim = fisher_information(jacobian);
    let eigen = solver.decompose_or_fallback(&fim);
    let (condition_number, regularized_condition_number) = condition_numbers(&eigen);
    let covariance = eigen.pseudo_inverse();
    let correlation = correlation_from_covariance(&covariance);
    let vif = variance_inflation_factors(&correlation, solver);

    InformationSummary {
        fim,
        eigen,
        condition_number,
        regularized_condition_number,
        covariance,
        correlation,
        vif,
    }
}
