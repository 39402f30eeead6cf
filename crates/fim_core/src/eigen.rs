use anyhow::{bail, Result};
use nalgebra::{DMatrix, SymmetricEigen};
use serde::Serialize;

/// Eigenvalues sorted descending, each paired with its unit eigenvector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EigenPairs {
    pub values: Vec<f64>,
    /// `vectors[k]` is the eigenvector belonging to `values[k]`.
    pub vectors: Vec<Vec<f64>>,
}

impl EigenPairs {
    /// Builds sorted pairs from unsorted eigenvalues and a matrix whose columns are eigenvectors.
    pub fn from_columns(values: &[f64], columns: &DMatrix<f64>) -> Self {
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&a, &b| {
            values[b]
                .partial_cmp(&values[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let sorted_values = order.iter().map(|&k| values[k]).collect();
        let vectors = order
            .iter()
            .map(|&k| columns.column(k).iter().copied().collect())
            .collect();
        Self {
            values: sorted_values,
            vectors,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn max(&self) -> f64 {
        self.values.first().copied().unwrap_or(0.0)
    }

    pub fn min(&self) -> f64 {
        self.values.last().copied().unwrap_or(0.0)
    }

    /// Moore-Penrose style inverse `Σ v vᵀ / λ` over eigenvalues above
    /// `max(1e-12, |λ_max|·1e-12)`; directions below the cut are dropped.
    pub fn pseudo_inverse(&self) -> DMatrix<f64> {
        let n = self.vectors.first().map_or(0, Vec::len);
        let threshold = 1e-12_f64.max(self.max().abs() * 1e-12);
        let mut inverse = DMatrix::zeros(n, n);
        for (lambda, vec) in self.values.iter().zip(&self.vectors) {
            if *lambda <= threshold {
                continue;
            }
            for i in 0..n {
                for j in 0..n {
                    inverse[(i, j)] += vec[i] * vec[j] / lambda;
                }
            }
        }
        inverse
    }

    fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
            && self.vectors.iter().flatten().all(|v| v.is_finite())
    }
}

/// Strategy for decomposing a real symmetric matrix.
pub trait SymmetricEigensolver {
    fn decompose(&self, matrix: &DMatrix<f64>) -> Result<EigenPairs>;
}

/// Library-backed solver (`nalgebra::SymmetricEigen`).
#[derive(Debug, Clone, Copy)]
pub struct NalgebraEigensolver {
    pub eps: f64,
    /// Zero means no iteration limit.
    pub max_iterations: usize,
}

impl Default for NalgebraEigensolver {
    fn default() -> Self {
        Self {
            eps: f64::EPSILON,
            max_iterations: 1000,
        }
    }
}

impl SymmetricEigensolver for NalgebraEigensolver {
    fn decompose(&self, matrix: &DMatrix<f64>) -> Result<EigenPairs> {
        if !matrix.is_square() {
            bail!(
                "Eigendecomposition requires a square matrix, got {}x{}.",
                matrix.nrows(),
                matrix.ncols()
            );
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            bail!("Matrix contains non-finite entries.");
        }
        let Some(eig) = SymmetricEigen::try_new(matrix.clone(), self.eps, self.max_iterations)
        else {
            bail!("Symmetric eigendecomposition did not converge.");
        };
        let values: Vec<f64> = eig.eigenvalues.iter().copied().collect();
        let pairs = EigenPairs::from_columns(&values, &eig.eigenvectors);
        if !pairs.is_finite() {
            bail!("Symmetric eigendecomposition produced non-finite output.");
        }
        Ok(pairs)
    }
}

/// Cyclic Jacobi rotations: zero the largest off-diagonal entry until it
/// drops below `tolerance` or the iteration budget is spent.
#[derive(Debug, Clone, Copy)]
pub struct JacobiEigensolver {
    pub tolerance: f64,
    /// Defaults to `max(100, 20·n)` when unset.
    pub max_iterations: Option<usize>,
}

impl Default for JacobiEigensolver {
    fn default() -> Self {
        Self {
            tolerance: 1e-12,
            max_iterations: None,
        }
    }
}

impl JacobiEigensolver {
    pub fn decompose_symmetric(&self, matrix: &DMatrix<f64>) -> EigenPairs {
        self.rotate(matrix).0
    }

    /// Decomposition plus the number of rotations applied.
    fn rotate(&self, matrix: &DMatrix<f64>) -> (EigenPairs, usize) {
        let n = matrix.nrows().min(matrix.ncols());
        let mut a = matrix.view((0, 0), (n, n)).into_owned();
        let mut v = DMatrix::<f64>::identity(n, n);
        let max_iter = self.max_iterations.unwrap_or_else(|| 100.max(20 * n));
        let mut rotations = 0;

        for _ in 0..max_iter {
            let Some((max, p, q)) = largest_off_diagonal(&a) else {
                break;
            };
            if max < self.tolerance {
                break;
            }

            let app = a[(p, p)];
            let aqq = a[(q, q)];
            let apq = a[(p, q)];
            let phi = 0.5 * (2.0 * apq).atan2(aqq - app);
            let (s, c) = phi.sin_cos();

            for i in 0..n {
                if i != p && i != q {
                    let aip = a[(i, p)];
                    let aiq = a[(i, q)];
                    a[(i, p)] = c * aip - s * aiq;
                    a[(p, i)] = a[(i, p)];
                    a[(i, q)] = s * aip + c * aiq;
                    a[(q, i)] = a[(i, q)];
                }
            }
            a[(p, p)] = c * c * app - 2.0 * s * c * apq + s * s * aqq;
            a[(q, q)] = s * s * app + 2.0 * s * c * apq + c * c * aqq;
            a[(p, q)] = 0.0;
            a[(q, p)] = 0.0;
            rotations += 1;

            for i in 0..n {
                let vip = v[(i, p)];
                let viq = v[(i, q)];
                v[(i, p)] = c * vip - s * viq;
                v[(i, q)] = s * vip + c * viq;
            }
        }

        let values: Vec<f64> = (0..n).map(|i| a[(i, i)]).collect();
        (EigenPairs::from_columns(&values, &v), rotations)
    }
}

impl SymmetricEigensolver for JacobiEigensolver {
    fn decompose(&self, matrix: &DMatrix<f64>) -> Result<EigenPairs> {
        Ok(self.decompose_symmetric(matrix))
    }
}

fn largest_off_diagonal(a: &DMatrix<f64>) -> Option<(f64, usize, usize)> {
    let n = a.nrows();
    if n < 2 {
        return None;
    }
    let mut best = (0.0, 0, 1);
    for i in 0..n {
        for j in (i + 1)..n {
            let value = a[(i, j)].abs();
            if value > best.0 {
                best = (value, i, j);
            }
        }
    }
    Some(best)
}

/// Tries `primary` and silently switches to Jacobi rotations on any failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackEigensolver<P = NalgebraEigensolver> {
    pub primary: P,
    pub fallback: JacobiEigensolver,
}

impl<P: SymmetricEigensolver> FallbackEigensolver<P> {
    pub fn new(primary: P, fallback: JacobiEigensolver) -> Self {
        Self { primary, fallback }
    }

    /// Never fails; the fallback path always produces a decomposition.
    pub fn decompose_or_fallback(&self, matrix: &DMatrix<f64>) -> EigenPairs {
        match self.primary.decompose(matrix) {
            Ok(pairs) if pairs.len() == matrix.nrows() => pairs,
            Ok(pairs) => {
                tracing::debug!(
                    expected = matrix.nrows(),
                    got = pairs.len(),
                    "primary eigensolver returned too few pairs; using Jacobi"
                );
                self.fallback.decompose_symmetric(matrix)
            }
            Err(err) => {
                tracing::debug!(error = %err, "primary eigensolver failed; using Jacobi");
                self.fallback.decompose_symmetric(matrix)
            }
        }
    }
}

impl<P: SymmetricEigensolver> SymmetricEigensolver for FallbackEigensolver<P> {
    fn decompose(&self, matrix: &DMatrix<f64>) -> Result<EigenPairs> {
        Ok(self.decompose_or_fallback(matrix))
    }
}
