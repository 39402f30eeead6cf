use crate::error::{FimError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Budget and coefficients for the simplex search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NelderMeadSettings {
    pub max_iter: usize,
    pub max_evals: usize,
    /// Relative vertex offset; used as an absolute offset for zero coordinates.
    pub initial_step: f64,
    /// Stop once the standard deviation of vertex values drops below this.
    pub sd_tolerance: f64,
    pub reflection: f64,
    pub expansion: f64,
    pub contraction: f64,
    pub shrink: f64,
}

impl Default for NelderMeadSettings {
    fn default() -> Self {
        Self {
            max_iter: 30,
            max_evals: 120,
            initial_step: 0.25,
            sd_tolerance: 1e-9,
            reflection: 1.0,
            expansion: 2.0,
            contraction: 0.5,
            shrink: 0.5,
        }
    }
}

impl NelderMeadSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(FimError::invalid_option("max_iter", "must be at least 1"));
        }
        if self.max_evals == 0 {
            return Err(FimError::invalid_option("max_evals", "must be at least 1"));
        }
        if !(self.initial_step > 0.0 && self.initial_step.is_finite()) {
            return Err(FimError::invalid_option(
                "initial_step",
                "must be positive and finite",
            ));
        }
        if !(self.sd_tolerance >= 0.0) {
            return Err(FimError::invalid_option(
                "sd_tolerance",
                "must be non-negative",
            ));
        }
        if !(self.contraction > 0.0 && self.contraction < 1.0) {
            return Err(FimError::invalid_option("contraction", "must lie in (0, 1)"));
        }
        if !(self.shrink > 0.0 && self.shrink < 1.0) {
            return Err(FimError::invalid_option("shrink", "must lie in (0, 1)"));
        }
        if !(self.reflection > 0.0 && self.expansion > self.reflection) {
            return Err(FimError::invalid_option(
                "expansion",
                "must exceed a positive reflection coefficient",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NelderMeadOutcome {
    pub x: Vec<f64>,
    pub fx: f64,
    pub iterations: usize,
    pub evaluations: usize,
}

/// `x0` plus one vertex per coordinate, offset by `step·|x_i|` (or `step` when `x_i` is zero).
pub fn initial_simplex(x0: &[f64], step: f64) -> Vec<Vec<f64>> {
    let mut vertices = Vec::with_capacity(x0.len() + 1);
    vertices.push(x0.to_vec());
    for i in 0..x0.len() {
        let mut vertex = x0.to_vec();
        vertex[i] += if x0[i].abs() > 0.0 {
            x0[i].abs() * step
        } else {
            step
        };
        vertices.push(vertex);
    }
    vertices
}

/// Derivative-free minimization of an asynchronous objective.
///
/// Evaluations run strictly one after another; each reflection depends on the
/// previous result. Any objective error aborts the search immediately. With an
/// empty `x0` the objective is evaluated once.
pub async fn nelder_mead<F, Fut, E>(
    mut objective: F,
    x0: &[f64],
    settings: &NelderMeadSettings,
) -> std::result::Result<NelderMeadOutcome, E>
where
    F: FnMut(Vec<f64>) -> Fut,
    Fut: Future<Output = std::result::Result<f64, E>>,
{
    let n = x0.len();
    if n == 0 {
        let fx = objective(Vec::new()).await?;
        return Ok(NelderMeadOutcome {
            x: Vec::new(),
            fx,
            iterations: 0,
            evaluations: 1,
        });
    }

    let mut simplex = initial_simplex(x0, settings.initial_step);
    let mut fvals = Vec::with_capacity(n + 1);
    for vertex in &simplex {
        fvals.push(objective(vertex.clone()).await?);
    }
    let mut evaluations = simplex.len();
    let mut iterations = 0usize;

    while iterations < settings.max_iter {
        iterations += 1;

        let mut order: Vec<usize> = (0..simplex.len()).collect();
        order.sort_by(|&a, &b| {
            fvals[a]
                .partial_cmp(&fvals[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let best = order[0];
        let worst = order[n];
        let second_worst = order[n - 1];

        let centroid = centroid_excluding(&simplex, worst);
        let toward = |coef: f64| -> Vec<f64> {
            centroid
                .iter()
                .zip(&simplex[worst])
                .map(|(c, w)| c + coef * (c - w))
                .collect()
        };

        let xr = toward(settings.reflection);
        let fr = objective(xr.clone()).await?;
        evaluations += 1;

        if fr < fvals[best] {
            let xe = toward(settings.expansion);
            let fe = objective(xe.clone()).await?;
            evaluations += 1;
            if fe < fr {
                simplex[worst] = xe;
                fvals[worst] = fe;
            } else {
                simplex[worst] = xr;
                fvals[worst] = fr;
            }
        } else if fr < fvals[second_worst] {
            simplex[worst] = xr;
            fvals[worst] = fr;
        } else {
            let xc = toward(-settings.contraction);
            let fc = objective(xc.clone()).await?;
            evaluations += 1;
            if fc < fvals[worst] {
                simplex[worst] = xc;
                fvals[worst] = fc;
            } else {
                let anchor = simplex[best].clone();
                for idx in 0..simplex.len() {
                    if idx == best {
                        continue;
                    }
                    let shrunk: Vec<f64> = anchor
                        .iter()
                        .zip(&simplex[idx])
                        .map(|(b, v)| b + settings.shrink * (v - b))
                        .collect();
                    fvals[idx] = objective(shrunk.clone()).await?;
                    simplex[idx] = shrunk;
                    evaluations += 1;
                }
            }
        }

        if evaluations >= settings.max_evals {
            break;
        }
        if standard_deviation(&fvals) < settings.sd_tolerance {
            break;
        }
    }

    let best = (0..fvals.len())
        .min_by(|&a, &b| {
            fvals[a]
                .partial_cmp(&fvals[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(0);
    Ok(NelderMeadOutcome {
        x: simplex[best].clone(),
        fx: fvals[best],
        iterations,
        evaluations,
    })
}

fn centroid_excluding(simplex: &[Vec<f64>], exclude: usize) -> Vec<f64> {
    let n = simplex[0].len();
    let mut c = vec![0.0; n];
    for (idx, vertex) in simplex.iter().enumerate() {
        if idx == exclude {
            continue;
        }
        for (acc, v) in c.iter_mut().zip(vertex) {
            *acc += v;
        }
    }
    let count = (simplex.len() - 1) as f64;
    for acc in &mut c {
        *acc /= count;
    }
    c
}

fn standard_deviation(values: &[f64]) -> f64 {
    let len = values.len() as f64;
    let mean = values.iter().sum::<f64>() / len;
    (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / len).sqrt()
}

#[cfg(test)]
mod tests {
    use super::{initial_simplex, nelder_mead, NelderMeadSettings};
    use std::convert::Infallible;

    fn quadratic(x: &[f64]) -> f64 {
        (x[0] - 1.0).powi(2) + 2.0 * (x[1] + 0.5).powi(2)
    }

    #[test]
    fn initial_simplex_offsets_each_coordinate() {
        let simplex = initial_simplex(&[2.0, 0.0], 0.25);
        assert_eq!(simplex.len(), 3);
        assert_eq!(simplex[0], vec![2.0, 0.0]);
        assert_eq!(simplex[1], vec![2.5, 0.0]);
        assert_eq!(simplex[2], vec![2.0, 0.25]);
    }

    #[tokio::test]
    async fn minimizes_a_quadratic_bowl() {
        let settings = NelderMeadSettings {
            max_iter: 500,
            max_evals: 2000,
            sd_tolerance: 1e-14,
            ..NelderMeadSettings::default()
        };
        let outcome = nelder_mead(
            |x: Vec<f64>| async move { Ok::<_, Infallible>(quadratic(&x)) },
            &[3.0, 2.0],
            &settings,
        )
        .await
        .unwrap();
        assert!((outcome.x[0] - 1.0).abs() < 1e-3);
        assert!((outcome.x[1] + 0.5).abs() < 1e-3);
        assert!(outcome.fx < 1e-6);
    }

    #[tokio::test]
    async fn respects_evaluation_budget() {
        let settings = NelderMeadSettings::default();
        let mut calls = 0usize;
        let outcome = nelder_mead(
            |x: Vec<f64>| {
                calls += 1;
                async move { Ok::<_, Infallible>(quadratic(&x)) }
            },
            &[30.0, -20.0],
            &settings,
        )
        .await
        .unwrap();
        assert_eq!(calls, outcome.evaluations);
        assert!(outcome.iterations <= settings.max_iter);
        // The last iteration may overshoot by a reflection, a contraction and an n-vertex shrink.
        assert!(outcome.evaluations <= settings.max_evals + 4);
    }

    #[tokio::test]
    async fn objective_errors_abort_the_search() {
        let mut calls = 0usize;
        let result = nelder_mead(
            |_x: Vec<f64>| {
                calls += 1;
                let fail = calls == 4;
                async move {
                    if fail {
                        Err("boom")
                    } else {
                        Ok(1.0)
                    }
                }
            },
            &[1.0, 1.0],
            &NelderMeadSettings::default(),
        )
        .await;
        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(calls, 4);
    }

    #[tokio::test]
    async fn empty_start_point_evaluates_once() {
        let outcome = nelder_mead(
            |_x: Vec<f64>| async { Ok::<_, Infallible>(7.0) },
            &[],
            &NelderMeadSettings::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.fx, 7.0);
        assert_eq!(outcome.evaluations, 1);
    }

    #[test]
    fn default_settings_validate() {
        assert!(NelderMeadSettings::default().validate().is_ok());
        let bad = NelderMeadSettings {
            max_evals: 0,
            ..NelderMeadSettings::default()
        };
        assert!(bad.validate().is_err());
    }
}
