use crate::{
    eigen::{FallbackEigensolver, NalgebraEigensolver},
    error::{FimError, Result},
    identifiability::{classify, high_vif_params, top_correlated_pairs, IdentifiabilitySettings},
    information::analyze_information,
    profile::{profile_parameters, ProfileSettings},
    report::{to_rows, Benchmark, FimResult, SensitivityProfile},
    sensitivity::build_jacobian,
    session::SimulationSession,
    simulation::{CancelToken, SimulationOptions},
    traits::{ParameterizedModel, Simulator},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Progress observer: `(completed, total)` simulations.
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FimOptions {
    /// Use every timepoint as a Jacobian row instead of only the final one.
    pub include_all_timepoints: bool,
    /// Differentiate with respect to `ln θ` for positive parameters.
    pub use_log_parameters: bool,
    /// Scan parameters implicated in a nullspace combination.
    pub approx_profile: bool,
    /// Re-optimize the other parameters at every profile grid point.
    pub approx_profile_reopt: bool,
    pub identifiability: IdentifiabilitySettings,
    pub profile: ProfileSettings,
}

impl Default for FimOptions {
    fn default() -> Self {
        Self {
            include_all_timepoints: true,
            use_log_parameters: false,
            approx_profile: false,
            approx_profile_reopt: false,
            identifiability: IdentifiabilitySettings::default(),
            profile: ProfileSettings::default(),
        }
    }
}

impl FimOptions {
    pub fn validate(&self) -> Result<()> {
        self.identifiability.validate()?;
        self.profile.validate()
    }
}

/// Practical identifiability analysis of `parameter_names` around the model's baseline.
///
/// The model is cached once and released on every exit path.
/// Release failures are logged only.
pub async fn compute_fim<S: Simulator>(
    simulator: Arc<S>,
    model: &S::Model,
    parameter_names: &[String],
    simulation_options: &SimulationOptions,
    cancel: Option<&CancelToken>,
    progress: Option<ProgressFn<'_>>,
    options: &FimOptions,
) -> Result<FimResult> {
    let parameters = resolve_parameters(model, parameter_names)?;
    options.validate()?;
    let cancel = cancel.cloned().unwrap_or_default();

    let started = Instant::now();
    let handle = simulator.prepare_model(model, &cancel).await?;
    let prepare_ms = started.elapsed().as_secs_f64() * 1e3;

    let session = SimulationSession::new(
        Arc::clone(&simulator),
        handle,
        simulation_options.clone(),
        cancel,
    );
    let outcome = run(&session, &parameters, progress, options, started, prepare_ms).await;

    let (simulator, handle) = session.into_parts();
    if let Err(err) = simulator.release_model(handle).await {
        tracing::warn!(error = %err, "failed to release cached model");
    }

    if let Err(err) = &outcome {
        tracing::debug!(error = %err, cancelled = err.is_cancelled(), "FIM analysis aborted");
    }
    outcome
}

fn resolve_parameters<M: ParameterizedModel + ?Sized>(
    model: &M,
    names: &[String],
) -> Result<Vec<(String, f64)>> {
    if names.is_empty() {
        return Err(FimError::NoParameters);
    }
    let mut seen = HashSet::with_capacity(names.len());
    names
        .iter()
        .map(|name| {
            if !seen.insert(name.as_str()) {
                return Err(FimError::DuplicateParameter(name.clone()));
            }
            model
                .parameter(name)
                .map(|value| (name.clone(), value))
                .ok_or_else(|| FimError::UnknownParameter(name.clone()))
        })
        .collect()
}

async fn run<S: Simulator>(
    session: &SimulationSession<S>,
    parameters: &[(String, f64)],
    progress: Option<ProgressFn<'_>>,
    options: &FimOptions,
    started: Instant,
    prepare_ms: f64,
) -> Result<FimResult> {
    let p = parameters.len();
    let total_runs = 1 + 2 * p;
    let report = |done: usize| {
        if let Some(cb) = progress {
            cb(done, total_runs);
        }
    };
    let names: Vec<String> = parameters.iter().map(|(n, _)| n.clone()).collect();

    report(0);
    let sensitivities = build_jacobian(
        session,
        parameters,
        options.include_all_timepoints,
        options.use_log_parameters,
    )
    .await?;
    report(2 * p);

    let solver = FallbackEigensolver::<NalgebraEigensolver>::default();
    let info = analyze_information(&sensitivities.jacobian, &solver);
    let settings = &options.identifiability;
    let classification = classify(&info.eigen, &names, settings);
    let high_vif = high_vif_params(&info.vif, &names, settings.vif_threshold);
    let top_pairs = top_correlated_pairs(&info.correlation, &names, settings.max_correlated_pairs);

    let profiles = if options.approx_profile && !classification.implicated.is_empty() {
        let baseline_values = sensitivities.layout.flatten(&sensitivities.baseline);
        profile_parameters(
            session,
            parameters,
            &classification.implicated,
            &sensitivities.layout,
            &baseline_values,
            options.approx_profile_reopt,
            &options.profile,
        )
        .await?
    } else {
        Vec::new()
    };

    let sensitivity_profiles = names
        .iter()
        .enumerate()
        .map(|(j, name)| SensitivityProfile {
            name: name.clone(),
            time_profile: sensitivities.jacobian.column(j).iter().copied().collect(),
        })
        .collect();

    let sim_count = session.sim_count();
    let total_sim_ms = session.sim_time().as_secs_f64() * 1e3;
    let benchmark = Benchmark {
        prepare_model_ms: prepare_ms,
        total_sim_ms,
        sim_count,
        total_ms: started.elapsed().as_secs_f64() * 1e3,
        per_sim_ms: total_sim_ms / sim_count.max(1) as f64,
    };

    tracing::info!(
        parameters = p,
        condition_number = info.condition_number,
        nullspace = classification.nullspace_combinations.len(),
        profiled = profiles.len(),
        simulations = sim_count,
        "FIM analysis complete"
    );

    Ok(FimResult {
        param_names: names,
        max_eigenvalue: info.eigen.max(),
        min_eigenvalue: info.eigen.min(),
        eigenvalues: info.eigen.values,
        eigenvectors: info.eigen.vectors,
        condition_number: info.condition_number,
        regularized_condition_number: info.regularized_condition_number,
        covariance_matrix: to_rows(&info.covariance),
        correlations: to_rows(&info.correlation),
        fim_matrix: to_rows(&info.fim),
        jacobian: to_rows(&sensitivities.jacobian),
        observable_keys: sensitivities.layout.keys,
        sensitivity_profiles,
        identifiable_params: classification.identifiable,
        unidentifiable_params: classification.unidentifiable,
        vif: info.vif,
        high_vif_params: high_vif,
        nullspace_combinations: classification.nullspace_combinations,
        top_correlated_pairs: top_pairs,
        profiles,
        benchmark,
    })
}

#[cfg(test)]
mod tests {
    use super::{compute_fim, FimOptions, ProgressFn};
    use crate::error::FimError;
    use crate::report::export_fim;
    use crate::simulation::{CancelToken, SimulationError, SimulationOptions, Trajectory};
    use crate::traits::{ParameterOverrides, ParameterVector, Simulator};
    use anyhow::anyhow;
    use approx::assert_abs_diff_eq;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Copy)]
    enum Kind {
        /// A = exp(-k t)
        Decay,
        /// A = 5, independent of k
        Flat,
        /// obs = (a + b) t; any other parameter is unused
        Sum,
        /// x = a t, y = b t², z = c + a
        Mixed,
        /// baseline works, every perturbed run fails
        BrokenPerturbations,
        /// only a time column
        NoObservables,
        /// headers but not a single row
        EmptyRows,
    }

    struct AnalyticSimulator {
        kind: Kind,
        model: Mutex<Option<ParameterVector>>,
        prepared: AtomicUsize,
        released: AtomicUsize,
        simulations: AtomicUsize,
        fail_release: bool,
        /// Trips the caller's token from inside this (1-based) simulation.
        cancel_on_call: Option<usize>,
    }

    impl AnalyticSimulator {
        fn build(kind: Kind, fail_release: bool, cancel_on_call: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                model: Mutex::new(None),
                prepared: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                simulations: AtomicUsize::new(0),
                fail_release,
                cancel_on_call,
            })
        }

        fn new(kind: Kind) -> Arc<Self> {
            Self::build(kind, false, None)
        }

        fn with_failing_release(kind: Kind) -> Arc<Self> {
            Self::build(kind, true, None)
        }

        fn cancelling_on_call(kind: Kind, call: usize) -> Arc<Self> {
            Self::build(kind, false, Some(call))
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }

        fn simulations(&self) -> usize {
            self.simulations.load(Ordering::SeqCst)
        }
    }

    fn row(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[async_trait]
    impl Simulator for AnalyticSimulator {
        type Model = ParameterVector;
        type Handle = u32;

        async fn prepare_model(
            &self,
            model: &ParameterVector,
            _cancel: &CancelToken,
        ) -> Result<u32, SimulationError> {
            *self.model.lock().unwrap() = Some(model.clone());
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        }

        async fn simulate_cached(
            &self,
            _handle: &u32,
            overrides: Option<&ParameterOverrides>,
            options: &SimulationOptions,
            cancel: &CancelToken,
        ) -> Result<Trajectory, SimulationError> {
            cancel.check()?;
            let call = self.simulations.fetch_add(1, Ordering::SeqCst) + 1;
            if self.cancel_on_call == Some(call) {
                cancel.cancel();
            }
            if matches!(self.kind, Kind::EmptyRows) {
                return Ok(Trajectory::new(vec!["time".into(), "A".into()], Vec::new()));
            }
            let mut params = self.model.lock().unwrap().clone().expect("model prepared");
            if let Some(overrides) = overrides {
                if matches!(self.kind, Kind::BrokenPerturbations) {
                    return Err(SimulationError::Failed(anyhow!("solver exploded")));
                }
                for (name, value) in overrides {
                    params.set(name.clone(), *value);
                }
            }
            let get = |name: &str| params.get(name).unwrap_or(0.0);

            let n = options.n_steps.max(1);
            let mut data = Vec::with_capacity(n + 1);
            for i in 0..=n {
                let t = options.t_end * i as f64 / n as f64;
                let values = match self.kind {
                    Kind::Decay => row(&[("time", t), ("A", (-get("k") * t).exp())]),
                    Kind::Flat | Kind::BrokenPerturbations => row(&[("time", t), ("A", 5.0)]),
                    Kind::Sum => row(&[("time", t), ("obs", (get("a") + get("b")) * t)]),
                    Kind::Mixed => row(&[
                        ("time", t),
                        ("x", get("a") * t),
                        ("y", get("b") * t * t),
                        ("z", get("c") + get("a")),
                    ]),
                    Kind::NoObservables | Kind::EmptyRows => row(&[("time", t)]),
                };
                data.push(values);
            }
            let headers = data
                .last()
                .map(|r| r.keys().cloned().collect())
                .unwrap_or_default();
            Ok(Trajectory::new(headers, data))
        }

        async fn release_model(&self, _handle: u32) -> anyhow::Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            if self.fail_release {
                return Err(anyhow!("cache already evicted"));
            }
            Ok(())
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn params(list: &[(&str, f64)]) -> ParameterVector {
        list.iter().map(|(n, v)| (*n, *v)).collect()
    }

    fn sim_options() -> SimulationOptions {
        SimulationOptions {
            t_end: 10.0,
            n_steps: 10,
            ..SimulationOptions::default()
        }
    }

    fn assert_symmetric(m: &[Vec<f64>]) {
        for i in 0..m.len() {
            for j in 0..m.len() {
                assert_abs_diff_eq!(m[i][j], m[j][i], epsilon = 1e-9);
            }
        }
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, FimError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[tokio::test]
    async fn exponential_decay_single_parameter() {
        let sim = AnalyticSimulator::new(Kind::Decay);
        let options = FimOptions {
            include_all_timepoints: false,
            ..FimOptions::default()
        };
        let sim_opts = SimulationOptions {
            t_end: 1.0,
            n_steps: 4,
            ..SimulationOptions::default()
        };
        let result = compute_fim(
            sim.clone(),
            &params(&[("k", 1.0)]),
            &names(&["k"]),
            &sim_opts,
            None,
            None,
            &options,
        )
        .await
        .expect("analysis should succeed");

        assert_eq!(result.jacobian.len(), 1);
        assert_abs_diff_eq!(result.jacobian[0][0], -(-1.0_f64).exp(), epsilon = 1e-6);
        assert_eq!(result.eigenvalues.len(), 1);
        assert!(result.eigenvalues[0] > 0.0);
        assert_eq!(result.condition_number, 1.0);
        assert_eq!(result.identifiable_params, names(&["k"]));
        assert!(result.nullspace_combinations.is_empty());
        assert_eq!(result.benchmark.sim_count, 3);
        assert_eq!(sim.released(), 1);
    }

    #[tokio::test]
    async fn flat_sensitivity_is_unidentifiable() {
        let sim = AnalyticSimulator::new(Kind::Flat);
        let result = compute_fim(
            sim.clone(),
            &params(&[("k", 1.0)]),
            &names(&["k"]),
            &sim_options(),
            None,
            None,
            &FimOptions::default(),
        )
        .await
        .unwrap();

        assert_abs_diff_eq!(result.eigenvalues[0], 0.0, epsilon = 1e-12);
        assert!(result.condition_number.is_infinite());
        assert!(result.regularized_condition_number.is_finite());
        assert_eq!(result.unidentifiable_params, names(&["k"]));
        assert!(result.identifiable_params.is_empty());
    }

    #[tokio::test]
    async fn additive_degeneracy_forms_one_combination() {
        let sim = AnalyticSimulator::new(Kind::Sum);
        let options = FimOptions {
            use_log_parameters: true,
            ..FimOptions::default()
        };
        let result = compute_fim(
            sim.clone(),
            &params(&[("a", 2.0), ("b", 3.0)]),
            &names(&["a", "b"]),
            &sim_options(),
            None,
            None,
            &options,
        )
        .await
        .unwrap();

        assert!(result.eigenvalues[0] > 0.0);
        assert!(result.eigenvalues[1].abs() < 1e-6 * result.eigenvalues[0]);
        assert_eq!(result.nullspace_combinations.len(), 1);
        let combo = &result.nullspace_combinations[0];
        let loading = |name: &str| {
            combo
                .components
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.loading)
                .expect("component present")
        };
        assert!(loading("a") * loading("b") < 0.0);
        assert!(result.unidentifiable_params.contains(&"a".to_string()));
        assert!(result.unidentifiable_params.contains(&"b".to_string()));

        let top = &result.top_correlated_pairs[0];
        assert!(top.names.contains(&"a".to_string()));
        assert!(top.names.contains(&"b".to_string()));
        assert!(top.corr.abs() > 0.9);

        assert_symmetric(&result.fim_matrix);
        assert_symmetric(&result.covariance_matrix);
        assert_symmetric(&result.correlations);
    }

    #[tokio::test]
    async fn unused_parameter_lands_in_nullspace() {
        let sim = AnalyticSimulator::new(Kind::Sum);
        let result = compute_fim(
            sim,
            &params(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]),
            &names(&["a", "b", "c"]),
            &sim_options(),
            None,
            None,
            &FimOptions::default(),
        )
        .await
        .unwrap();
        assert!(result
            .nullspace_combinations
            .iter()
            .any(|combo| combo.contains("c")));
        assert!(result.unidentifiable_params.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn well_conditioned_model_is_symmetric_and_sorted() {
        let sim = AnalyticSimulator::new(Kind::Mixed);
        let result = compute_fim(
            sim,
            &params(&[("a", 1.0), ("b", 0.5), ("c", 2.0)]),
            &names(&["a", "b", "c"]),
            &sim_options(),
            None,
            None,
            &FimOptions::default(),
        )
        .await
        .unwrap();

        for w in result.eigenvalues.windows(2) {
            assert!(w[0] >= w[1]);
        }
        assert!(result.condition_number.is_finite());
        assert!(result.nullspace_combinations.is_empty());
        assert_eq!(result.identifiable_params, names(&["a", "b", "c"]));
        assert_symmetric(&result.fim_matrix);
        assert_symmetric(&result.covariance_matrix);
        assert_symmetric(&result.correlations);
        // 11 timepoints x 3 observables
        assert_eq!(result.jacobian.len(), 33);
        assert_eq!(result.sensitivity_profiles.len(), 3);
        assert_eq!(result.sensitivity_profiles[1].time_profile.len(), 33);
        assert_eq!(result.observable_keys, names(&["x", "y", "z"]));
    }

    #[tokio::test]
    async fn profile_scans_report_intervals() {
        let sim = AnalyticSimulator::new(Kind::Sum);
        let options = FimOptions {
            approx_profile: true,
            ..FimOptions::default()
        };
        let result = compute_fim(
            sim.clone(),
            &params(&[("a", 1.0), ("b", 2.0), ("c", 3.0)]),
            &names(&["a", "b", "c"]),
            &sim_options(),
            None,
            None,
            &options,
        )
        .await
        .unwrap();

        assert!(!result.profiles.is_empty());
        for scan in &result.profiles {
            assert_eq!(scan.grid.len(), scan.ssr.len());
            assert_eq!(scan.alpha, 0.05);
            assert!(scan.ci.is_some());
        }
        let c = result.profile("c").expect("c is implicated");
        assert!(c.flat);
        let ci = c.ci.unwrap();
        assert_abs_diff_eq!(ci.lower, 0.6, epsilon = 1e-12);
        assert_abs_diff_eq!(ci.upper, 15.0, epsilon = 1e-12);

        let expected_sims = 1 + 2 * 3 + result.profiles.len() * 9;
        assert_eq!(result.benchmark.sim_count, expected_sims);
        assert_eq!(sim.released(), 1);
    }

    #[tokio::test]
    async fn reoptimized_profile_never_exceeds_plain_scan() {
        let base = params(&[("a", 2.0), ("b", 3.0)]);
        let plain = FimOptions {
            approx_profile: true,
            ..FimOptions::default()
        };
        let reopt = FimOptions {
            approx_profile_reopt: true,
            ..plain
        };
        let run = |options: FimOptions| {
            let base = base.clone();
            async move {
                compute_fim(
                    AnalyticSimulator::new(Kind::Sum),
                    &base,
                    &names(&["a", "b"]),
                    &sim_options(),
                    None,
                    None,
                    &options,
                )
                .await
                .unwrap()
            }
        };
        let plain_result = run(plain).await;
        let reopt_result = run(reopt).await;

        let p = plain_result.profile("a").unwrap();
        let r = reopt_result.profile("a").unwrap();
        assert_eq!(p.grid, r.grid);
        for (plain_ssr, reopt_ssr) in p.ssr.iter().zip(&r.ssr) {
            assert!(*reopt_ssr <= *plain_ssr + 1e-9);
        }
        // the grid point at the baseline reproduces the data exactly
        assert_abs_diff_eq!(r.ssr[4], 0.0, epsilon = 1e-12);
        assert!(r.ci.is_some());
    }

    #[tokio::test]
    async fn progress_reports_start_and_perturbation_batch() {
        let sim = AnalyticSimulator::new(Kind::Sum);
        let calls = Mutex::new(Vec::new());
        {
            let observer = |done: usize, total: usize| calls.lock().unwrap().push((done, total));
            compute_fim(
                sim,
                &params(&[("a", 1.0), ("b", 2.0)]),
                &names(&["a", "b"]),
                &sim_options(),
                None,
                Some(&observer as ProgressFn<'_>),
                &FimOptions::default(),
            )
            .await
            .unwrap();
        }
        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.first(), Some(&(0, 5)));
        assert!(calls.contains(&(4, 5)));
    }

    #[tokio::test]
    async fn pre_cancelled_token_rejects_and_still_releases() {
        let sim = AnalyticSimulator::new(Kind::Sum);
        let token = CancelToken::new();
        token.cancel();
        let err = compute_fim(
            sim.clone(),
            &params(&[("a", 1.0)]),
            &names(&["a"]),
            &sim_options(),
            Some(&token),
            None,
            &FimOptions::default(),
        )
        .await
        .expect_err("cancelled analysis must fail");
        assert!(err.is_cancelled());
        assert_eq!(sim.released(), 1);
    }

    #[tokio::test]
    async fn simulation_failures_propagate_after_release() {
        let sim = AnalyticSimulator::new(Kind::BrokenPerturbations);
        let result = compute_fim(
            sim.clone(),
            &params(&[("k", 1.0)]),
            &names(&["k"]),
            &sim_options(),
            None,
            None,
            &FimOptions::default(),
        )
        .await;
        assert_err_contains(result, "solver exploded");
        assert_eq!(sim.released(), 1);
    }

    #[tokio::test]
    async fn release_failures_do_not_mask_the_result() {
        let sim = AnalyticSimulator::with_failing_release(Kind::Decay);
        let result = compute_fim(
            sim.clone(),
            &params(&[("k", 0.5)]),
            &names(&["k"]),
            &sim_options(),
            None,
            None,
            &FimOptions::default(),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(sim.released(), 1);
    }

    #[tokio::test]
    async fn missing_observables_fail_after_release() {
        let sim = AnalyticSimulator::new(Kind::NoObservables);
        let result = compute_fim(
            sim.clone(),
            &params(&[("k", 1.0)]),
            &names(&["k"]),
            &sim_options(),
            None,
            None,
            &FimOptions::default(),
        )
        .await;
        assert_err_contains(result, "No observables");
        assert_eq!(sim.released(), 1);
    }

    #[tokio::test]
    async fn baseline_without_rows_has_no_observables() {
        let sim = AnalyticSimulator::new(Kind::EmptyRows);
        let result = compute_fim(
            sim.clone(),
            &params(&[("a", 1.0)]),
            &names(&["a"]),
            &sim_options(),
            None,
            None,
            &FimOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(FimError::NoObservables)));
        assert_eq!(sim.simulations(), 1);
        assert_eq!(sim.released(), 1);
    }

    #[tokio::test]
    async fn cancellation_during_profiling_stops_before_next_grid_point() {
        // 1 baseline + 4 perturbations, then the first profile point trips the token.
        let sim = AnalyticSimulator::cancelling_on_call(Kind::Sum, 6);
        let token = CancelToken::new();
        let options = FimOptions {
            approx_profile: true,
            ..FimOptions::default()
        };
        let err = compute_fim(
            sim.clone(),
            &params(&[("a", 2.0), ("b", 3.0)]),
            &names(&["a", "b"]),
            &sim_options(),
            Some(&token),
            None,
            &options,
        )
        .await
        .expect_err("cancelled analysis must fail");
        assert!(err.is_cancelled());
        assert!(token.is_cancelled());
        assert_eq!(sim.simulations(), 6);
        assert_eq!(sim.released(), 1);
    }

    #[tokio::test]
    async fn cancellation_during_perturbation_batch_releases_once() {
        let sim = AnalyticSimulator::cancelling_on_call(Kind::Sum, 2);
        let token = CancelToken::new();
        let err = compute_fim(
            sim.clone(),
            &params(&[("a", 2.0), ("b", 3.0)]),
            &names(&["a", "b"]),
            &sim_options(),
            Some(&token),
            None,
            &FimOptions::default(),
        )
        .await
        .expect_err("cancelled analysis must fail");
        assert!(err.is_cancelled());
        // the remaining perturbation jobs observe the token and never simulate
        assert_eq!(sim.simulations(), 2);
        assert_eq!(sim.released(), 1);
    }

    #[tokio::test]
    async fn preconditions_fail_before_any_simulation() {
        let sim = AnalyticSimulator::new(Kind::Sum);
        let model = params(&[("a", 1.0)]);
        let opts = FimOptions::default();

        assert_err_contains(
            compute_fim(sim.clone(), &model, &[], &sim_options(), None, None, &opts).await,
            "No parameters",
        );
        assert_err_contains(
            compute_fim(sim.clone(), &model, &names(&["zz"]), &sim_options(), None, None, &opts)
                .await,
            "'zz' is not defined",
        );
        assert_err_contains(
            compute_fim(
                sim.clone(),
                &model,
                &names(&["a", "a"]),
                &sim_options(),
                None,
                None,
                &opts,
            )
            .await,
            "more than once",
        );
        let bad = FimOptions {
            profile: crate::profile::ProfileSettings {
                alpha: 0.0,
                ..Default::default()
            },
            ..FimOptions::default()
        };
        assert_err_contains(
            compute_fim(sim.clone(), &model, &names(&["a"]), &sim_options(), None, None, &bad)
                .await,
            "alpha",
        );
        assert_eq!(sim.prepared.load(Ordering::SeqCst), 0);
        assert_eq!(sim.released(), 0);
    }

    #[tokio::test]
    async fn export_matches_result_shapes() {
        let sim = AnalyticSimulator::new(Kind::Mixed);
        let result = compute_fim(
            sim,
            &params(&[("a", 1.0), ("b", 0.5), ("c", 2.0)]),
            &names(&["a", "b", "c"]),
            &sim_options(),
            None,
            None,
            &FimOptions::default(),
        )
        .await
        .unwrap();
        let exported = export_fim(&result);
        assert_eq!(exported.format, "FIM-v1");
        assert_eq!(exported.eigenvalues.len(), result.eigenvalues.len());
        assert_eq!(exported.fim_matrix.len(), result.fim_matrix.len());
        assert_eq!(exported.jacobian.len(), result.jacobian.len());
    }
}
