use crate::simulation::{CancelToken, SimulationError, SimulationOptions, Trajectory};
use crate::traits::{ParameterOverrides, Simulator};
use anyhow::anyhow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// One cached model plus everything needed to re-simulate it.
///
/// Tracks how many simulations were issued and how long they took so the
/// report can carry benchmark figures.
pub struct SimulationSession<S: Simulator> {
    simulator: Arc<S>,
    handle: S::Handle,
    options: Arc<SimulationOptions>,
    cancel: CancelToken,
    sim_count: AtomicUsize,
    sim_nanos: AtomicU64,
}

impl<S: Simulator> SimulationSession<S> {
    pub fn new(
        simulator: Arc<S>,
        handle: S::Handle,
        options: SimulationOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            simulator,
            handle,
            options: Arc::new(options),
            cancel,
            sim_count: AtomicUsize::new(0),
            sim_nanos: AtomicU64::new(0),
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn sim_count(&self) -> usize {
        self.sim_count.load(Ordering::Relaxed)
    }

    pub fn sim_time(&self) -> Duration {
        Duration::from_nanos(self.sim_nanos.load(Ordering::Relaxed))
    }

    fn record(&self, calls: usize, elapsed: Duration) {
        self.sim_count.fetch_add(calls, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.sim_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Runs a single simulation and waits for it. The cancel token is checked first.
    pub async fn simulate(
        &self,
        overrides: Option<&ParameterOverrides>,
    ) -> Result<Trajectory, SimulationError> {
        self.cancel.check()?;
        let start = Instant::now();
        let result = self
            .simulator
            .simulate_cached(&self.handle, overrides, &self.options, &self.cancel)
            .await;
        self.record(1, start.elapsed());
        result
    }

    /// Issues every job concurrently and returns the trajectories in job order.
    ///
    /// The first failure aborts the jobs still in flight and is returned as-is.
    pub async fn simulate_batch(
        &self,
        jobs: Vec<ParameterOverrides>,
    ) -> Result<Vec<Trajectory>, SimulationError> {
        self.cancel.check()?;
        let total = jobs.len();
        let start = Instant::now();
        let mut set = JoinSet::new();
        for (index, overrides) in jobs.into_iter().enumerate() {
            let simulator = Arc::clone(&self.simulator);
            let handle = self.handle.clone();
            let options = Arc::clone(&self.options);
            let cancel = self.cancel.clone();
            set.spawn(async move {
                let result = simulator
                    .simulate_cached(&handle, Some(&overrides), &options, &cancel)
                    .await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<Trajectory>> = vec![None; total];
        while let Some(joined) = set.join_next().await {
            let (index, result) = joined.map_err(|err| {
                SimulationError::Failed(anyhow!("Simulation task did not complete: {err}"))
            })?;
            match result {
                Ok(trajectory) => slots[index] = Some(trajectory),
                Err(err) => {
                    set.abort_all();
                    self.record(total, start.elapsed());
                    return Err(err);
                }
            }
        }
        self.record(total, start.elapsed());

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| {
                    SimulationError::Failed(anyhow!("Missing result for simulation job {index}"))
                })
            })
            .collect()
    }

    /// Hands the cached model back; the session is unusable afterwards.
    pub(crate) fn into_parts(self) -> (Arc<S>, S::Handle) {
        (self.simulator, self.handle)
    }
}
