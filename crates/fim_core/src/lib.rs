//! The `fim_core` crate estimates practical parameter identifiability of simulated models
//! from the Fisher information matrix `F = JᵀJ` of finite-difference output sensitivities.
//!
//! Key components:
//! - **Traits**: `Simulator` (async cached simulation backend), `ParameterizedModel` (named baselines).
//! - **Session**: one cached model, a concurrent batch runner and simulation bookkeeping.
//! - **Sensitivity / Information**: central-difference Jacobian, FIM, eigen pseudo-inverse, correlations and VIF.
//! - **Identifiability**: nullspace combinations, identifiable / unidentifiable split, correlated pairs.
//! - **Profile**: SSR profiles with optional Nelder–Mead re-optimization and chi-square intervals.
//! - **Report**: the `FimResult` record and its portable `FIM-v1` export.
pub mod analysis;
pub mod eigen;
pub mod error;
pub mod identifiability;
pub mod information;
pub mod numeric;
pub mod optimize;
pub mod profile;
pub mod report;
pub mod sensitivity;
pub mod session;
pub mod simulation;
pub mod traits;

pub use analysis::{compute_fim, FimOptions, ProgressFn};
pub use error::{FimError, Result};
pub use report::{export_fim, FimExport, FimResult};
pub use simulation::{CancelToken, SimulationError, SimulationOptions, Trajectory};
pub use traits::{ParameterOverrides, ParameterVector, ParameterizedModel, Simulator};
