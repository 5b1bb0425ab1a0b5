// Least-squares fit of kinematic parameters to probe observations

use crate::{
    error::{CalibrationError, Result},
    geometry::{FactorSet, KinematicParameters},
    kinematics::KinematicModel,
    measurement::{MeasurementSet, Observation},
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, info};

/// Smallest accepted ratio between the smallest and largest singular value of
/// the normal matrix.
const MIN_RCOND: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    pub factors: FactorSet,
    pub max_iterations: usize,
    /// Relative RMS change below which the fit is considered settled.
    pub tolerance: f64,
    /// Absolute RMS (mm) at which the fit is considered exact.
    pub acceptance_rms: f64,
    /// Initial Levenberg-Marquardt damping. Zero selects plain Gauss-Newton.
    pub damping: f64,
    /// Consecutive RMS increases tolerated before giving up.
    pub divergence_patience: usize,
    /// Central-difference step for the Jacobian, in factor units.
    pub perturbation: f64,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            factors: FactorSet::SEVEN,
            max_iterations: 50,
            tolerance: 1e-6,
            acceptance_rms: 1e-9,
            damping: 0.0,
            divergence_patience: 3,
            perturbation: 1e-3,
        }
    }
}

impl SolveOptions {
    pub fn with_factors(mut self, factors: FactorSet) -> Self {
        self.factors = factors;
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub iteration: usize,
    /// RMS of the candidate step, infinite when it left the reachable space.
    pub rms: f64,
    pub damping: f64,
    pub accepted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolveResult {
    pub parameters: KinematicParameters,
    pub residual_rms: f64,
    pub initial_rms: f64,
    pub iterations: usize,
    pub converged: bool,
    pub residuals: Vec<f64>,
    pub history: Vec<IterationReport>,
}

impl SolveResult {
    pub fn min_residual(&self) -> f64 {
        self.residuals.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max_residual(&self) -> f64 {
        self.residuals
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Progress hook for a running solve.
pub trait SolveObserver {
    /// Polled before every iteration.
    fn is_cancelled(&self) -> bool {
        false
    }

    fn on_iteration(&mut self, _report: &IterationReport) {}
}

impl SolveObserver for () {}

impl<O: SolveObserver + ?Sized> SolveObserver for &mut O {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }

    fn on_iteration(&mut self, report: &IterationReport) {
        (**self).on_iteration(report)
    }
}

/// Shared flag that cancels any solve observing it.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl SolveObserver for CancellationFlag {
    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

struct Snapshot {
    parameters: KinematicParameters,
    residuals: Vec<f64>,
    rms: f64,
}

#[derive(Clone, Debug, Default)]
pub struct LeastSquaresSolver {
    options: SolveOptions,
}

impl LeastSquaresSolver {
    pub fn new(options: SolveOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolveOptions {
        &self.options
    }

    /// Fits `initial` to `measurements`, treating `initial` as the geometry
    /// the firmware was running while probing.
    pub fn solve<M: KinematicModel + ?Sized>(
        &self,
        initial: &KinematicParameters,
        measurements: &MeasurementSet,
        model: &M,
    ) -> Result<SolveResult> {
        self.solve_observed(initial, measurements, model, &mut ())
    }

    pub fn solve_observed<M, O>(
        &self,
        initial: &KinematicParameters,
        measurements: &MeasurementSet,
        model: &M,
        observer: &mut O,
    ) -> Result<SolveResult>
    where
        M: KinematicModel + ?Sized,
        O: SolveObserver + ?Sized,
    {
        if self.options.factors.is_empty() {
            return Err(CalibrationError::NoFreeParameters);
        }
        measurements.require(self.options.factors.len())?;
        let observations = measurements.observe(model, initial)?;
        self.solve_observations(initial, &observations, model, observer)
    }

    /// Fits `initial` to observations that are already bound to carriage
    /// positions.
    pub fn solve_observations<M, O>(
        &self,
        initial: &KinematicParameters,
        observations: &[Observation],
        model: &M,
        observer: &mut O,
    ) -> Result<SolveResult>
    where
        M: KinematicModel + ?Sized,
        O: SolveObserver + ?Sized,
    {
        let options = &self.options;
        let factors = options.factors;
        if factors.is_empty() {
            return Err(CalibrationError::NoFreeParameters);
        }
        if observations.len() < factors.len() {
            return Err(CalibrationError::InsufficientData {
                samples: observations.len(),
                required: factors.len(),
            });
        }

        let mut parameters = initial.clone();
        parameters.normalise_endstops();
        let start_residuals = residuals(model, &parameters, observations)?;
        let initial_rms = rms(&start_residuals);

        let mut current = Snapshot {
            parameters,
            residuals: start_residuals,
            rms: initial_rms,
        };
        let mut best_parameters = current.parameters.clone();
        let mut best_residuals = current.residuals.clone();
        let mut best_rms = current.rms;

        let mut damping = options.damping;
        let mut increases = 0;
        let mut history = Vec::new();
        let mut converged = best_rms <= options.acceptance_rms;
        let mut iterations = 0;

        while !converged && iterations < options.max_iterations {
            if observer.is_cancelled() {
                info!(iterations, best_rms, "solve cancelled");
                return Err(CalibrationError::Cancelled { iterations });
            }
            iterations += 1;

            let jacobian = self
                .jacobian(model, &current.parameters, observations)
                .map_err(|err| match err {
                    CalibrationError::OutOfReach { reason } => CalibrationError::UnreachableStep {
                        iteration: iterations,
                        best_rms,
                        reason,
                    },
                    other => other,
                })?;
            let step = normal_step(&jacobian, &current.residuals, damping).ok_or(
                CalibrationError::SingularSystem {
                    iteration: iterations,
                    best_rms,
                },
            )?;

            let candidate = current.parameters.adjusted(factors, step.as_slice());
            let (candidate_residuals, candidate_rms) =
                match residuals(model, &candidate, observations) {
                    Ok(r) => {
                        let candidate_rms = rms(&r);
                        (r, candidate_rms)
                    }
                    Err(_) => (Vec::new(), f64::INFINITY),
                };

            let previous_rms = current.rms;
            let improved = candidate_rms < previous_rms;
            let accepted = if damping > 0.0 {
                if improved {
                    damping /= 10.0;
                } else {
                    damping *= 10.0;
                }
                improved
            } else {
                candidate_rms.is_finite()
            };
            increases = if improved { 0 } else { increases + 1 };

            if accepted {
                current = Snapshot {
                    parameters: candidate,
                    residuals: candidate_residuals,
                    rms: candidate_rms,
                };
                if current.rms < best_rms {
                    best_parameters = current.parameters.clone();
                    best_residuals = current.residuals.clone();
                    best_rms = current.rms;
                }
            }

            let report = IterationReport {
                iteration: iterations,
                rms: candidate_rms,
                damping,
                accepted,
            };
            debug!(
                iteration = iterations,
                rms = candidate_rms,
                damping,
                accepted,
                "solver iteration"
            );
            observer.on_iteration(&report);
            history.push(report);

            if increases >= options.divergence_patience {
                info!(iterations, best_rms, "solve diverged");
                return Err(CalibrationError::Divergence {
                    iterations,
                    best_rms,
                    best: Box::new(best_parameters),
                });
            }

            let change = (previous_rms - candidate_rms).abs();
            converged = best_rms <= options.acceptance_rms
                || (accepted && change <= options.tolerance * previous_rms);
        }

        info!(
            iterations,
            initial_rms,
            residual_rms = best_rms,
            converged,
            "solve finished"
        );

        Ok(SolveResult {
            parameters: best_parameters,
            residual_rms: best_rms,
            initial_rms,
            iterations,
            converged,
            residuals: best_residuals,
            history,
        })
    }

    /// Central-difference derivatives of each residual with respect to each
    /// free factor, one column per factor in factor order.
    fn jacobian<M: KinematicModel + ?Sized>(
        &self,
        model: &M,
        parameters: &KinematicParameters,
        observations: &[Observation],
    ) -> Result<DMatrix<f64>> {
        let h = self.options.perturbation;
        let mut jacobian = DMatrix::zeros(observations.len(), self.options.factors.len());

        for (col, factor) in self.options.factors.iter().enumerate() {
            let mut plus = parameters.clone();
            *plus.factor_mut(factor) += h;
            let mut minus = parameters.clone();
            *minus.factor_mut(factor) -= h;

            for (row, observation) in observations.iter().enumerate() {
                let up = model.residual(&plus, observation)?;
                let down = model.residual(&minus, observation)?;
                jacobian[(row, col)] = (up - down) / (2.0 * h);
            }
        }

        Ok(jacobian)
    }
}

/// Solves `(JᵀJ + λ·diag(JᵀJ)) δ = −Jᵀr`, or `None` when the system is
/// singular.
fn normal_step(jacobian: &DMatrix<f64>, residuals: &[f64], damping: f64) -> Option<DVector<f64>> {
    let r = DVector::from_column_slice(residuals);
    let jt = jacobian.transpose();
    let jtj = &jt * jacobian;
    let gradient = &jt * r;

    let mut normal = jtj.clone();
    if damping > 0.0 {
        for i in 0..normal.nrows() {
            normal[(i, i)] += damping * jtj[(i, i)];
        }
    }

    let svd = normal.svd(true, true);
    let max = svd.singular_values.max();
    let min = svd.singular_values.min();
    if !max.is_finite() || max <= 0.0 || min / max < MIN_RCOND {
        return None;
    }

    svd.solve(&(-gradient), 0.0).ok()
}

fn residuals<M: KinematicModel + ?Sized>(
    model: &M,
    parameters: &KinematicParameters,
    observations: &[Observation],
) -> Result<Vec<f64>> {
    observations
        .iter()
        .map(|o| model.residual(parameters, o))
        .collect()
}

fn rms(residuals: &[f64]) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    let sum: f64 = residuals.iter().map(|r| r * r).sum();
    (sum / residuals.len() as f64).sqrt()
}
