use crate::{geometry::KinematicParameters, session::SessionStateKind};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CalibrationError {
    #[error("out of reach: {reason}")]
    OutOfReach { reason: ReachFailure },

    #[error("measurement at ({x:.3}, {y:.3}, {z:.3}) has a non-finite value")]
    InvalidMeasurement { x: f64, y: f64, z: f64 },

    #[error(
        "measurement at ({x:.3}, {y:.3}, {z:.3}) duplicates sample {existing} within {tolerance} mm"
    )]
    DuplicateMeasurement {
        x: f64,
        y: f64,
        z: f64,
        existing: usize,
        tolerance: f64,
    },

    #[error("{samples} measurements cannot determine {required} free parameters")]
    InsufficientData { samples: usize, required: usize },

    #[error("no free parameters selected")]
    NoFreeParameters,

    #[error(
        "normal equations are singular at iteration {iteration} (best rms {best_rms:.6} mm); \
         the selected factors are not observable from these probe points"
    )]
    SingularSystem { iteration: usize, best_rms: f64 },

    #[error(
        "geometry left the reachable range at iteration {iteration} (best rms {best_rms:.6} mm): {reason}"
    )]
    UnreachableStep {
        iteration: usize,
        best_rms: f64,
        reason: ReachFailure,
    },

    #[error("solve diverged after {iterations} iterations (best rms {best_rms:.6} mm)")]
    Divergence {
        iterations: usize,
        best_rms: f64,
        best: Box<KinematicParameters>,
    },

    #[error("a solve is already running on this session")]
    SessionBusy,

    #[error("cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionStateKind,
    },

    #[error("solve cancelled after {iterations} iterations")]
    Cancelled { iterations: usize },
}

/// Why a point or carriage configuration has no valid kinematic solution.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ReachFailure {
    #[error("point ({x:.3}, {y:.3}, {z:.3}) is beyond the arm length of a tower")]
    Point { x: f64, y: f64, z: f64 },

    #[error("carriages at [{a:.1}, {b:.1}, {c:.1}] steps do not meet at an effector")]
    Carriages { a: f64, b: f64, c: f64 },

    #[error("tower columns are coincident or collinear")]
    DegenerateTowers,

    #[error("geometry contains a non-finite value")]
    NonFinite,

    #[error("probe at ({x:.3}, {y:.3}) never reached the bed")]
    ProbeMissed { x: f64, y: f64 },
}

impl From<ReachFailure> for CalibrationError {
    fn from(reason: ReachFailure) -> Self {
        CalibrationError::OutOfReach { reason }
    }
}

pub type Result<T> = std::result::Result<T, CalibrationError>;
