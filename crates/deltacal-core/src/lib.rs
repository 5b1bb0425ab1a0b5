//! Delta printer calibration core.
//!
//! Models delta kinematics with every per-tower imperfection a calibration
//! can correct, and fits those parameters to bed probe measurements. This
//! crate intentionally avoids any transport- or firmware-specific
//! dependencies.

pub mod error;
pub mod geometry;
pub mod kinematics;
pub mod measurement;
pub mod plan;
pub mod session;
pub mod solver;
pub mod synthetic;

pub use error::{CalibrationError, ReachFailure, Result};
pub use geometry::{CarriagePositions, Factor, FactorSet, KinematicParameters, Point3D};
pub use kinematics::{DeltaKinematics, KinematicModel};
pub use measurement::{ErrorStats, Measurement, MeasurementSet, Observation};
pub use plan::spiral_points;
pub use session::{
    CalibrationSession, ParameterVersion, SessionState, SessionStateKind, SolveJob, SolveOutcome,
};
pub use solver::{
    CancellationFlag, IterationReport, LeastSquaresSolver, SolveObserver, SolveOptions,
    SolveResult,
};
pub use synthetic::SyntheticMachine;
