// Simulated probing for tests and dry runs

use crate::{
    error::{ReachFailure, Result},
    geometry::{KinematicParameters, Point3D},
    kinematics::{DeltaKinematics, KinematicModel},
    measurement::{Measurement, MeasurementSet},
};

const SETTLE_TOLERANCE: f64 = 1e-11;
const MISS_TOLERANCE: f64 = 1e-6;
const MAX_STEPS: usize = 100;

/// A printer whose real geometry differs from what its firmware assumes.
#[derive(Clone, Debug)]
pub struct SyntheticMachine<M = DeltaKinematics> {
    actual: KinematicParameters,
    assumed: KinematicParameters,
    model: M,
}

impl SyntheticMachine {
    pub fn new(actual: KinematicParameters, assumed: KinematicParameters) -> Self {
        Self::with_model(actual, assumed, DeltaKinematics)
    }
}

impl<M: KinematicModel> SyntheticMachine<M> {
    pub fn with_model(actual: KinematicParameters, assumed: KinematicParameters, model: M) -> Self {
        Self {
            actual,
            assumed,
            model,
        }
    }

    pub fn actual(&self) -> &KinematicParameters {
        &self.actual
    }

    pub fn assumed(&self) -> &KinematicParameters {
        &self.assumed
    }

    /// Lowers the nozzle at (`x`, `y`) until it touches the bed and reports
    /// the firmware's Z at that moment as the measured error.
    pub fn probe(&self, x: f64, y: f64) -> Result<Measurement> {
        let mut target_z = 0.0;
        let mut height = f64::INFINITY;

        for _ in 0..MAX_STEPS {
            let carriages = self
                .model
                .inverse_kinematics(&self.assumed, &Point3D::new(x, y, target_z))?;
            height = self.model.forward_kinematics(&self.actual, &carriages)?.z;
            if height.abs() <= SETTLE_TOLERANCE {
                break;
            }
            target_z -= height;
        }

        if height.is_nan() || height.abs() > MISS_TOLERANCE {
            return Err(ReachFailure::ProbeMissed { x, y }.into());
        }
        Ok(Measurement::new(Point3D::new(x, y, 0.0), target_z))
    }

    pub fn probe_all(&self, points: &[Point3D]) -> Result<MeasurementSet> {
        let mut set = MeasurementSet::new();
        for point in points {
            set.add(self.probe(point.x, point.y)?)?;
        }
        Ok(set)
    }
}
