// Probe measurements and the observations the solver fits against

use crate::{
    error::{CalibrationError, Result},
    geometry::{CarriagePositions, KinematicParameters, Point3D},
    kinematics::KinematicModel,
};
use serde::{Deserialize, Serialize};

/// Nominal positions closer than this (mm) are treated as the same point.
pub const DEFAULT_DUPLICATE_TOLERANCE: f64 = 1e-3;

/// A probe target and the signed Z deviation reported when the probe
/// triggered (reported Z minus nominal Z).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub nominal: Point3D,
    pub measured_error: f64,
}

impl Measurement {
    pub const fn new(nominal: Point3D, measured_error: f64) -> Self {
        Self {
            nominal,
            measured_error,
        }
    }

    /// Where the firmware believed the nozzle was when the probe triggered.
    pub fn probed_point(&self) -> Point3D {
        Point3D::new(
            self.nominal.x,
            self.nominal.y,
            self.nominal.z + self.measured_error,
        )
    }

    pub fn is_finite(&self) -> bool {
        self.nominal.is_finite() && self.measured_error.is_finite()
    }
}

/// A measurement bound to the carriage positions at which the probe
/// triggered.
///
/// The carriages are computed once with the geometry the firmware was running
/// when the measurement was taken, so residuals stay meaningful while the
/// solver moves the parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub measurement: Measurement,
    pub carriages: CarriagePositions,
}

impl Observation {
    pub fn bind<M: KinematicModel + ?Sized>(
        model: &M,
        firmware: &KinematicParameters,
        measurement: Measurement,
    ) -> Result<Self> {
        let carriages = model.inverse_kinematics(firmware, &measurement.probed_point())?;
        Ok(Self {
            measurement,
            carriages,
        })
    }
}

/// Summary of the measured errors in a set.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ErrorStats {
    pub count: usize,
    pub rms: f64,
    pub min: f64,
    pub max: f64,
}

/// Ordered collection of probe measurements.
#[derive(Clone, Debug)]
pub struct MeasurementSet {
    measurements: Vec<Measurement>,
    duplicate_tolerance: f64,
}

impl Default for MeasurementSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementSet {
    pub fn new() -> Self {
        Self::with_tolerance(DEFAULT_DUPLICATE_TOLERANCE)
    }

    pub fn with_tolerance(duplicate_tolerance: f64) -> Self {
        Self {
            measurements: Vec::new(),
            duplicate_tolerance,
        }
    }

    pub fn duplicate_tolerance(&self) -> f64 {
        self.duplicate_tolerance
    }

    /// Appends a measurement, returning its index.
    pub fn add(&mut self, measurement: Measurement) -> Result<usize> {
        let Point3D { x, y, z } = measurement.nominal;
        if !measurement.is_finite() {
            return Err(CalibrationError::InvalidMeasurement { x, y, z });
        }

        if let Some(existing) = self.measurements.iter().position(|m| {
            m.nominal.distance(&measurement.nominal) <= self.duplicate_tolerance
        }) {
            return Err(CalibrationError::DuplicateMeasurement {
                x,
                y,
                z,
                existing,
                tolerance: self.duplicate_tolerance,
            });
        }

        self.measurements.push(measurement);
        Ok(self.measurements.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn count(&self) -> usize {
        self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Measurement> {
        self.measurements.iter()
    }

    pub fn clear(&mut self) {
        self.measurements.clear();
    }

    /// Fails unless there are at least as many measurements as free
    /// parameters.
    pub fn require(&self, free_parameters: usize) -> Result<()> {
        if self.len() < free_parameters {
            return Err(CalibrationError::InsufficientData {
                samples: self.len(),
                required: free_parameters,
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> Option<ErrorStats> {
        if self.is_empty() {
            return None;
        }
        let mut sum_sq = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for m in &self.measurements {
            sum_sq += m.measured_error * m.measured_error;
            min = min.min(m.measured_error);
            max = max.max(m.measured_error);
        }
        Some(ErrorStats {
            count: self.len(),
            rms: (sum_sq / self.len() as f64).sqrt(),
            min,
            max,
        })
    }

    /// Binds every measurement against the geometry the firmware was using.
    pub fn observe<M: KinematicModel + ?Sized>(
        &self,
        model: &M,
        firmware: &KinematicParameters,
    ) -> Result<Vec<Observation>> {
        self.measurements
            .iter()
            .map(|m| Observation::bind(model, firmware, *m))
            .collect()
    }
}

impl<'a> IntoIterator for &'a MeasurementSet {
    type Item = &'a Measurement;
    type IntoIter = std::slice::Iter<'a, Measurement>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::DeltaKinematics;

    fn at(x: f64, y: f64, err: f64) -> Measurement {
        Measurement::new(Point3D::new(x, y, 0.0), err)
    }

    fn add_all(set: &mut MeasurementSet, measurements: impl IntoIterator<Item = Measurement>) {
        for m in measurements {
            set.add(m).unwrap();
        }
    }

    #[test]
    fn rejects_non_finite() {
        let mut set = MeasurementSet::new();
        let err = set.add(at(0.0, 0.0, f64::NAN)).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidMeasurement { .. }));
        let err = set.add(at(f64::INFINITY, 0.0, 0.1)).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidMeasurement { .. }));
        assert!(set.is_empty());
    }

    #[test]
    fn rejects_duplicates_within_tolerance() {
        let mut set = MeasurementSet::new();
        assert_eq!(set.add(at(10.0, 10.0, 0.1)).unwrap(), 0);
        assert_eq!(set.add(at(20.0, 10.0, 0.1)).unwrap(), 1);
        let err = set.add(at(10.0005, 10.0, -0.2)).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::DuplicateMeasurement { existing: 0, .. }
        ));
        assert_eq!(set.add(at(10.01, 10.0, -0.2)).unwrap(), 2);
        assert_eq!(set.count(), 3);
    }

    #[test]
    fn iterates_in_insertion_order() {
        let mut set = MeasurementSet::new();
        add_all(&mut set, [at(3.0, 0.0, 0.3), at(1.0, 0.0, 0.1), at(2.0, 0.0, 0.2)]);
        let xs: Vec<f64> = set.iter().map(|m| m.nominal.x).collect();
        assert_eq!(xs, [3.0, 1.0, 2.0]);
        // restartable
        let again: Vec<f64> = (&set).into_iter().map(|m| m.nominal.x).collect();
        assert_eq!(xs, again);
    }

    #[test]
    fn require_counts_free_parameters() {
        let mut set = MeasurementSet::new();
        add_all(&mut set, [at(0.0, 0.0, 0.0), at(10.0, 0.0, 0.0), at(0.0, 10.0, 0.0)]);
        assert!(set.require(3).is_ok());
        let err = set.require(4).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientData {
                samples: 3,
                required: 4
            }
        ));
    }

    #[test]
    fn stats_summarise_errors() {
        let mut set = MeasurementSet::new();
        assert!(set.stats().is_none());
        add_all(&mut set, [at(0.0, 0.0, 0.3), at(10.0, 0.0, -0.4), at(0.0, 10.0, 0.0)]);
        let stats = set.stats().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, -0.4);
        assert_eq!(stats.max, 0.3);
        assert!((stats.rms - (0.25f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn observation_residual_is_zero_for_firmware_geometry() {
        let firmware = KinematicParameters::new(215.0, 110.0, 250.0);
        let model = DeltaKinematics;
        let obs = Observation::bind(&model, &firmware, at(40.0, -25.0, 0.12)).unwrap();
        // with the geometry it was bound against, the residual is the reported error
        let residual = model.residual(&firmware, &obs).unwrap();
        assert!((residual - 0.12).abs() < 1e-9);
    }
}
