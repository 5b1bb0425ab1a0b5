// Delta kinematics with per-tower geometry errors

use crate::{
    error::{ReachFailure, Result},
    geometry::{ALPHA, BETA, CarriagePositions, GAMMA, KinematicParameters, Point3D, TOWERS},
    measurement::Observation,
};
use nalgebra::Vector3;

const EPSILON: f64 = 1e-9;

/// Maps carriage positions to effector positions and back for a given
/// parameter snapshot.
///
/// Implementations are stateless; every call depends only on its inputs.
pub trait KinematicModel {
    fn forward_kinematics(
        &self,
        parameters: &KinematicParameters,
        carriages: &CarriagePositions,
    ) -> Result<Point3D>;

    fn inverse_kinematics(
        &self,
        parameters: &KinematicParameters,
        point: &Point3D,
    ) -> Result<CarriagePositions>;

    /// Predicted bed height at the observation's carriages minus the nominal
    /// bed height. Zero when `parameters` describe the machine exactly.
    fn residual(&self, parameters: &KinematicParameters, observation: &Observation) -> Result<f64> {
        let predicted = self.forward_kinematics(parameters, &observation.carriages)?;
        Ok(predicted.z - observation.measurement.nominal.z)
    }
}

/// Linear delta: three vertical towers at nominally 210, 330 and 90 degrees.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeltaKinematics;

impl KinematicModel for DeltaKinematics {
    fn forward_kinematics(
        &self,
        parameters: &KinematicParameters,
        carriages: &CarriagePositions,
    ) -> Result<Point3D> {
        if !carriages.is_finite() {
            return Err(ReachFailure::NonFinite.into());
        }
        let towers = Towers::new(parameters)?;

        let mut centres = [Vector3::zeros(); 3];
        for t in TOWERS {
            let height = towers.home[t] - carriages[t] / parameters.steps_per_unit[t];
            centres[t] = Vector3::new(towers.x[t], towers.y[t], height);
        }

        let effector = trilaterate(&centres, &towers.rod).ok_or(ReachFailure::Carriages {
            a: carriages[ALPHA],
            b: carriages[BETA],
            c: carriages[GAMMA],
        })?;

        let point = Point3D::new(effector.x, effector.y, effector.z);
        if !point.is_finite() {
            return Err(ReachFailure::NonFinite.into());
        }
        Ok(point)
    }

    fn inverse_kinematics(
        &self,
        parameters: &KinematicParameters,
        point: &Point3D,
    ) -> Result<CarriagePositions> {
        if !point.is_finite() {
            return Err(ReachFailure::NonFinite.into());
        }
        let towers = Towers::new(parameters)?;

        let mut carriages = [0.0; 3];
        for t in TOWERS {
            let arm = towers
                .rod_height(t, point.x, point.y)
                .ok_or(ReachFailure::Point {
                    x: point.x,
                    y: point.y,
                    z: point.z,
                })?;
            carriages[t] = (towers.home[t] - (point.z + arm)) * parameters.steps_per_unit[t];
        }

        let carriages = CarriagePositions(carriages);
        if !carriages.is_finite() {
            return Err(ReachFailure::NonFinite.into());
        }
        Ok(carriages)
    }
}

/// Tower columns derived from one parameter snapshot.
struct Towers {
    x: [f64; 3],
    y: [f64; 3],
    rod: [f64; 3],
    // Carriage height above the bed at the homed position
    home: [f64; 3],
}

impl Towers {
    fn new(p: &KinematicParameters) -> Result<Self> {
        if !p.is_finite() {
            return Err(ReachFailure::NonFinite.into());
        }

        let r = [
            p.radius + p.radius_offsets[ALPHA],
            p.radius + p.radius_offsets[BETA],
            p.radius + p.radius_offsets[GAMMA],
        ];
        let a = p.tower_angle_offsets;
        let x = [
            -r[ALPHA] * (30.0 + a[ALPHA]).to_radians().cos(),
            r[BETA] * (30.0 - a[BETA]).to_radians().cos(),
            -r[GAMMA] * a[GAMMA].to_radians().sin(),
        ];
        let y = [
            -r[ALPHA] * (30.0 + a[ALPHA]).to_radians().sin(),
            -r[BETA] * (30.0 - a[BETA]).to_radians().sin(),
            r[GAMMA] * a[GAMMA].to_radians().cos(),
        ];
        let twice_area = (x[BETA] - x[ALPHA]) * (y[GAMMA] - y[ALPHA])
            - (x[GAMMA] - x[ALPHA]) * (y[BETA] - y[ALPHA]);
        if twice_area.abs() < EPSILON {
            return Err(ReachFailure::DegenerateTowers.into());
        }
        let rod = TOWERS.map(|t| p.diagonal_rod + p.rod_offsets[t]);

        let mut towers = Self {
            x,
            y,
            rod,
            home: [0.0; 3],
        };
        for t in TOWERS {
            let centre = towers.rod_height(t, 0.0, 0.0).ok_or(ReachFailure::Point {
                x: 0.0,
                y: 0.0,
                z: p.height,
            })?;
            towers.home[t] = p.endstop_offsets[t] + p.height + centre;
        }
        Ok(towers)
    }

    /// Vertical distance between carriage and effector when the effector is
    /// at (`x`, `y`).
    fn rod_height(&self, t: usize, x: f64, y: f64) -> Option<f64> {
        let dx = self.x[t] - x;
        let dy = self.y[t] - y;
        let h2 = self.rod[t] * self.rod[t] - dx * dx - dy * dy;
        (h2 >= 0.0).then(|| h2.sqrt())
    }
}

/// Lower intersection point of three spheres, or `None` when they do not
/// meet or the centres are degenerate.
fn trilaterate(centres: &[Vector3<f64>; 3], radii: &[f64; 3]) -> Option<Vector3<f64>> {
    let [p1, p2, p3] = centres;
    let [r1, r2, r3] = radii;

    let p21 = p2 - p1;
    let d = p21.norm();
    if d < EPSILON {
        return None;
    }
    let ex = p21 / d;

    let p31 = p3 - p1;
    let i = ex.dot(&p31);
    let ey = p31 - ex * i;
    let ey_norm = ey.norm();
    if ey_norm < EPSILON {
        return None;
    }
    let ey = ey / ey_norm;
    let ez = ex.cross(&ey);
    let j = ey.dot(&p31);

    let x = (r1 * r1 - r2 * r2 + d * d) / (2.0 * d);
    let y = (r1 * r1 - r3 * r3 + i * i + j * j) / (2.0 * j) - i * x / j;
    let z2 = r1 * r1 - x * x - y * y;
    if z2.is_nan() || z2 < 0.0 {
        return None;
    }
    let z = z2.sqrt();

    let base = p1 + ex * x + ey * y;
    let upper = base + ez * z;
    let lower = base - ez * z;
    Some(if upper.z < lower.z { upper } else { lower })
}
