// Probe point planning

use crate::geometry::Point3D;
use std::f64::consts::PI;

/// `n` bed points on an Archimedean spiral with roughly equal spacing,
/// starting at the bed centre and staying inside `radius`.
///
/// A non-positive radius collapses the pattern to the centre point.
pub fn spiral_points(n: usize, radius: f64) -> Vec<Point3D> {
    if n == 0 {
        return Vec::new();
    }
    if !(radius > 0.0 && radius.is_finite()) {
        return vec![Point3D::default()];
    }

    let a = radius / (2.0 * (n as f64 * PI).sqrt());
    let step = radius * radius / (2.0 * a * n as f64);

    (0..n)
        .map(|i| {
            let angle = (2.0 * i as f64 * step / a).sqrt();
            let r = angle * a;
            Point3D::new(r * angle.cos(), r * angle.sin(), 0.0)
        })
        .collect()
}
