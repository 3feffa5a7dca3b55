//! Ellipse representations and geometry.
//!
//! The canonical exchange format throughout the crate is the
//! "transparent" ellipse: the 5-tuple (center x, center y, area,
//! eccentricity, theta) in image-plane pixel units. It is called
//! transparent because each parameter is directly meaningful, unlike the
//! algebraic conic coefficients that the direct fitting method works in.
//! This module provides the type, its invariants, conversions to and from
//! the geometric (semi-axes) form, and the point-to-boundary distance
//! used as the fitting residual.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub mod fit;

pub use fit::{
    fit_ellipse_constrained, fit_ellipse_direct, split_half_sd, EllipseFitError,
};

/// A 5-parameter transparent ellipse.
///
/// Invariants maintained by all constructors in this crate:
/// * `area >= 0`
/// * `eccentricity` in `[0, 1)`
/// * `theta` in `[0, pi)`, wrapped by adding pi when negative
///
/// A frame with no measurable pupil is represented by the all-NaN value
/// from [`TransparentEllipse::nan`], never by an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransparentEllipse {
    pub center_x: f64,
    pub center_y: f64,
    pub area: f64,
    pub eccentricity: f64,
    pub theta: f64,
}

/// Geometric ellipse parameters: center, semi-axes, major-axis angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricEllipse {
    pub center_x: f64,
    pub center_y: f64,
    pub semi_major: f64,
    pub semi_minor: f64,
    /// Angle of the major axis from +x, radians, in `[0, pi)`.
    pub angle: f64,
}

/// Wrap an angle into `[0, pi)` by adding or subtracting pi.
pub fn wrap_theta(theta: f64) -> f64 {
    if !theta.is_finite() {
        return theta;
    }
    let mut t = theta % PI;
    if t < 0.0 {
        t += PI;
    }
    t
}

impl TransparentEllipse {
    /// The undefined-ellipse sentinel used for dropped or blink frames.
    pub fn nan() -> Self {
        TransparentEllipse {
            center_x: f64::NAN,
            center_y: f64::NAN,
            area: f64::NAN,
            eccentricity: f64::NAN,
            theta: f64::NAN,
        }
    }

    /// True when any parameter is non-finite.
    pub fn is_nan(&self) -> bool {
        !self.as_array().iter().all(|v| v.is_finite())
    }

    pub fn as_array(&self) -> [f64; 5] {
        [
            self.center_x,
            self.center_y,
            self.area,
            self.eccentricity,
            self.theta,
        ]
    }

    pub fn from_array(values: [f64; 5]) -> Self {
        TransparentEllipse {
            center_x: values[0],
            center_y: values[1],
            area: values[2],
            eccentricity: values[3],
            theta: wrap_theta(values[4]),
        }
    }

    /// Convert from the geometric form, normalizing axis order and angle.
    pub fn from_geometric(geometric: &GeometricEllipse) -> Self {
        let (major, minor, mut angle) = if geometric.semi_major >= geometric.semi_minor {
            (geometric.semi_major, geometric.semi_minor, geometric.angle)
        } else {
            (
                geometric.semi_minor,
                geometric.semi_major,
                geometric.angle + PI / 2.0,
            )
        };
        let ratio = (minor / major).clamp(0.0, 1.0);
        let eccentricity = (1.0 - ratio * ratio).sqrt();
        // Theta of a circle is indeterminate; pin it to zero.
        if eccentricity < 1e-12 {
            angle = 0.0;
        }
        TransparentEllipse {
            center_x: geometric.center_x,
            center_y: geometric.center_y,
            area: PI * major * minor,
            eccentricity,
            theta: wrap_theta(angle),
        }
    }

    /// Convert to the geometric form. Returns `None` when the parameters
    /// do not describe a real ellipse (non-finite, non-positive area, or
    /// eccentricity outside `[0, 1)`).
    pub fn to_geometric(&self) -> Option<GeometricEllipse> {
        if self.is_nan() || self.area <= 0.0 || !(0.0..1.0).contains(&self.eccentricity) {
            return None;
        }
        let ratio = (1.0 - self.eccentricity * self.eccentricity).sqrt();
        let semi_major = (self.area / (PI * ratio)).sqrt();
        let semi_minor = semi_major * ratio;
        Some(GeometricEllipse {
            center_x: self.center_x,
            center_y: self.center_y,
            semi_major,
            semi_minor,
            angle: self.theta,
        })
    }

    /// Sample `n` points on the boundary, in parameter-angle order.
    pub fn sample_boundary(&self, n: usize) -> Option<Vec<Vector2<f64>>> {
        let geometric = self.to_geometric()?;
        let (sin_t, cos_t) = geometric.angle.sin_cos();
        let mut points = Vec::with_capacity(n);
        for i in 0..n {
            let phi = 2.0 * PI * i as f64 / n as f64;
            let ex = geometric.semi_major * phi.cos();
            let ey = geometric.semi_minor * phi.sin();
            points.push(Vector2::new(
                geometric.center_x + cos_t * ex - sin_t * ey,
                geometric.center_y + sin_t * ex + cos_t * ey,
            ));
        }
        Some(points)
    }
}

/// Approximate geometric distance from a point to the ellipse boundary.
///
/// The nearest boundary point is approximated by the standard parameter
/// angle `phi = atan2(a y', b x')` in the ellipse frame; exact for
/// circles and accurate to a small fraction of the axis lengths at the
/// eccentricities pupil images reach. Invalid ellipse parameters yield a
/// large finite penalty so optimizers can retreat from them.
pub fn point_ellipse_distance(ellipse: &TransparentEllipse, point: &Vector2<f64>) -> f64 {
    fit::point_ellipse_distance_scalar(&ellipse.as_array(), point.x, point.y)
}
