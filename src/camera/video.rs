//! Implements the eye-tracking video camera model.
//!
//! This module provides the [`VideoCamera`] struct: a pinhole camera with
//! a two-coefficient radial distortion polynomial and an extrinsic pose
//! restricted to a single rotation about the optical (Z) axis plus a
//! translation. It adheres to the [`ProjectiveCamera`] trait defined in
//! the parent `camera` module ([`crate::camera`]). The restricted
//! extrinsics match the recording geometry of a head-fixed infrared eye
//! camera: the camera faces the eye down its own optical axis, and only
//! its in-plane roll and its position relative to the eye are free.

use crate::camera::{validation, CameraError, Intrinsics, ProjectiveCamera, Resolution};
use nalgebra::{Matrix2xX, Matrix3xX, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A calibrated eye-tracking video camera.
///
/// The camera sits at `translation` (millimeters, scene-world frame,
/// relative to the origin of the eye's optical axis) looking back along
/// the negative scene Z axis. `rotation_deg` is the roll of the sensor
/// about its optical axis. Distortion is the two-term radial polynomial
/// `d(r) = 1 + k1 r^2 + k2 r^4` applied to normalized image coordinates
/// about the principal point.
///
/// # Examples
///
/// ```rust
/// use nalgebra::{Matrix3xX, Vector3};
/// use pupil_tools::camera::{Intrinsics, ProjectiveCamera, Resolution, VideoCamera};
///
/// let camera = VideoCamera::new(
///     Intrinsics { fx: 600.0, fy: 600.0, skew: 0.0, cx: 320.0, cy: 240.0 },
///     [0.0, 0.0],
///     0.0,
///     Vector3::new(0.0, 0.0, 100.0),
///     Resolution { width: 640, height: 480 },
/// ).unwrap();
///
/// // A point on the optical axis lands on the principal point.
/// let points = Matrix3xX::from_columns(&[Vector3::new(0.0, 0.0, 0.0)]);
/// let image = camera.project_points(&points);
/// assert!((image[(0, 0)] - 320.0).abs() < 1e-12);
/// assert!((image[(1, 0)] - 240.0).abs() < 1e-12);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct VideoCamera {
    /// Intrinsic parameters (fx, fy, skew, cx, cy), in pixels.
    pub intrinsics: Intrinsics,
    /// Radial distortion coefficients `[k1, k2]`.
    pub distortion: [f64; 2],
    /// Sensor roll about the optical axis, in degrees.
    pub rotation_deg: f64,
    /// Camera position relative to the eye's optical-axis origin, in mm.
    pub translation: Vector3<f64>,
    /// Sensor resolution, in pixels.
    pub resolution: Resolution,
}

impl VideoCamera {
    /// Creates a new [`VideoCamera`], validating the parameters.
    ///
    /// # Errors
    ///
    /// Returns a [`CameraError`] if the focal lengths are non-positive,
    /// the principal point or skew is non-finite, or the distortion
    /// coefficients are non-finite.
    pub fn new(
        intrinsics: Intrinsics,
        distortion: [f64; 2],
        rotation_deg: f64,
        translation: Vector3<f64>,
        resolution: Resolution,
    ) -> Result<Self, CameraError> {
        let camera = VideoCamera {
            intrinsics,
            distortion,
            rotation_deg,
            translation,
            resolution,
        };
        camera.validate_params()?;
        Ok(camera)
    }

    /// Project one scene-world point, returning NaN coordinates for
    /// degenerate depth instead of an error.
    pub fn project_point(&self, point: &Vector3<f64>) -> Vector2<f64> {
        // Camera-frame coordinates: the camera looks back down -Z, so the
        // depth of a point is the camera's Z minus the point's Z.
        let xc = point.x - self.translation.x;
        let yc = point.y - self.translation.y;
        let depth = self.translation.z - point.z;

        if !depth.is_finite() || depth < f64::EPSILON.sqrt() || !xc.is_finite() || !yc.is_finite() {
            return Vector2::new(f64::NAN, f64::NAN);
        }

        // Sensor roll about the optical axis.
        let roll = self.rotation_deg.to_radians();
        let (sin_r, cos_r) = roll.sin_cos();
        let xr = cos_r * xc - sin_r * yc;
        let yr = sin_r * xc + cos_r * yc;

        // Normalized image coordinates and the radial distortion factor
        // d(r) = 1 + k1 r^2 + k2 r^4 about the principal point.
        let xn = xr / depth;
        let yn = yr / depth;
        let r2 = xn * xn + yn * yn;
        let d = 1.0 + self.distortion[0] * r2 + self.distortion[1] * r2 * r2;
        let xd = xn * d;
        let yd = yn * d;

        let u = self.intrinsics.fx * xd + self.intrinsics.skew * yd + self.intrinsics.cx;
        let v = self.intrinsics.fy * yd + self.intrinsics.cy;

        Vector2::new(u, v)
    }
}

impl fmt::Debug for VideoCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VideoCamera [fx: {} fy: {} cx: {} cy: {} distortion: {:?} rotation: {}deg translation: [{}, {}, {}]]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortion,
            self.rotation_deg,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        )
    }
}

impl ProjectiveCamera for VideoCamera {
    fn project_points(&self, points: &Matrix3xX<f64>) -> Matrix2xX<f64> {
        let mut image = Matrix2xX::zeros(points.ncols());
        for i in 0..points.ncols() {
            let projected = self.project_point(&points.column(i).into_owned());
            image[(0, i)] = projected.x;
            image[(1, i)] = projected.y;
        }
        image
    }

    fn validate_params(&self) -> Result<(), CameraError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        validation::validate_distortion(&self.distortion)?;
        if !self.rotation_deg.is_finite() {
            return Err(CameraError::InvalidParams(
                "rotation must be finite".to_string(),
            ));
        }
        if self.translation.iter().any(|t| !t.is_finite()) {
            return Err(CameraError::InvalidParams(
                "translation must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn get_sample_camera() -> VideoCamera {
        VideoCamera::new(
            Intrinsics {
                fx: 600.0,
                fy: 600.0,
                skew: 0.0,
                cx: 320.0,
                cy: 240.0,
            },
            [0.0, 0.0],
            0.0,
            Vector3::new(0.0, 0.0, 100.0),
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_on_axis_point_hits_principal_point() {
        let camera = get_sample_camera();
        let image = camera.project_point(&Vector3::new(0.0, 0.0, 0.0));
        assert_relative_eq!(image.x, 320.0, epsilon = 1e-12);
        assert_relative_eq!(image.y, 240.0, epsilon = 1e-12);
    }

    #[test]
    fn test_perspective_scaling_with_depth() {
        let camera = get_sample_camera();
        // A point 5 mm off-axis at the eye origin: u - cx = fx * 5 / 100.
        let near = camera.project_point(&Vector3::new(5.0, 0.0, 0.0));
        assert_relative_eq!(near.x - 320.0, 600.0 * 5.0 / 100.0, epsilon = 1e-12);

        // The same lateral offset 50 mm farther away subtends half the angle.
        let far = camera.project_point(&Vector3::new(5.0, 0.0, -100.0));
        assert_relative_eq!(far.x - 320.0, 600.0 * 5.0 / 200.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_depth_point_is_nan_not_error() {
        let camera = get_sample_camera();
        let image = camera.project_point(&Vector3::new(1.0, 1.0, 100.0));
        assert!(image.x.is_nan());
        assert!(image.y.is_nan());

        // Behind the camera as well.
        let behind = camera.project_point(&Vector3::new(1.0, 1.0, 150.0));
        assert!(behind.x.is_nan());
    }

    #[test]
    fn test_radial_distortion_pushes_points_outward() {
        let mut camera = get_sample_camera();
        camera.distortion = [0.1, 0.0];
        let undistorted = get_sample_camera().project_point(&Vector3::new(10.0, 0.0, 0.0));
        let distorted = camera.project_point(&Vector3::new(10.0, 0.0, 0.0));
        // Positive k1 magnifies off-axis points.
        assert!(distorted.x > undistorted.x);
    }

    #[test]
    fn test_sensor_roll_rotates_image_offsets() {
        let mut camera = get_sample_camera();
        camera.rotation_deg = 90.0;
        let image = camera.project_point(&Vector3::new(5.0, 0.0, 0.0));
        // A 90 degree roll maps a +x offset onto the image +y axis.
        assert_relative_eq!(image.x, 320.0, epsilon = 1e-9);
        assert_relative_eq!(image.y - 240.0, 600.0 * 5.0 / 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_matrix_projection_matches_pointwise() {
        let camera = get_sample_camera();
        let points = Matrix3xX::from_columns(&[
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(3.0, -2.0, 1.0),
            Vector3::new(-4.0, 5.0, -2.0),
        ]);
        let image = camera.project_points(&points);
        for i in 0..points.ncols() {
            let single = camera.project_point(&points.column(i).into_owned());
            assert_relative_eq!(image[(0, i)], single.x, epsilon = 1e-12);
            assert_relative_eq!(image[(1, i)], single.y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_invalid_focal_length_rejected() {
        let result = VideoCamera::new(
            Intrinsics {
                fx: -1.0,
                fy: 600.0,
                skew: 0.0,
                cx: 320.0,
                cy: 240.0,
            },
            [0.0, 0.0],
            0.0,
            Vector3::new(0.0, 0.0, 100.0),
            Resolution {
                width: 640,
                height: 480,
            },
        );
        assert!(matches!(
            result,
            Err(CameraError::FocalLengthMustBePositive)
        ));
    }
}
