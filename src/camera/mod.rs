use nalgebra::{Matrix2xX, Matrix3xX};
use serde::{Deserialize, Serialize};

pub mod video;

pub use video::VideoCamera;

/// Pinhole intrinsics with an explicit skew term.
///
/// `fx`/`fy` are the focal lengths in pixels, `cx`/`cy` the principal
/// point, and `skew` the axis skew coefficient (almost always zero for
/// consumer eye-tracking cameras, but carried so calibration files
/// round-trip without loss).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub skew: f64,
    pub cx: f64,
    pub cy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Offset between continuous image-plane coordinates and pixel-index
/// coordinates in which pixel centers sit at integer positions.
///
/// The projection arithmetic works in continuous coordinates throughout;
/// the half-pixel shift is applied only at this boundary, never folded
/// into the intrinsics.
pub const PIXEL_CENTER_OFFSET: f64 = 0.5;

/// Convert a continuous image-plane coordinate to the pixel-index
/// convention (pixel centers at integers, first pixel center at 0).
pub fn to_pixel_index(coord: f64) -> f64 {
    coord - PIXEL_CENTER_OFFSET
}

/// Inverse of [`to_pixel_index`].
pub fn from_pixel_index(index: f64) -> f64 {
    index + PIXEL_CENTER_OFFSET
}

#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Distortion coefficients must be finite")]
    DistortionMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraError::YamlError(err.to_string())
    }
}

/// Trait for cameras that map scene-world points to image-plane
/// coordinates.
///
/// Degenerate inputs (zero or negative depth after the extrinsic
/// transform, non-finite coordinates) must produce NaN columns rather
/// than errors: individual points legitimately leave the projective
/// domain when an eye pose moves part of the model behind the camera.
pub trait ProjectiveCamera {
    /// Project a 3×N matrix of scene-world points (mm) to a 2×N matrix of
    /// image-plane coordinates (pixels).
    fn project_points(&self, points: &Matrix3xX<f64>) -> Matrix2xX<f64>;

    /// Validate camera parameters.
    fn validate_params(&self) -> Result<(), CameraError>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraError> {
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
            return Err(CameraError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraError::PrincipalPointMustBeFinite);
        }
        if !intrinsics.skew.is_finite() {
            return Err(CameraError::InvalidParams("skew must be finite".to_string()));
        }
        Ok(())
    }

    pub fn validate_distortion(distortion: &[f64; 2]) -> Result<(), CameraError> {
        if distortion.iter().any(|k| !k.is_finite()) {
            return Err(CameraError::DistortionMustBeFinite);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_index_conversion_round_trip() {
        // The principal point of a 640-wide sensor in continuous
        // coordinates maps to pixel-index 319.5 and back.
        assert_eq!(to_pixel_index(320.0), 319.5);
        assert_eq!(from_pixel_index(319.5), 320.0);
        assert_eq!(from_pixel_index(to_pixel_index(123.25)), 123.25);
    }

    #[test]
    fn test_intrinsics_validation() {
        let valid = Intrinsics {
            fx: 600.0,
            fy: 600.0,
            skew: 0.0,
            cx: 320.0,
            cy: 240.0,
        };
        assert!(validation::validate_intrinsics(&valid).is_ok());

        let bad_skew = Intrinsics {
            skew: f64::NAN,
            ..valid
        };
        assert!(validation::validate_intrinsics(&bad_skew).is_err());

        assert!(validation::validate_distortion(&[0.1, -0.05]).is_ok());
        assert!(validation::validate_distortion(&[f64::INFINITY, 0.0]).is_err());
    }
}
