//! Schematic anatomical eye model.
//!
//! Builds the session-level eye geometry from three biometric inputs
//! (axial length, spherical refractive error, laterality) using
//! population-average constants. All coordinates are millimeters in the
//! eye frame: the corneal apex sits at the origin, +Z points out of the
//! eye toward the camera, +Y is superior, and +X is nasal for a right eye
//! (mirrored for a left eye). The construction is pure closed-form
//! arithmetic with a fail-fast ordering check; no iterative search.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Axial length of the population-average emmetropic eye, mm.
pub const DEFAULT_AXIAL_LENGTH_MM: f64 = 23.58;

/// Axial elongation per diopter of myopic refractive error, mm/D.
const ELONGATION_PER_DIOPTER_MM: f64 = 0.299;

/// Posterior chamber ellipsoid semi-radii for the emmetropic eye, mm,
/// ordered [nasal-temporal, superior-inferior, axial].
const POSTERIOR_CHAMBER_RADII_MM: [f64; 3] = [10.18, 10.04, 10.01];

/// Anterior corneal surface radii of curvature, mm, [horizontal, vertical].
/// The two principal meridians differ; an axially symmetric trace is not
/// sufficient for the refraction model downstream.
const CORNEA_FRONT_RADII_MM: [f64; 2] = [7.77, 7.66];

/// Posterior corneal surface radii of curvature, mm, [horizontal, vertical].
const CORNEA_BACK_RADII_MM: [f64; 2] = [6.40, 6.33];

/// Central corneal thickness, mm.
const CORNEA_THICKNESS_MM: f64 = 0.55;

/// Depth of the iris/pupil plane behind the corneal apex, mm.
const IRIS_PLANE_DEPTH_MM: f64 = 3.70;

/// Visible iris radius, mm.
const IRIS_RADIUS_MM: f64 = 5.90;

/// Nasal decentration of the pupil center relative to the optical axis, mm.
const PUPIL_NASAL_OFFSET_MM: f64 = 0.25;

/// Depths of the two independent centers of ocular rotation behind the
/// corneal apex, mm (Fry & Hill population averages).
const AZIMUTH_ROTATION_DEPTH_MM: f64 = 14.70;
const ELEVATION_ROTATION_DEPTH_MM: f64 = 12.20;

/// Refractive indices of the ocular media.
const INDEX_AQUEOUS: f64 = 1.3374;
const INDEX_CORNEA: f64 = 1.376;
const INDEX_VITREOUS: f64 = 1.336;

/// Which eye the anatomy describes. Left-eye geometry is the mirror image
/// of the right-eye constants about the vertical midline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Laterality {
    Right,
    Left,
}

/// Biometric inputs from which the schematic eye is derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EyeBiometrics {
    /// Measured axial length, mm.
    pub axial_length_mm: f64,
    /// Spherical equivalent refractive error, diopters (negative = myopic).
    pub spherical_refraction_d: f64,
    pub laterality: Laterality,
}

impl Default for EyeBiometrics {
    fn default() -> Self {
        EyeBiometrics {
            axial_length_mm: DEFAULT_AXIAL_LENGTH_MM,
            spherical_refraction_d: 0.0,
            laterality: Laterality::Right,
        }
    }
}

/// A triaxial ellipsoid in the eye frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChamberSpec {
    /// Semi-radii, mm, [x, y, z].
    pub radii: [f64; 3],
    /// Center, mm, eye frame.
    pub center: [f64; 3],
}

/// A refracting corneal surface: spherical in each principal meridian,
/// with generally different horizontal and vertical radii.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CornealSurface {
    /// Radii of curvature, mm, [horizontal, vertical].
    pub radii: [f64; 2],
    /// Axial position of the surface apex, mm.
    pub apex_z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefractiveIndices {
    pub aqueous: f64,
    pub cornea: f64,
    pub vitreous: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum EyeModelError {
    #[error("Invalid biometrics: {0}")]
    InvalidBiometrics(String),
    #[error(
        "Chamber ordering violated: posterior chamber center (z = {posterior_z}) must lie \
         behind the iris plane (z = {iris_z}), which must lie behind the corneal apex \
         (z = {apex_z})"
    )]
    ChamberOrdering {
        posterior_z: f64,
        iris_z: f64,
        apex_z: f64,
    },
}

/// The derived, session-level eye geometry.
///
/// Immutable once constructed from [`EyeBiometrics`]; owned exclusively
/// by the [`SceneGeometry`](crate::scene::SceneGeometry) that references
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EyeAnatomy {
    pub posterior_chamber: ChamberSpec,
    pub anterior_chamber: ChamberSpec,
    pub cornea_front: CornealSurface,
    pub cornea_back: CornealSurface,
    /// Pupil center, mm, eye frame.
    pub pupil_center: [f64; 3],
    /// Iris center, mm, eye frame.
    pub iris_center: [f64; 3],
    /// Visible iris radius, mm.
    pub iris_radius: f64,
    /// Center of azimuthal (horizontal) eye rotation, mm.
    pub azimuth_rotation_center: [f64; 3],
    /// Center of elevational (vertical) eye rotation, mm.
    pub elevation_rotation_center: [f64; 3],
    pub indices: RefractiveIndices,
    pub laterality: Laterality,
}

impl EyeAnatomy {
    /// Derives the schematic eye from biometric inputs.
    ///
    /// The posterior chamber ellipsoid is scaled by the ratio of the
    /// measured axial length to the emmetropic default: fully along the
    /// axial radius, by the square root of the ratio equatorially
    /// (elongated eyes grow more axially than equatorially). Left-eye
    /// geometry mirrors the nasal offsets. The ordering invariant is
    /// checked before returning.
    ///
    /// # Errors
    ///
    /// * [`EyeModelError::InvalidBiometrics`] for non-finite or
    ///   non-positive axial length.
    /// * [`EyeModelError::ChamberOrdering`] if the derived geometry places
    ///   the posterior chamber center at or in front of the iris plane, or
    ///   the iris plane at or in front of the corneal apex.
    pub fn build(biometrics: &EyeBiometrics) -> Result<Self, EyeModelError> {
        if !biometrics.axial_length_mm.is_finite() || biometrics.axial_length_mm <= 0.0 {
            return Err(EyeModelError::InvalidBiometrics(format!(
                "axial length must be positive and finite, got {}",
                biometrics.axial_length_mm
            )));
        }
        if !biometrics.spherical_refraction_d.is_finite() {
            return Err(EyeModelError::InvalidBiometrics(
                "spherical refraction must be finite".to_string(),
            ));
        }

        // Refractive error contributes axial elongation when it is not
        // already reflected in the measured axial length; the effective
        // length is whichever is longer.
        let refraction_length =
            DEFAULT_AXIAL_LENGTH_MM - ELONGATION_PER_DIOPTER_MM * biometrics.spherical_refraction_d;
        let axial_length = biometrics.axial_length_mm.max(refraction_length);

        let axial_scale = axial_length / DEFAULT_AXIAL_LENGTH_MM;
        let equatorial_scale = axial_scale.sqrt();

        let posterior_radii = [
            POSTERIOR_CHAMBER_RADII_MM[0] * equatorial_scale,
            POSTERIOR_CHAMBER_RADII_MM[1] * equatorial_scale,
            POSTERIOR_CHAMBER_RADII_MM[2] * axial_scale,
        ];
        // The back pole of the posterior chamber sits at -axial_length.
        let posterior_center_z = -(axial_length - posterior_radii[2]);

        // The anterior chamber ellipsoid approximates the corneal shell;
        // its apex coincides with the corneal apex at the origin.
        let anterior_mean_radius = 0.5 * (CORNEA_FRONT_RADII_MM[0] + CORNEA_FRONT_RADII_MM[1]);
        let anterior_chamber = ChamberSpec {
            radii: [
                CORNEA_FRONT_RADII_MM[0],
                CORNEA_FRONT_RADII_MM[1],
                anterior_mean_radius,
            ],
            center: [0.0, 0.0, -anterior_mean_radius],
        };

        let mirror = match biometrics.laterality {
            Laterality::Right => 1.0,
            Laterality::Left => -1.0,
        };

        let anatomy = EyeAnatomy {
            posterior_chamber: ChamberSpec {
                radii: posterior_radii,
                center: [0.0, 0.0, posterior_center_z],
            },
            anterior_chamber,
            cornea_front: CornealSurface {
                radii: CORNEA_FRONT_RADII_MM,
                apex_z: 0.0,
            },
            cornea_back: CornealSurface {
                radii: CORNEA_BACK_RADII_MM,
                apex_z: -CORNEA_THICKNESS_MM,
            },
            pupil_center: [mirror * PUPIL_NASAL_OFFSET_MM, 0.0, -IRIS_PLANE_DEPTH_MM],
            iris_center: [0.0, 0.0, -IRIS_PLANE_DEPTH_MM],
            iris_radius: IRIS_RADIUS_MM,
            azimuth_rotation_center: [0.0, 0.0, -AZIMUTH_ROTATION_DEPTH_MM * axial_scale],
            elevation_rotation_center: [0.0, 0.0, -ELEVATION_ROTATION_DEPTH_MM * axial_scale],
            indices: RefractiveIndices {
                aqueous: INDEX_AQUEOUS,
                cornea: INDEX_CORNEA,
                vitreous: INDEX_VITREOUS,
            },
            laterality: biometrics.laterality,
        };

        anatomy.check_ordering()?;
        Ok(anatomy)
    }

    /// Re-check the ordering invariant on an anatomy that did not come
    /// from [`EyeAnatomy::build`] (e.g. one loaded from disk).
    pub fn validate(&self) -> Result<(), EyeModelError> {
        self.check_ordering()
    }

    /// Fail-fast ordering invariant: posterior chamber center behind the
    /// iris plane, iris plane behind the corneal apex.
    fn check_ordering(&self) -> Result<(), EyeModelError> {
        let posterior_z = self.posterior_chamber.center[2];
        let iris_z = self.iris_center[2];
        let apex_z = self.cornea_front.apex_z;
        if posterior_z >= iris_z || iris_z >= apex_z {
            return Err(EyeModelError::ChamberOrdering {
                posterior_z,
                iris_z,
                apex_z,
            });
        }
        Ok(())
    }

    pub fn pupil_center_vec(&self) -> Vector3<f64> {
        Vector3::from(self.pupil_center)
    }

    pub fn iris_center_vec(&self) -> Vector3<f64> {
        Vector3::from(self.iris_center)
    }

    pub fn azimuth_rotation_center_vec(&self) -> Vector3<f64> {
        Vector3::from(self.azimuth_rotation_center)
    }

    pub fn elevation_rotation_center_vec(&self) -> Vector3<f64> {
        Vector3::from(self.elevation_rotation_center)
    }

    /// Returns a copy with both rotation-center depths scaled by `factor`.
    /// Used by scene-geometry estimation, which searches a joint
    /// rotation-center scaling alongside the camera translation.
    pub fn with_rotation_scaling(&self, factor: f64) -> Self {
        let mut scaled = self.clone();
        scaled.azimuth_rotation_center[2] *= factor;
        scaled.elevation_rotation_center[2] *= factor;
        scaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_biometrics_build() {
        let anatomy = EyeAnatomy::build(&EyeBiometrics::default()).unwrap();

        // Back pole of the posterior chamber at -axial length.
        let back_pole = anatomy.posterior_chamber.center[2] - anatomy.posterior_chamber.radii[2];
        assert_relative_eq!(back_pole, -DEFAULT_AXIAL_LENGTH_MM, epsilon = 1e-9);

        // Ordering invariant holds for the default eye.
        assert!(anatomy.posterior_chamber.center[2] < anatomy.iris_center[2]);
        assert!(anatomy.iris_center[2] < anatomy.cornea_front.apex_z);
    }

    #[test]
    fn test_myopic_eye_is_longer() {
        let emmetrope = EyeAnatomy::build(&EyeBiometrics::default()).unwrap();
        let myope = EyeAnatomy::build(&EyeBiometrics {
            axial_length_mm: DEFAULT_AXIAL_LENGTH_MM,
            spherical_refraction_d: -4.0,
            laterality: Laterality::Right,
        })
        .unwrap();

        let emmetrope_pole =
            emmetrope.posterior_chamber.center[2] - emmetrope.posterior_chamber.radii[2];
        let myope_pole = myope.posterior_chamber.center[2] - myope.posterior_chamber.radii[2];
        assert!(myope_pole < emmetrope_pole);

        // Rotation centers recede with the longer globe.
        assert!(myope.azimuth_rotation_center[2] < emmetrope.azimuth_rotation_center[2]);
    }

    #[test]
    fn test_laterality_mirrors_nasal_offset() {
        let right = EyeAnatomy::build(&EyeBiometrics::default()).unwrap();
        let left = EyeAnatomy::build(&EyeBiometrics {
            laterality: Laterality::Left,
            ..EyeBiometrics::default()
        })
        .unwrap();

        assert_relative_eq!(right.pupil_center[0], -left.pupil_center[0], epsilon = 1e-12);
        assert_relative_eq!(right.pupil_center[2], left.pupil_center[2], epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_axial_length_rejected() {
        let result = EyeAnatomy::build(&EyeBiometrics {
            axial_length_mm: -5.0,
            ..EyeBiometrics::default()
        });
        assert!(matches!(result, Err(EyeModelError::InvalidBiometrics(_))));
    }

    #[test]
    fn test_chamber_ordering_diagnostic_names_invariant() {
        let anatomy = EyeAnatomy::build(&EyeBiometrics::default()).unwrap();
        let mut broken = anatomy;
        broken.iris_center[2] = 1.0;
        let err = broken.check_ordering().unwrap_err();
        let message = format!("{err}");
        assert!(message.contains("iris plane"));
        assert!(message.contains("corneal apex"));
    }
}
