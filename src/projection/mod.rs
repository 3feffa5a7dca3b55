//! Forward projection: from an eye pose to the image-plane pupil ellipse.
//!
//! The projector composes the anatomical eye model, the corneal ray
//! tracer, and the camera model. For a given pose it generates the 3D
//! pupil boundary (and, on request, the full labeled eye-model point
//! cloud), replaces every refractable point with its virtual image as
//! seen through the cornea, applies the rigid 3-axis eye rotation about
//! the two anatomical rotation centers, re-expresses the points in the
//! scene-world frame, and projects them through the camera. When at least
//! five finite pupil-perimeter image points survive, they are fitted with
//! the direct method to produce the transparent pupil ellipse.
//!
//! The whole chain is deterministic: identical inputs produce identical
//! outputs, bit for bit, up to the fixed tolerance of the ray tracer's
//! one-dimensional search.

use log::trace;
use nalgebra::{Matrix2xX, Matrix3xX, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::camera::ProjectiveCamera;
use crate::ellipse::{fit_ellipse_direct, TransparentEllipse};
use crate::eye::{ChamberSpec, EyeAnatomy};
use crate::raytrace::{virtual_image_point, TraceOptions};
use crate::scene::SceneGeometry;

/// Latitude/longitude resolution of the chamber meshes in the full-model
/// point cloud.
const CHAMBER_MESH_LATITUDES: usize = 8;
const CHAMBER_MESH_LONGITUDES: usize = 12;

/// One frame's eye state: rotation angles in degrees and the physical
/// pupil radius in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyePose {
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
    pub torsion_deg: f64,
    pub pupil_radius_mm: f64,
}

impl EyePose {
    pub fn new(azimuth_deg: f64, elevation_deg: f64, torsion_deg: f64, pupil_radius_mm: f64) -> Self {
        EyePose {
            azimuth_deg,
            elevation_deg,
            torsion_deg,
            pupil_radius_mm,
        }
    }

    /// The undefined-pose sentinel used for unfittable frames.
    pub fn nan() -> Self {
        EyePose::new(f64::NAN, f64::NAN, f64::NAN, f64::NAN)
    }

    pub fn is_nan(&self) -> bool {
        !self.as_array().iter().all(|v| v.is_finite())
    }

    pub fn as_array(&self) -> [f64; 4] {
        [
            self.azimuth_deg,
            self.elevation_deg,
            self.torsion_deg,
            self.pupil_radius_mm,
        ]
    }

    pub fn from_array(values: [f64; 4]) -> Self {
        EyePose::new(values[0], values[1], values[2], values[3])
    }
}

/// Semantic tag for each column of the projected point cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointLabel {
    PupilPerimeter,
    IrisPerimeter,
    PupilCenter,
    IrisCenter,
    AzimuthRotationCenter,
    ElevationRotationCenter,
    AnteriorChamber,
    PosteriorChamber,
}

impl PointLabel {
    /// Whether points with this label are seen through the cornea and
    /// must be replaced by their virtual image. Chamber mesh points are
    /// display geometry and are not individually refracted.
    pub fn is_refracted(&self) -> bool {
        matches!(
            self,
            PointLabel::PupilPerimeter
                | PointLabel::IrisPerimeter
                | PointLabel::PupilCenter
                | PointLabel::IrisCenter
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProjectionOptions {
    /// Also generate the iris, centers, and chamber meshes.
    pub full_model: bool,
    /// Number of points on the pupil perimeter.
    pub pupil_perimeter_points: usize,
    /// Corneal refraction on/off. Disabling it turns the projector into a
    /// plain perspective model, which the round-trip tests rely on.
    pub refraction: bool,
    pub trace: TraceOptions,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        ProjectionOptions {
            full_model: false,
            pupil_perimeter_points: 16,
            refraction: true,
            trace: TraceOptions::default(),
        }
    }
}

/// Output of the forward projector.
#[derive(Debug, Clone)]
pub struct EyeProjection {
    /// Transparent ellipse fitted to the pupil-perimeter image points;
    /// all-NaN when undefined (fewer than 5 finite points or zero radius).
    pub ellipse: TransparentEllipse,
    /// 2xN image-plane coordinates, pixels. NaN columns mark points that
    /// failed refraction or left the projective domain.
    pub image_points: Matrix2xX<f64>,
    /// 3xN scene-world coordinates after rotation and axis permutation.
    pub scene_points: Matrix3xX<f64>,
    /// 3xN eye-frame coordinates (refraction applied, rotation not).
    pub eye_points: Matrix3xX<f64>,
    pub labels: Vec<PointLabel>,
}

/// Rigid eye rotation: elevation about the elevational center, then
/// azimuth about the azimuthal center, then torsion about the optical
/// axis, composed in that fixed order.
///
/// The elevation angle enters negated so that positive elevation raises
/// the pupil in the scene (and, through the vertical flip below, in the
/// presented image). This is a pinned convention, regression-tested, not
/// derived from handedness.
fn rotate_eye_point(point: &Vector3<f64>, pose: &EyePose, eye: &EyeAnatomy) -> Vector3<f64> {
    let elevation = Rotation3::from_axis_angle(
        &Vector3::x_axis(),
        -pose.elevation_deg.to_radians(),
    );
    let azimuth = Rotation3::from_axis_angle(&Vector3::y_axis(), pose.azimuth_deg.to_radians());
    let torsion = Rotation3::from_axis_angle(&Vector3::z_axis(), pose.torsion_deg.to_radians());

    let c_ele = eye.elevation_rotation_center_vec();
    let c_azi = eye.azimuth_rotation_center_vec();

    let p = elevation * (point - c_ele) + c_ele;
    let p = azimuth * (p - c_azi) + c_azi;
    torsion * p
}

/// Inverse of [`rotate_eye_point`]: used to counter-rotate the camera
/// nodal point into the unrotated eye frame for the ray tracer, whose
/// corneal surfaces are fixed in that frame.
fn counter_rotate_into_eye_frame(
    point: &Vector3<f64>,
    pose: &EyePose,
    eye: &EyeAnatomy,
) -> Vector3<f64> {
    let elevation = Rotation3::from_axis_angle(
        &Vector3::x_axis(),
        -pose.elevation_deg.to_radians(),
    );
    let azimuth = Rotation3::from_axis_angle(&Vector3::y_axis(), pose.azimuth_deg.to_radians());
    let torsion = Rotation3::from_axis_angle(&Vector3::z_axis(), pose.torsion_deg.to_radians());

    let c_ele = eye.elevation_rotation_center_vec();
    let c_azi = eye.azimuth_rotation_center_vec();

    let p = torsion.inverse() * point;
    let p = azimuth.inverse() * (p - c_azi) + c_azi;
    elevation.inverse() * (p - c_ele) + c_ele
}

/// Eye frame to scene-world frame: the horizontal and depth axes carry
/// over, the vertical axis flips so that positive elevation moves the
/// pupil image upward in the presented frame.
fn eye_to_scene(point: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(point.x, -point.y, point.z)
}

/// Scene-world frame to eye frame (the permutation is its own inverse).
fn scene_to_eye(point: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(point.x, -point.y, point.z)
}

/// Evenly spaced points on a circle in a frontal plane.
fn circle_points(center: &Vector3<f64>, radius: f64, n: usize) -> Vec<Vector3<f64>> {
    (0..n)
        .map(|i| {
            let phi = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
            Vector3::new(
                center.x + radius * phi.cos(),
                center.y + radius * phi.sin(),
                center.z,
            )
        })
        .collect()
}

/// Deterministic latitude/longitude tessellation of a chamber ellipsoid,
/// cropped by the caller's axial clipping predicate.
fn chamber_mesh<F>(chamber: &ChamberSpec, keep: F) -> Vec<Vector3<f64>>
where
    F: Fn(f64) -> bool,
{
    let mut points = Vec::new();
    for i in 1..CHAMBER_MESH_LATITUDES {
        let lat = std::f64::consts::PI * i as f64 / CHAMBER_MESH_LATITUDES as f64;
        for j in 0..CHAMBER_MESH_LONGITUDES {
            let lon = 2.0 * std::f64::consts::PI * j as f64 / CHAMBER_MESH_LONGITUDES as f64;
            let point = Vector3::new(
                chamber.center[0] + chamber.radii[0] * lat.sin() * lon.cos(),
                chamber.center[1] + chamber.radii[1] * lat.sin() * lon.sin(),
                chamber.center[2] + chamber.radii[2] * lat.cos(),
            );
            if keep(point.z) {
                points.push(point);
            }
        }
    }
    points
}

/// Project an eye pose through the scene geometry to the image plane.
///
/// See the module documentation for the stage order. A NaN pose yields a
/// projection whose ellipse is the NaN sentinel and whose point cloud is
/// empty; per-point failures (refraction beyond the critical angle, zero
/// projective depth) yield NaN columns and are excluded from the ellipse
/// fit rather than failing the frame.
pub fn project_eye_pose(
    pose: &EyePose,
    scene: &SceneGeometry,
    options: &ProjectionOptions,
) -> EyeProjection {
    if pose.is_nan() {
        return EyeProjection {
            ellipse: TransparentEllipse::nan(),
            image_points: Matrix2xX::zeros(0),
            scene_points: Matrix3xX::zeros(0),
            eye_points: Matrix3xX::zeros(0),
            labels: Vec::new(),
        };
    }

    let eye = &scene.eye;

    // Stage 1: labeled eye-frame points.
    let mut points: Vec<Vector3<f64>> = Vec::new();
    let mut labels: Vec<PointLabel> = Vec::new();

    for p in circle_points(
        &eye.pupil_center_vec(),
        pose.pupil_radius_mm,
        options.pupil_perimeter_points,
    ) {
        points.push(p);
        labels.push(PointLabel::PupilPerimeter);
    }

    if options.full_model {
        for p in circle_points(
            &eye.iris_center_vec(),
            eye.iris_radius,
            options.pupil_perimeter_points,
        ) {
            points.push(p);
            labels.push(PointLabel::IrisPerimeter);
        }
        points.push(eye.pupil_center_vec());
        labels.push(PointLabel::PupilCenter);
        points.push(eye.iris_center_vec());
        labels.push(PointLabel::IrisCenter);
        points.push(eye.azimuth_rotation_center_vec());
        labels.push(PointLabel::AzimuthRotationCenter);
        points.push(eye.elevation_rotation_center_vec());
        labels.push(PointLabel::ElevationRotationCenter);

        let iris_z = eye.iris_center[2];
        let posterior_center_z = eye.posterior_chamber.center[2];
        for p in chamber_mesh(&eye.posterior_chamber, |z| z > posterior_center_z && z < iris_z) {
            points.push(p);
            labels.push(PointLabel::PosteriorChamber);
        }
        for p in chamber_mesh(&eye.anterior_chamber, |z| z > iris_z) {
            points.push(p);
            labels.push(PointLabel::AnteriorChamber);
        }
    }

    // Stage 2: corneal refraction of the tagged points. The nodal point
    // is counter-rotated into the eye frame, where the corneal surfaces
    // are fixed.
    if options.refraction {
        let nodal_scene = scene.camera.translation;
        let nodal_eye = counter_rotate_into_eye_frame(&scene_to_eye(&nodal_scene), pose, eye);
        for (point, label) in points.iter_mut().zip(labels.iter()) {
            if label.is_refracted() {
                match virtual_image_point(point, &nodal_eye, &scene.optical_system, &options.trace)
                {
                    Ok(virtual_point) => *point = virtual_point,
                    Err(err) => {
                        // Suppress the point, not the frame.
                        trace!("refraction failed for {label:?}: {err}");
                        *point = Vector3::new(f64::NAN, f64::NAN, f64::NAN);
                    }
                }
            }
        }
    }

    let eye_points = if points.is_empty() {
        Matrix3xX::zeros(0)
    } else {
        Matrix3xX::from_columns(&points)
    };

    // Stages 3-4: rigid rotation about the rotation centers, then the
    // axis permutation into the scene-world frame.
    let scene_columns: Vec<Vector3<f64>> = points
        .iter()
        .map(|p| eye_to_scene(&rotate_eye_point(p, pose, eye)))
        .collect();
    let scene_points = if scene_columns.is_empty() {
        Matrix3xX::zeros(0)
    } else {
        Matrix3xX::from_columns(&scene_columns)
    };

    // Stage 5: camera projection.
    let image_points = scene.camera.project_points(&scene_points);

    // Stage 6: transparent ellipse of the pupil perimeter.
    let perimeter: Vec<Vector2<f64>> = labels
        .iter()
        .zip(image_points.column_iter())
        .filter(|(label, _)| **label == PointLabel::PupilPerimeter)
        .map(|(_, col)| Vector2::new(col[0], col[1]))
        .filter(|p| p.x.is_finite() && p.y.is_finite())
        .collect();

    let ellipse = if perimeter.len() >= 5 && pose.pupil_radius_mm > 0.0 {
        match fit_ellipse_direct(&perimeter) {
            Ok((ellipse, _)) => ellipse,
            Err(_) => TransparentEllipse::nan(),
        }
    } else {
        TransparentEllipse::nan()
    };

    EyeProjection {
        ellipse,
        image_points,
        scene_points,
        eye_points,
        labels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution, VideoCamera};
    use crate::eye::{EyeAnatomy, EyeBiometrics, Laterality};
    use approx::assert_relative_eq;

    fn sample_scene(camera_depth: f64, laterality: Laterality) -> SceneGeometry {
        let eye = EyeAnatomy::build(&EyeBiometrics {
            laterality,
            ..EyeBiometrics::default()
        })
        .unwrap();
        let camera = VideoCamera::new(
            Intrinsics {
                fx: 600.0,
                fy: 600.0,
                skew: 0.0,
                cx: 320.0,
                cy: 240.0,
            },
            [0.0, 0.0],
            0.0,
            nalgebra::Vector3::new(0.0, 0.0, camera_depth),
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap();
        SceneGeometry::assemble(eye, camera, 1.0).unwrap()
    }

    fn primary_pose(radius: f64) -> EyePose {
        EyePose::new(0.0, 0.0, 0.0, radius)
    }

    #[test]
    fn test_primary_position_is_near_principal_point_and_circular() {
        let scene = sample_scene(100.0, Laterality::Right);
        let projection =
            project_eye_pose(&primary_pose(2.0), &scene, &ProjectionOptions::default());
        let ellipse = projection.ellipse;

        assert!(!ellipse.is_nan());
        // The pupil's small nasal decentration keeps the center within a
        // few pixels of the principal point.
        assert!((ellipse.center_x - 320.0).abs() < 5.0);
        assert!((ellipse.center_y - 240.0).abs() < 5.0);
        assert!(ellipse.area > 0.0);
        assert!(ellipse.eccentricity < 0.2, "ecc = {}", ellipse.eccentricity);
        assert!(ellipse.theta >= 0.0 && ellipse.theta < std::f64::consts::PI);
    }

    #[test]
    fn test_area_monotonic_in_pupil_radius() {
        let scene = sample_scene(100.0, Laterality::Right);
        let mut last_area = 0.0;
        for radius in [1.0, 1.5, 2.0, 2.5, 3.0] {
            let projection =
                project_eye_pose(&primary_pose(radius), &scene, &ProjectionOptions::default());
            assert!(
                projection.ellipse.area > last_area,
                "area not increasing at radius {radius}"
            );
            last_area = projection.ellipse.area;
        }
    }

    #[test]
    fn test_area_monotonic_in_camera_depth() {
        let mut last_area = f64::INFINITY;
        for depth in [80.0, 100.0, 125.0, 150.0] {
            let scene = sample_scene(depth, Laterality::Right);
            let projection =
                project_eye_pose(&primary_pose(2.0), &scene, &ProjectionOptions::default());
            assert!(
                projection.ellipse.area < last_area,
                "area not decreasing at depth {depth}"
            );
            last_area = projection.ellipse.area;
        }
    }

    #[test]
    fn test_projective_depth_scaling_of_diameter() {
        // Two scenes differing only in camera depth; pixel diameters scale
        // with the inverse ratio of the pupil-to-camera distances.
        let mut options = ProjectionOptions::default();
        options.refraction = false;

        let near = project_eye_pose(
            &primary_pose(2.0),
            &sample_scene(65.0, Laterality::Right),
            &options,
        );
        let far = project_eye_pose(
            &primary_pose(2.0),
            &sample_scene(100.0, Laterality::Right),
            &options,
        );

        let diameter = |e: &TransparentEllipse| 2.0 * (e.area / std::f64::consts::PI).sqrt();
        let measured_ratio = diameter(&near.ellipse) / diameter(&far.ellipse);
        // The pupil plane sits 3.7 mm behind the origin.
        let expected_ratio = (100.0 + 3.7) / (65.0 + 3.7);
        assert_relative_eq!(measured_ratio, expected_ratio, epsilon = 0.01);
    }

    #[test]
    fn test_positive_elevation_moves_image_up() {
        let scene = sample_scene(100.0, Laterality::Right);
        let level = project_eye_pose(&primary_pose(2.0), &scene, &ProjectionOptions::default());
        let raised = project_eye_pose(
            &EyePose::new(0.0, 10.0, 0.0, 2.0),
            &scene,
            &ProjectionOptions::default(),
        );
        // Image rows grow downward, so upward motion lowers center_y.
        assert!(raised.ellipse.center_y < level.ellipse.center_y - 5.0);
    }

    #[test]
    fn test_positive_azimuth_moves_image_right() {
        let scene = sample_scene(100.0, Laterality::Right);
        let centered = project_eye_pose(&primary_pose(2.0), &scene, &ProjectionOptions::default());
        let turned = project_eye_pose(
            &EyePose::new(10.0, 0.0, 0.0, 2.0),
            &scene,
            &ProjectionOptions::default(),
        );
        assert!(turned.ellipse.center_x > centered.ellipse.center_x + 5.0);
    }

    #[test]
    fn test_laterality_mirror_symmetry() {
        let right_scene = sample_scene(100.0, Laterality::Right);
        let left_scene = sample_scene(100.0, Laterality::Left);

        let right = project_eye_pose(
            &EyePose::new(12.0, 4.0, 0.0, 2.0),
            &right_scene,
            &ProjectionOptions::default(),
        );
        let left = project_eye_pose(
            &EyePose::new(-12.0, 4.0, 0.0, 2.0),
            &left_scene,
            &ProjectionOptions::default(),
        );

        assert_relative_eq!(
            right.ellipse.center_x - 320.0,
            -(left.ellipse.center_x - 320.0),
            epsilon = 1e-3
        );
        assert_relative_eq!(right.ellipse.center_y, left.ellipse.center_y, epsilon = 1e-3);
    }

    #[test]
    fn test_zero_radius_has_undefined_ellipse() {
        let scene = sample_scene(100.0, Laterality::Right);
        let projection =
            project_eye_pose(&primary_pose(0.0), &scene, &ProjectionOptions::default());
        assert!(projection.ellipse.is_nan());
    }

    #[test]
    fn test_nan_pose_propagates_sentinel() {
        let scene = sample_scene(100.0, Laterality::Right);
        let projection =
            project_eye_pose(&EyePose::nan(), &scene, &ProjectionOptions::default());
        assert!(projection.ellipse.is_nan());
        assert_eq!(projection.labels.len(), 0);
    }

    #[test]
    fn test_full_model_point_cloud_labels() {
        let scene = sample_scene(100.0, Laterality::Right);
        let options = ProjectionOptions {
            full_model: true,
            ..ProjectionOptions::default()
        };
        let projection = project_eye_pose(&primary_pose(2.0), &scene, &options);

        let count = |label: PointLabel| {
            projection
                .labels
                .iter()
                .filter(|l| **l == label)
                .count()
        };
        assert_eq!(count(PointLabel::PupilPerimeter), 16);
        assert_eq!(count(PointLabel::IrisPerimeter), 16);
        assert_eq!(count(PointLabel::PupilCenter), 1);
        assert_eq!(count(PointLabel::AzimuthRotationCenter), 1);
        assert!(count(PointLabel::PosteriorChamber) > 0);
        assert!(count(PointLabel::AnteriorChamber) > 0);
        assert_eq!(projection.labels.len(), projection.image_points.ncols());

        // Posterior chamber points honor the clipping planes.
        let iris_z = scene.eye.iris_center[2];
        let posterior_center_z = scene.eye.posterior_chamber.center[2];
        for (label, col) in projection.labels.iter().zip(projection.eye_points.column_iter()) {
            if *label == PointLabel::PosteriorChamber {
                assert!(col[2] > posterior_center_z && col[2] < iris_z);
            }
        }
    }

    #[test]
    fn test_projection_is_deterministic() {
        let scene = sample_scene(100.0, Laterality::Right);
        let pose = EyePose::new(7.0, -4.0, 1.0, 2.3);
        let first = project_eye_pose(&pose, &scene, &ProjectionOptions::default());
        let second = project_eye_pose(&pose, &scene, &ProjectionOptions::default());
        assert_eq!(first.ellipse.as_array(), second.ellipse.as_array());
        assert_eq!(first.image_points, second.image_points);
    }
}
