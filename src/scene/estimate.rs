//! Scene-geometry estimation: the outer calibration loop.
//!
//! Given a corpus of pupil ellipses observed across many frames, the
//! estimator searches the camera translation and a joint scaling of the
//! two eye-rotation-center depths for the combination that lets the
//! per-frame pose solver reproduce every observation best. Each candidate
//! scene is scored by running the inverse solver (with tight budgets) on
//! boundary points sampled from each observed ellipse and summing the
//! per-frame residuals; the outer search is the same bounded damped
//! least-squares loop the pose solver uses.

use log::info;
use nalgebra::DVector;

use crate::camera::VideoCamera;
use crate::ellipse::TransparentEllipse;
use crate::eye::EyeAnatomy;
use crate::optimization::least_squares::{minimize_bounded, SearchOptions};
use crate::pose::{solve_eye_pose, PoseSearchOptions};
use crate::scene::{SceneError, SceneGeometry};

/// Number of boundary points sampled from each observed ellipse when
/// scoring a candidate scene.
const OBSERVATION_BOUNDARY_POINTS: usize = 12;

/// Options for the scene-geometry search.
#[derive(Debug, Clone)]
pub struct SceneSearchOptions {
    /// Box constraints on the camera translation, mm.
    pub translation_lower: [f64; 3],
    pub translation_upper: [f64; 3],
    /// Bounds on the joint rotation-center depth scaling.
    pub rotation_scaling_bounds: (f64, f64),
    pub search: SearchOptions,
    /// Budgets for the inner per-observation pose solves. Kept tight by
    /// default; the outer loop calls the inner solver many times.
    pub pose: PoseSearchOptions,
}

impl Default for SceneSearchOptions {
    fn default() -> Self {
        let mut pose = PoseSearchOptions::default();
        pose.retry_budget = 0;
        pose.n_splits = 0;
        pose.search.max_iterations = 25;
        SceneSearchOptions {
            translation_lower: [-20.0, -20.0, 30.0],
            translation_upper: [20.0, 20.0, 200.0],
            rotation_scaling_bounds: (0.75, 1.25),
            // The outer Jacobian differences through the inner pose
            // solver, so the probe step must be large enough that the
            // residual change dominates the inner solver's convergence
            // noise.
            search: SearchOptions {
                max_iterations: 20,
                gradient_step: 1e-3,
                ..SearchOptions::default()
            },
            pose,
        }
    }
}

/// Estimate the camera depth from the largest observed iris diameter via
/// the projective scaling law: the visible iris has a known physical
/// diameter, so its pixel extent fixes the distance to the iris plane.
/// Used to seed the translation search.
pub fn depth_from_iris_diameter(
    iris_diameter_px: f64,
    camera: &VideoCamera,
    eye: &EyeAnatomy,
) -> Option<f64> {
    if !(iris_diameter_px > 0.0) {
        return None;
    }
    let distance_to_iris = camera.intrinsics.fx * 2.0 * eye.iris_radius / iris_diameter_px;
    // Camera translation is measured from the corneal apex origin; the
    // iris plane sits behind it.
    Some(distance_to_iris + eye.iris_center[2])
}

/// Score one candidate scene: per-observation pose-fit residuals.
fn scene_residuals(
    params: &DVector<f64>,
    observations: &[TransparentEllipse],
    eye: &EyeAnatomy,
    camera: &VideoCamera,
    constraint_tolerance: f64,
    pose_options: &PoseSearchOptions,
) -> DVector<f64> {
    let mut residuals = DVector::from_element(observations.len(), 1e3);

    let scaled_eye = eye.with_rotation_scaling(params[3]);
    let mut candidate_camera = camera.clone();
    candidate_camera.translation =
        nalgebra::Vector3::new(params[0], params[1], params[2]);

    let Ok(scene) = SceneGeometry::assemble(scaled_eye, candidate_camera, constraint_tolerance)
    else {
        return residuals;
    };

    for (i, observed) in observations.iter().enumerate() {
        let Some(boundary) = observed.sample_boundary(OBSERVATION_BOUNDARY_POINTS) else {
            continue;
        };
        if let Ok(fit) = solve_eye_pose(&boundary, &scene, pose_options) {
            residuals[i] = fit.rmse.min(1e3);
        }
    }
    residuals
}

/// Infer the camera-eye geometry from a corpus of observed ellipses.
///
/// The search runs over `[tx, ty, tz, rotation_scaling]`, seeded from the
/// template camera's translation and unit scaling. The returned scene
/// carries the optimized translation and the rotation-scaled eye.
///
/// # Errors
///
/// * [`SceneError::InvalidObservations`] when the corpus is empty or
///   contains no finite ellipse.
/// * [`SceneError::EstimationFailed`] when no candidate scene could be
///   assembled and scored.
pub fn estimate_scene_geometry(
    observations: &[TransparentEllipse],
    eye: &EyeAnatomy,
    camera_template: &VideoCamera,
    constraint_tolerance: f64,
    options: &SceneSearchOptions,
) -> Result<SceneGeometry, SceneError> {
    let usable: Vec<TransparentEllipse> = observations
        .iter()
        .filter(|e| !e.is_nan())
        .copied()
        .collect();
    if usable.is_empty() {
        return Err(SceneError::InvalidObservations(
            "no finite ellipse observations".to_string(),
        ));
    }

    info!(
        "estimating scene geometry from {} of {} observations",
        usable.len(),
        observations.len()
    );

    let lower = DVector::from_vec(vec![
        options.translation_lower[0],
        options.translation_lower[1],
        options.translation_lower[2],
        options.rotation_scaling_bounds.0,
    ]);
    let upper = DVector::from_vec(vec![
        options.translation_upper[0],
        options.translation_upper[1],
        options.translation_upper[2],
        options.rotation_scaling_bounds.1,
    ]);
    let initial = DVector::from_vec(vec![
        camera_template.translation.x,
        camera_template.translation.y,
        camera_template.translation.z,
        1.0,
    ]);

    let residual_fn = |params: &DVector<f64>| {
        scene_residuals(
            params,
            &usable,
            eye,
            camera_template,
            constraint_tolerance,
            &options.pose,
        )
    };

    let result = minimize_bounded(&residual_fn, &initial, &lower, &upper, &options.search);
    if !result.rmse.is_finite() {
        return Err(SceneError::EstimationFailed(
            "no candidate scene could be scored".to_string(),
        ));
    }

    info!(
        "scene estimation finished: translation [{:.2}, {:.2}, {:.2}] mm, \
         rotation scaling {:.3}, residual {:.4} px",
        result.params[0], result.params[1], result.params[2], result.params[3], result.rmse
    );

    let mut camera = camera_template.clone();
    camera.translation = nalgebra::Vector3::new(
        result.params[0],
        result.params[1],
        result.params[2],
    );
    SceneGeometry::assemble(
        eye.with_rotation_scaling(result.params[3]),
        camera,
        constraint_tolerance,
    )
}
