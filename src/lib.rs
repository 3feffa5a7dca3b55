//! Pupil Tools Library
//!
//! A Rust library for model-based 3D eye-pose estimation from the 2D
//! outline of the pupil observed in video frames. The library provides:
//! - A schematic anatomical eye model derived from biometric inputs
//! - A two-surface corneal ray tracer for entrance-pupil refraction
//! - A pinhole video camera model with two-term radial distortion
//! - A forward projector from eye pose to the image-plane pupil ellipse
//! - A constrained transparent-ellipse fitter
//! - A bounded inverse search recovering eye pose from boundary points
//! - Scene-geometry calibration and a staged, parallel per-frame pipeline
//!
//! Ellipse refinement uses the tiny-solver optimization framework; the
//! pose and scene searches run on an in-crate bounded damped
//! least-squares loop because their objectives embed an inner ray-trace
//! search.

pub mod camera;
pub mod ellipse;
pub mod eye;
pub mod optimization;
pub mod pose;
pub mod projection;
pub mod pupil;
pub mod raytrace;
pub mod scene;

// Re-export commonly used types
pub use camera::{CameraError, Intrinsics, ProjectiveCamera, Resolution, VideoCamera};
pub use ellipse::{
    fit_ellipse_constrained, fit_ellipse_direct, EllipseFitError, TransparentEllipse,
};
pub use eye::{EyeAnatomy, EyeBiometrics, EyeModelError, Laterality};
pub use pose::{solve_eye_pose, PoseError, PoseFit, PoseSearchOptions};
pub use projection::{project_eye_pose, EyePose, EyeProjection, PointLabel, ProjectionOptions};
pub use pupil::{
    build_worker_pool, process_run, FitConfig, FitStage, FrameResult, PerimeterPointSet,
    PupilData,
};
pub use raytrace::{OpticalSurface, OpticalSystem, RayTraceError};
pub use scene::{estimate_scene_geometry, SceneError, SceneGeometry};
