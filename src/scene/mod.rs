//! Session-level scene geometry: the calibrated description of the eye,
//! the camera, and their spatial relationship.
//!
//! A [`SceneGeometry`] is created once per recording session, either
//! assembled from known parameters or estimated from a corpus of observed
//! pupil ellipses ([`estimate::estimate_scene_geometry`]), and is then
//! shared read-only by every per-frame fit. Persistence is YAML through
//! serde; a saved and re-loaded scene reproduces identical fields, which
//! the tests pin by serializing twice.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::camera::{CameraError, ProjectiveCamera, VideoCamera};
use crate::eye::{EyeAnatomy, EyeModelError};
use crate::raytrace::OpticalSystem;

pub mod estimate;

pub use estimate::{depth_from_iris_diameter, estimate_scene_geometry, SceneSearchOptions};

#[derive(thiserror::Error, Debug)]
pub enum SceneError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Eye(#[from] EyeModelError),
    #[error("Failed to parse YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("Scene estimation failed: {0}")]
    EstimationFailed(String),
    #[error("Invalid observations: {0}")]
    InvalidObservations(String),
}

impl From<std::io::Error> for SceneError {
    fn from(err: std::io::Error) -> Self {
        SceneError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for SceneError {
    fn from(err: serde_yaml::Error) -> Self {
        SceneError::YamlError(err.to_string())
    }
}

/// The calibrated, session-level eye/camera geometry.
///
/// Immutable after creation; per-frame fitting borrows it read-only, so a
/// single instance can be shared across worker threads without locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneGeometry {
    pub eye: EyeAnatomy,
    pub camera: VideoCamera,
    /// Tolerance for scene-derived shape constraints, pixels.
    pub constraint_tolerance: f64,
    /// The refracting surface stack derived from `eye`, kept alongside it
    /// so a persisted scene is self-contained.
    pub optical_system: OpticalSystem,
}

impl SceneGeometry {
    /// Assemble a scene from a validated eye model and camera.
    ///
    /// # Errors
    ///
    /// Fails fast, before any per-frame work can begin, if the camera
    /// parameters or the eye-model ordering invariant are invalid.
    pub fn assemble(
        eye: EyeAnatomy,
        camera: VideoCamera,
        constraint_tolerance: f64,
    ) -> Result<Self, SceneError> {
        camera.validate_params()?;
        eye.validate()?;
        let optical_system = OpticalSystem::from_anatomy(&eye);
        Ok(SceneGeometry {
            eye,
            camera,
            constraint_tolerance,
            optical_system,
        })
    }

    /// Serialize the scene to a YAML file.
    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), SceneError> {
        let yaml = serde_yaml::to_string(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml.as_bytes())?;
        Ok(())
    }

    /// Load a scene from a YAML file, re-validating the invariants that
    /// [`SceneGeometry::assemble`] enforces.
    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, SceneError> {
        let contents = fs::read_to_string(path)?;
        let scene: SceneGeometry = serde_yaml::from_str(&contents)?;
        scene.camera.validate_params()?;
        scene.eye.validate()?;
        Ok(scene)
    }
}
