//! Per-run pupil data: fit configuration, the staged result store, and
//! the frame driver.
//!
//! A run processes one video's worth of perimeter point sets into a
//! [`PupilData`] store: one table of [`FrameResult`] rows per named
//! [`FitStage`], one row per frame in frame order. Per-frame fitting is
//! embarrassingly parallel; the driver maps frames over an optional
//! caller-owned rayon pool (the core never manages pool lifecycle) and
//! merges results by frame index. Frames that cannot be fit land as NaN
//! sentinel rows and never abort the run; configuration problems are
//! caught up front, before any per-frame work, because they would
//! invalidate every frame.

use log::{info, warn};
use nalgebra::Vector2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use crate::ellipse::{fit_ellipse_constrained, split_half_sd, TransparentEllipse};
use crate::pose::{solve_eye_pose, PoseSearchOptions};
use crate::projection::{project_eye_pose, EyePose, ProjectionOptions};
use crate::scene::SceneGeometry;

/// Exponential decay of the causal/anticausal radius smoothing.
const SMOOTHING_DECAY: f64 = 0.35;

/// One frame's candidate pupil boundary, pixels. An empty set is the
/// valid "no pupil this frame" signal from the perimeter extraction
/// collaborator.
pub type PerimeterPointSet = Vec<Vector2<f64>>;

/// Named fitting passes. An explicit enum rather than dynamic field
/// names, so every stage a store can hold is known at compile time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FitStage {
    /// Ellipse-only fit of each frame, no scene geometry.
    InitialUnconstrained,
    /// Pose fit through the scene geometry.
    SceneConstrained,
    /// Scene-constrained fit with temporally smoothed pupil radius.
    TemporallySmoothed,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid fit configuration: {0}")]
    InvalidParams(String),
}

#[derive(thiserror::Error, Debug)]
pub enum PupilDataError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Stage {0:?} is not present in the store")]
    MissingStage(FitStage),
    #[error("Failed to parse YAML: {0}")]
    YamlError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for PupilDataError {
    fn from(err: std::io::Error) -> Self {
        PupilDataError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PupilDataError {
    fn from(err: serde_yaml::Error) -> Self {
        PupilDataError::YamlError(err.to_string())
    }
}

impl From<csv::Error> for PupilDataError {
    fn from(err: csv::Error) -> Self {
        PupilDataError::CsvError(err.to_string())
    }
}

/// Fit configuration for a run.
///
/// Deserialized with defaults for every missing field; unrecognized keys
/// in a configuration file are ignored, so configs written for newer
/// versions still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Box constraints on the 5 transparent ellipse parameters.
    pub ellipse_lower_bounds: [f64; 5],
    pub ellipse_upper_bounds: [f64; 5],
    /// Box constraints on the 4 eye-pose parameters (deg, deg, deg, mm).
    pub pose_lower_bounds: [f64; 4],
    pub pose_upper_bounds: [f64; 4],
    /// Number of split-half rotations for uncertainty estimates;
    /// 0 disables them.
    pub n_splits: usize,
    /// RMS residual (pixels) above which a frame is flagged as bad.
    pub bad_frame_threshold: f64,
    /// Process at most this many frames.
    pub frame_limit: Option<usize>,
    /// Worker threads for the frame fan-out.
    pub parallel_workers: usize,
    /// Points on the model pupil perimeter in forward projections.
    pub perimeter_points: usize,
    /// Re-seeded pose searches allowed per frame.
    pub retry_budget: usize,
    /// Iteration budget of each bounded search.
    pub iteration_budget: usize,
    /// Corneal refraction in the forward model; disabled only for
    /// diagnostics and synthetic-data validation.
    pub corneal_refraction: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            ellipse_lower_bounds: [0.0, 0.0, 0.0, 0.0, 0.0],
            ellipse_upper_bounds: [1e4, 1e4, 1e7, 0.75, PI],
            pose_lower_bounds: [-35.0, -25.0, 0.0, 0.25],
            pose_upper_bounds: [35.0, 25.0, 0.0, 5.0],
            n_splits: 4,
            bad_frame_threshold: 1.0,
            frame_limit: None,
            parallel_workers: 1,
            perimeter_points: 16,
            retry_budget: 3,
            iteration_budget: 50,
            corneal_refraction: true,
        }
    }
}

impl FitConfig {
    /// Validate the configuration. Called by every driver before any
    /// per-frame work; a bad configuration is fatal at setup time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for i in 0..5 {
            if !(self.ellipse_lower_bounds[i] <= self.ellipse_upper_bounds[i]) {
                return Err(ConfigError::InvalidParams(format!(
                    "ellipse bounds inverted at index {i}"
                )));
            }
        }
        for i in 0..4 {
            if !(self.pose_lower_bounds[i] <= self.pose_upper_bounds[i]) {
                return Err(ConfigError::InvalidParams(format!(
                    "pose bounds inverted at index {i}"
                )));
            }
        }
        if !(self.bad_frame_threshold > 0.0) || !self.bad_frame_threshold.is_finite() {
            return Err(ConfigError::InvalidParams(
                "bad_frame_threshold must be positive and finite".to_string(),
            ));
        }
        if self.perimeter_points < 5 {
            return Err(ConfigError::InvalidParams(
                "perimeter_points must be at least 5".to_string(),
            ));
        }
        if self.parallel_workers == 0 {
            return Err(ConfigError::InvalidParams(
                "parallel_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn projection_options(&self) -> ProjectionOptions {
        ProjectionOptions {
            full_model: false,
            pupil_perimeter_points: self.perimeter_points,
            refraction: self.corneal_refraction,
            ..ProjectionOptions::default()
        }
    }

    fn pose_search_options(&self) -> PoseSearchOptions {
        let mut options = PoseSearchOptions {
            lower_bounds: self.pose_lower_bounds,
            upper_bounds: self.pose_upper_bounds,
            repeat_search_threshold: self.bad_frame_threshold,
            retry_budget: self.retry_budget,
            n_splits: self.n_splits,
            projection: self.projection_options(),
            ..PoseSearchOptions::default()
        };
        options.search.max_iterations = self.iteration_budget;
        options
    }
}

/// One row of a per-run table. Frames that could not be fit carry the
/// NaN/infinity sentinels from [`FrameResult::empty`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameResult {
    pub ellipse: TransparentEllipse,
    pub pose: Option<EyePose>,
    /// RMS residual of the fit, pixels; infinite for sentinel rows.
    pub rmse: f64,
    /// Split-half SD of the ellipse parameters, when computed.
    pub ellipse_sd: Option<[f64; 5]>,
    /// Split-half SD of the pose parameters, when computed.
    pub pose_sd: Option<[f64; 4]>,
}

impl FrameResult {
    /// Sentinel row for an empty, blink, or degenerate frame.
    pub fn empty() -> Self {
        FrameResult {
            ellipse: TransparentEllipse::nan(),
            pose: None,
            rmse: f64::INFINITY,
            ellipse_sd: None,
            pose_sd: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ellipse.is_nan()
    }
}

/// Flat record for CSV export, one per frame.
#[derive(Serialize)]
struct CsvRow {
    frame: usize,
    center_x: f64,
    center_y: f64,
    area: f64,
    eccentricity: f64,
    theta: f64,
    azimuth_deg: Option<f64>,
    elevation_deg: Option<f64>,
    torsion_deg: Option<f64>,
    pupil_radius_mm: Option<f64>,
    rmse: f64,
}

/// Aggregate metrics for a completed run, JSON-exported for downstream
/// tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub frames: usize,
    pub stages: Vec<String>,
    /// Mean RMS residual over fittable frames, per stage; absent when a
    /// stage has no fittable frame.
    pub mean_rmse: BTreeMap<String, Option<f64>>,
    /// Frames whose residual exceeded the bad-frame threshold, per stage.
    pub flagged_frames: BTreeMap<String, usize>,
}

/// The per-run result store: a table of frame rows per fit stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PupilData {
    stages: BTreeMap<FitStage, Vec<FrameResult>>,
}

impl PupilData {
    pub fn new() -> Self {
        PupilData::default()
    }

    /// Install or overwrite a stage's table.
    pub fn set_stage(&mut self, stage: FitStage, rows: Vec<FrameResult>) {
        self.stages.insert(stage, rows);
    }

    pub fn stage(&self, stage: FitStage) -> Option<&[FrameResult]> {
        self.stages.get(&stage).map(|rows| rows.as_slice())
    }

    pub fn stages(&self) -> impl Iterator<Item = (&FitStage, &Vec<FrameResult>)> {
        self.stages.iter()
    }

    /// Persist the store as YAML, atomically: the document is written to
    /// a temporary sibling and renamed into place, so an aborted run
    /// never leaves a torn file.
    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), PupilDataError> {
        let yaml = serde_yaml::to_string(self)?;
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, yaml)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, PupilDataError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Export one stage's table as CSV for downstream analysis.
    pub fn export_csv<P: AsRef<Path>>(
        &self,
        stage: FitStage,
        path: P,
    ) -> Result<(), PupilDataError> {
        let rows = self
            .stages
            .get(&stage)
            .ok_or(PupilDataError::MissingStage(stage))?;
        let mut writer = csv::Writer::from_path(path)?;
        for (frame, row) in rows.iter().enumerate() {
            let pose = row.pose.map(|p| p.as_array());
            writer.serialize(CsvRow {
                frame,
                center_x: row.ellipse.center_x,
                center_y: row.ellipse.center_y,
                area: row.ellipse.area,
                eccentricity: row.ellipse.eccentricity,
                theta: row.ellipse.theta,
                azimuth_deg: pose.map(|p| p[0]),
                elevation_deg: pose.map(|p| p[1]),
                torsion_deg: pose.map(|p| p[2]),
                pupil_radius_mm: pose.map(|p| p[3]),
                rmse: row.rmse,
            })?;
        }
        writer.flush().map_err(|e| PupilDataError::IOError(e.to_string()))?;
        Ok(())
    }

    /// Aggregate metrics across all stages.
    pub fn summary(&self, bad_frame_threshold: f64) -> RunSummary {
        let frames = self
            .stages
            .values()
            .map(|rows| rows.len())
            .max()
            .unwrap_or(0);
        let mut mean_rmse = BTreeMap::new();
        let mut flagged_frames = BTreeMap::new();
        let mut stage_names = Vec::new();

        for (stage, rows) in &self.stages {
            let name = format!("{stage:?}");
            stage_names.push(name.clone());
            let finite: Vec<f64> = rows
                .iter()
                .map(|r| r.rmse)
                .filter(|r| r.is_finite())
                .collect();
            let mean = if finite.is_empty() {
                None
            } else {
                Some(finite.iter().sum::<f64>() / finite.len() as f64)
            };
            mean_rmse.insert(name.clone(), mean);
            flagged_frames.insert(
                name,
                rows.iter()
                    .filter(|r| !(r.rmse <= bad_frame_threshold))
                    .count(),
            );
        }

        RunSummary {
            frames,
            stages: stage_names,
            mean_rmse,
            flagged_frames,
        }
    }

    /// Write the run summary as JSON next to the main store.
    pub fn export_summary_json<P: AsRef<Path>>(
        &self,
        bad_frame_threshold: f64,
        path: P,
    ) -> Result<(), PupilDataError> {
        let summary = self.summary(bad_frame_threshold);
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| PupilDataError::IOError(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Build a worker pool of the configured size. The pool is owned by the
/// caller and passed by reference into the drivers; the core never
/// manages pool lifecycle.
pub fn build_worker_pool(workers: usize) -> Result<rayon::ThreadPool, ConfigError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| ConfigError::InvalidParams(format!("worker pool: {e}")))
}

/// Map a fallible-per-frame fit over all frames, in order, optionally on
/// a worker pool. Results come back merged by frame index regardless of
/// completion order.
fn map_frames<F>(
    frames: &[PerimeterPointSet],
    pool: Option<&rayon::ThreadPool>,
    fit_frame: F,
) -> Vec<FrameResult>
where
    F: Fn(&PerimeterPointSet) -> FrameResult + Sync,
{
    match pool {
        Some(pool) => pool.install(|| frames.par_iter().map(&fit_frame).collect()),
        None => frames.iter().map(&fit_frame).collect(),
    }
}

fn limited<'a>(perimeters: &'a [PerimeterPointSet], config: &FitConfig) -> &'a [PerimeterPointSet] {
    match config.frame_limit {
        Some(limit) => &perimeters[..limit.min(perimeters.len())],
        None => perimeters,
    }
}

/// Initial-unconstrained pass: a bounded ellipse fit of each frame's
/// perimeter, with split-half SDs. No scene geometry involved.
pub fn fit_frames_unconstrained(
    perimeters: &[PerimeterPointSet],
    config: &FitConfig,
    pool: Option<&rayon::ThreadPool>,
) -> Result<Vec<FrameResult>, ConfigError> {
    config.validate()?;
    let frames = limited(perimeters, config);
    info!("unconstrained ellipse pass over {} frames", frames.len());

    let results = map_frames(frames, pool, |points| {
        match fit_ellipse_constrained(
            points,
            &config.ellipse_lower_bounds,
            &config.ellipse_upper_bounds,
            None,
        ) {
            Ok((ellipse, rmse)) => FrameResult {
                ellipse,
                pose: None,
                rmse,
                ellipse_sd: split_half_sd(
                    points,
                    &config.ellipse_lower_bounds,
                    &config.ellipse_upper_bounds,
                    config.n_splits,
                ),
                pose_sd: None,
            },
            Err(_) => FrameResult::empty(),
        }
    });
    Ok(results)
}

/// Scene-constrained pass: a pose fit of each frame through the scene
/// geometry. The row's ellipse is the forward projection of the fitted
/// pose, so it satisfies the scene-implied shape constraints by
/// construction.
pub fn fit_frames_with_scene(
    perimeters: &[PerimeterPointSet],
    scene: &SceneGeometry,
    config: &FitConfig,
    pool: Option<&rayon::ThreadPool>,
) -> Result<Vec<FrameResult>, ConfigError> {
    config.validate()?;
    let frames = limited(perimeters, config);
    let pose_options = config.pose_search_options();
    let projection_options = config.projection_options();
    info!("scene-constrained pose pass over {} frames", frames.len());

    let results = map_frames(frames, pool, |points| {
        match solve_eye_pose(points, scene, &pose_options) {
            Ok(fit) => {
                let ellipse = project_eye_pose(&fit.pose, scene, &projection_options).ellipse;
                FrameResult {
                    ellipse,
                    pose: Some(fit.pose),
                    rmse: fit.rmse,
                    ellipse_sd: None,
                    pose_sd: fit.split_sd,
                }
            }
            Err(_) => FrameResult::empty(),
        }
    });

    let flagged = results
        .iter()
        .filter(|r| !(r.rmse <= config.bad_frame_threshold))
        .count();
    if flagged > 0 {
        warn!(
            "{flagged} of {} frames exceeded the bad-frame threshold",
            results.len()
        );
    }
    Ok(results)
}

/// Temporal smoothing pass over the scene-constrained radius estimates.
///
/// The radius series is smoothed with a causal plus anticausal
/// exponentially weighted average, each sample weighted by the inverse
/// split-half radius variance when available; the smoothed radius is then
/// pushed back through the forward projector so each row's ellipse stays
/// consistent with its pose.
pub fn smooth_stage(
    scene: &SceneGeometry,
    scene_constrained: &[FrameResult],
    config: &FitConfig,
) -> Result<Vec<FrameResult>, ConfigError> {
    config.validate()?;
    let n = scene_constrained.len();
    let projection_options = config.projection_options();

    let radii: Vec<Option<f64>> = scene_constrained
        .iter()
        .map(|row| row.pose.map(|p| p.pupil_radius_mm).filter(|r| r.is_finite()))
        .collect();
    let weights: Vec<f64> = scene_constrained
        .iter()
        .map(|row| match row.pose_sd {
            Some(sd) if sd[3].is_finite() => 1.0 / sd[3].powi(2).max(1e-6),
            _ => 1.0,
        })
        .collect();

    // Causal and anticausal accumulators; the shared center sample is
    // counted once.
    let mut forward_num = vec![0.0; n];
    let mut forward_den = vec![0.0; n];
    let mut acc_num = 0.0;
    let mut acc_den = 0.0;
    for i in 0..n {
        if let Some(r) = radii[i] {
            acc_num += weights[i] * r;
            acc_den += weights[i];
        }
        forward_num[i] = acc_num;
        forward_den[i] = acc_den;
        acc_num *= SMOOTHING_DECAY;
        acc_den *= SMOOTHING_DECAY;
    }
    let mut backward_num = vec![0.0; n];
    let mut backward_den = vec![0.0; n];
    acc_num = 0.0;
    acc_den = 0.0;
    for i in (0..n).rev() {
        backward_num[i] = acc_num;
        backward_den[i] = acc_den;
        if let Some(r) = radii[i] {
            acc_num += weights[i] * r;
            acc_den += weights[i];
        }
        acc_num *= SMOOTHING_DECAY;
        acc_den *= SMOOTHING_DECAY;
    }

    let mut results = Vec::with_capacity(n);
    for (i, row) in scene_constrained.iter().enumerate() {
        let Some(pose) = row.pose else {
            results.push(FrameResult::empty());
            continue;
        };
        let den = forward_den[i] + backward_den[i];
        let smoothed_radius = if den > 0.0 {
            (forward_num[i] + backward_num[i]) / den
        } else {
            pose.pupil_radius_mm
        };

        let smoothed_pose = EyePose {
            pupil_radius_mm: smoothed_radius,
            ..pose
        };
        let ellipse = project_eye_pose(&smoothed_pose, scene, &projection_options).ellipse;
        results.push(FrameResult {
            ellipse,
            pose: Some(smoothed_pose),
            rmse: row.rmse,
            ellipse_sd: None,
            pose_sd: row.pose_sd,
        });
    }
    Ok(results)
}

/// Run the staged pipeline over a set of frames.
///
/// The initial-unconstrained pass always runs; the scene-constrained and
/// temporally-smoothed passes run when a scene geometry is provided. When
/// `output` is given, the store is persisted after each completed pass.
pub fn process_run(
    perimeters: &[PerimeterPointSet],
    scene: Option<&SceneGeometry>,
    config: &FitConfig,
    pool: Option<&rayon::ThreadPool>,
    output: Option<&Path>,
) -> Result<PupilData, PupilDataError> {
    config.validate()?;
    let mut data = PupilData::new();

    let initial = fit_frames_unconstrained(perimeters, config, pool)?;
    data.set_stage(FitStage::InitialUnconstrained, initial);
    if let Some(path) = output {
        data.save_to_yaml(path)?;
    }

    if let Some(scene) = scene {
        let constrained = fit_frames_with_scene(perimeters, scene, config, pool)?;
        data.set_stage(FitStage::SceneConstrained, constrained);
        if let Some(path) = output {
            data.save_to_yaml(path)?;
        }

        let constrained_rows = data
            .stage(FitStage::SceneConstrained)
            .expect("stage was just installed")
            .to_vec();
        let smoothed = smooth_stage(scene, &constrained_rows, config)?;
        data.set_stage(FitStage::TemporallySmoothed, smoothed);
        if let Some(path) = output {
            data.save_to_yaml(path)?;
        }
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Intrinsics, Resolution, VideoCamera};
    use crate::eye::{EyeAnatomy, EyeBiometrics};
    use crate::projection::PointLabel;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn sample_scene() -> SceneGeometry {
        let eye = EyeAnatomy::build(&EyeBiometrics::default()).unwrap();
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
            Vector3::new(0.0, 0.0, 100.0),
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap();
        SceneGeometry::assemble(eye, camera, 1.0).unwrap()
    }

    fn fast_config() -> FitConfig {
        FitConfig {
            n_splits: 0,
            retry_budget: 0,
            corneal_refraction: false,
            ..FitConfig::default()
        }
    }

    fn synthetic_perimeter(pose: &EyePose, scene: &SceneGeometry, config: &FitConfig) -> PerimeterPointSet {
        let projection = project_eye_pose(pose, scene, &config.projection_options());
        projection
            .labels
            .iter()
            .zip(projection.image_points.column_iter())
            .filter(|(label, _)| **label == PointLabel::PupilPerimeter)
            .map(|(_, col)| Vector2::new(col[0], col[1]))
            .collect()
    }

    #[test]
    fn test_config_defaults_validate() {
        FitConfig::default().validate().unwrap();
    }

    #[test]
    fn test_config_rejects_inverted_bounds() {
        let mut config = FitConfig::default();
        config.pose_lower_bounds[0] = 10.0;
        config.pose_upper_bounds[0] = -10.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_ignores_unknown_keys() {
        let yaml = "n_splits: 2\nbad_frame_threshold: 0.5\nsome_future_option: 42\n";
        let config: FitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.n_splits, 2);
        assert_relative_eq!(config.bad_frame_threshold, 0.5);
        // Missing fields take their defaults.
        assert_eq!(config.perimeter_points, 16);
    }

    #[test]
    fn test_unconstrained_pass_handles_empty_and_short_frames() {
        let scene = sample_scene();
        let config = fast_config();
        let good = synthetic_perimeter(&EyePose::new(5.0, -3.0, 0.0, 2.0), &scene, &config);
        let frames = vec![good, Vec::new(), vec![Vector2::new(1.0, 2.0)]];

        let results = fit_frames_unconstrained(&frames, &config, None).unwrap();
        assert_eq!(results.len(), 3);
        assert!(!results[0].is_empty());
        assert!(results[0].rmse < 0.1);
        assert!(results[1].is_empty());
        assert!(results[1].rmse.is_infinite());
        assert!(results[2].is_empty());
    }

    #[test]
    fn test_parallel_and_sequential_results_agree() {
        let scene = sample_scene();
        let config = fast_config();
        let frames: Vec<PerimeterPointSet> = [
            EyePose::new(0.0, 0.0, 0.0, 2.0),
            EyePose::new(8.0, 2.0, 0.0, 2.5),
            EyePose::new(-6.0, -4.0, 0.0, 1.5),
        ]
        .iter()
        .map(|pose| synthetic_perimeter(pose, &scene, &config))
        .collect();

        let sequential = fit_frames_unconstrained(&frames, &config, None).unwrap();
        let pool = build_worker_pool(2).unwrap();
        let parallel = fit_frames_unconstrained(&frames, &config, Some(&pool)).unwrap();

        for (s, p) in sequential.iter().zip(parallel.iter()) {
            assert_eq!(s.ellipse.as_array(), p.ellipse.as_array());
        }
    }

    #[test]
    fn test_scene_constrained_pass_recovers_poses() {
        let scene = sample_scene();
        let config = fast_config();
        let truth = EyePose::new(6.0, -4.0, 0.0, 2.2);
        let frames = vec![
            synthetic_perimeter(&truth, &scene, &config),
            Vec::new(),
        ];

        let results = fit_frames_with_scene(&frames, &scene, &config, None).unwrap();
        let pose = results[0].pose.expect("frame should fit");
        assert_relative_eq!(pose.azimuth_deg, 6.0, epsilon = 0.05);
        assert_relative_eq!(pose.pupil_radius_mm, 2.2, epsilon = 0.01);
        assert!(!results[0].ellipse.is_nan());
        assert!(results[1].is_empty());
        assert!(results[1].pose.is_none());
    }

    #[test]
    fn test_frame_limit_truncates_the_run() {
        let scene = sample_scene();
        let mut config = fast_config();
        config.frame_limit = Some(1);
        let frame = synthetic_perimeter(&EyePose::new(0.0, 0.0, 0.0, 2.0), &scene, &config);
        let frames = vec![frame.clone(), frame];

        let results = fit_frames_unconstrained(&frames, &config, None).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_smoothing_preserves_constant_radius() {
        let scene = sample_scene();
        let config = fast_config();
        let frames: Vec<PerimeterPointSet> = (0..4)
            .map(|i| {
                synthetic_perimeter(
                    &EyePose::new(i as f64 * 2.0, 0.0, 0.0, 2.0),
                    &scene,
                    &config,
                )
            })
            .collect();
        let constrained = fit_frames_with_scene(&frames, &scene, &config, None).unwrap();
        let smoothed = smooth_stage(&scene, &constrained, &config).unwrap();

        for row in &smoothed {
            let pose = row.pose.expect("all frames fittable");
            assert_relative_eq!(pose.pupil_radius_mm, 2.0, epsilon = 0.02);
        }
    }

    #[test]
    fn test_smoothing_pulls_outlier_toward_neighbors() {
        let scene = sample_scene();
        let config = fast_config();
        // Hand-built scene-constrained rows: constant radius except one
        // outlier in the middle.
        let radii = [2.0, 2.0, 3.2, 2.0, 2.0];
        let rows: Vec<FrameResult> = radii
            .iter()
            .map(|&r| FrameResult {
                ellipse: TransparentEllipse::nan(),
                pose: Some(EyePose::new(0.0, 0.0, 0.0, r)),
                rmse: 0.1,
                ellipse_sd: None,
                pose_sd: None,
            })
            .collect();

        let smoothed = smooth_stage(&scene, &rows, &config).unwrap();
        let outlier = smoothed[2].pose.unwrap().pupil_radius_mm;
        assert!(outlier < 3.0, "outlier not attenuated: {outlier}");
        assert!(outlier > 2.0);
    }

    #[test]
    fn test_pipeline_persistence_round_trip() {
        let scene = sample_scene();
        let config = fast_config();
        let frames = vec![
            synthetic_perimeter(&EyePose::new(4.0, 1.0, 0.0, 2.0), &scene, &config),
            Vec::new(),
        ];

        let dir = std::env::temp_dir().join("pupil_tools_pupil_data");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.yaml");

        let data = process_run(&frames, Some(&scene), &config, None, Some(path.as_path())).unwrap();
        assert!(data.stage(FitStage::InitialUnconstrained).is_some());
        assert!(data.stage(FitStage::SceneConstrained).is_some());
        assert!(data.stage(FitStage::TemporallySmoothed).is_some());

        let loaded = PupilData::load_from_yaml(&path).unwrap();
        let original_rows = data.stage(FitStage::SceneConstrained).unwrap();
        let loaded_rows = loaded.stage(FitStage::SceneConstrained).unwrap();
        assert_eq!(original_rows.len(), loaded_rows.len());
        // Sentinel rows survive the round trip.
        assert!(loaded_rows[1].is_empty());
        assert!(loaded_rows[1].rmse.is_infinite());
        assert_relative_eq!(
            original_rows[0].ellipse.center_x,
            loaded_rows[0].ellipse.center_x,
        );

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_csv_export_writes_one_row_per_frame() {
        let scene = sample_scene();
        let config = fast_config();
        let frames = vec![
            synthetic_perimeter(&EyePose::new(0.0, 0.0, 0.0, 2.0), &scene, &config),
            Vec::new(),
        ];
        let results = fit_frames_with_scene(&frames, &scene, &config, None).unwrap();
        let mut data = PupilData::new();
        data.set_stage(FitStage::SceneConstrained, results);

        let dir = std::env::temp_dir().join("pupil_tools_csv_export");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("scene_constrained.csv");
        data.export_csv(FitStage::SceneConstrained, &path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3, "header plus two frames");
        assert!(lines[0].contains("azimuth_deg"));

        assert!(matches!(
            data.export_csv(FitStage::InitialUnconstrained, &path),
            Err(PupilDataError::MissingStage(FitStage::InitialUnconstrained))
        ));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_summary_counts_flagged_frames() {
        let mut data = PupilData::new();
        data.set_stage(
            FitStage::InitialUnconstrained,
            vec![
                FrameResult {
                    rmse: 0.2,
                    ..FrameResult::empty()
                },
                FrameResult::empty(),
            ],
        );
        let summary = data.summary(1.0);
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.flagged_frames["InitialUnconstrained"], 1);
        assert_relative_eq!(
            summary.mean_rmse["InitialUnconstrained"].unwrap(),
            0.2,
        );
    }
}
