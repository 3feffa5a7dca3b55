//! Corneal refraction by meridional ray tracing.
//!
//! A camera does not see the physical pupil: it sees the entrance pupil,
//! the virtual image of the pupil formed by refraction through the two
//! corneal surfaces. Because the corneal principal radii differ between
//! the horizontal and vertical meridians, an axially symmetric trace is
//! not sufficient; the trace is instead carried out independently in the
//! two orthogonal planes that contain the optical axis.
//!
//! In each plane the problem is one-dimensional: find the departure angle
//! theta at which a ray leaving the eye point, refracted in sequence by
//! every surface of the plane's optical system, passes as close as
//! possible to the camera's nodal point. The search is seeded at theta = 0
//! (the straight, unrefracted line to the nodal point) and refined by a
//! bounded golden-section search. The error surface is assumed unimodal
//! near that seed; this is an empirical design choice inherited from the
//! modeling literature and pinned by tests, not a proven property.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::eye::EyeAnatomy;
use crate::optimization::scalar::{golden_section_min, ScalarSearchOptions};

/// One refracting surface in a meridional plane: a circle centered on the
/// optical axis, convex toward the camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpticalSurface {
    /// Radius of curvature, mm.
    pub radius: f64,
    /// Axial position of the circle center, mm (apex sits at
    /// `center_z + radius`).
    pub center_z: f64,
    /// Refractive index of the medium on the camera side of the surface.
    pub index_after: f64,
}

/// The assembled refracting stack for both principal meridians, ordered
/// from the eye's interior outward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpticalSystem {
    pub horizontal: Vec<OpticalSurface>,
    pub vertical: Vec<OpticalSurface>,
    /// Index of the medium in which traces start (the aqueous humor).
    pub starting_index: f64,
}

impl OpticalSystem {
    /// Assemble the two-surface corneal system from the eye anatomy:
    /// aqueous to cornea at the posterior surface, cornea to air at the
    /// anterior surface.
    pub fn from_anatomy(eye: &EyeAnatomy) -> Self {
        let plane_surfaces = |meridian: usize| {
            vec![
                OpticalSurface {
                    radius: eye.cornea_back.radii[meridian],
                    center_z: eye.cornea_back.apex_z - eye.cornea_back.radii[meridian],
                    index_after: eye.indices.cornea,
                },
                OpticalSurface {
                    radius: eye.cornea_front.radii[meridian],
                    center_z: eye.cornea_front.apex_z - eye.cornea_front.radii[meridian],
                    index_after: 1.0,
                },
            ]
        };
        OpticalSystem {
            horizontal: plane_surfaces(0),
            vertical: plane_surfaces(1),
            starting_index: eye.indices.aqueous,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RayTraceError {
    /// Incidence beyond the critical angle; the trace has no solution.
    /// Signaled distinctly from an ordinary miss so callers can suppress
    /// the affected point rather than the whole frame.
    #[error("Ray incidence exceeded the critical angle (total internal reflection)")]
    TotalInternalReflection,
    #[error("Ray missed a refracting surface")]
    MissedSurface,
    #[error("Exit ray does not propagate toward the camera")]
    DegenerateRay,
}

/// Options for the per-plane departure-angle search.
#[derive(Debug, Clone)]
pub struct TraceOptions {
    /// Half-width of the theta bracket around the straight-line seed, rad.
    pub bracket_half_width: f64,
    pub search: ScalarSearchOptions,
}

impl Default for TraceOptions {
    fn default() -> Self {
        TraceOptions {
            bracket_half_width: 0.5,
            search: ScalarSearchOptions::default(),
        }
    }
}

/// A ray in a meridional plane. Components are (z, h): axial position and
/// height in the plane.
#[derive(Debug, Clone, Copy)]
struct PlanarRay {
    origin: Vector2<f64>,
    direction: Vector2<f64>,
}

/// Propagate a planar ray through the ordered surface stack, applying
/// Snell's law at each intersection.
fn trace_through(
    surfaces: &[OpticalSurface],
    starting_index: f64,
    mut ray: PlanarRay,
) -> Result<PlanarRay, RayTraceError> {
    let mut index = starting_index;
    for surface in surfaces {
        let center = Vector2::new(surface.center_z, 0.0);
        let oc = ray.origin - center;
        let b = oc.dot(&ray.direction);
        let c = oc.norm_squared() - surface.radius * surface.radius;
        let discriminant = b * b - c;
        if discriminant < 0.0 {
            return Err(RayTraceError::MissedSurface);
        }
        let sqrt_disc = discriminant.sqrt();

        // The refracting cap is the camera-side hemisphere; take the first
        // intersection ahead of the ray that lies on it.
        let mut hit = None;
        for t in [-b - sqrt_disc, -b + sqrt_disc] {
            if t > 1e-9 {
                let p = ray.origin + ray.direction * t;
                if p.x > surface.center_z {
                    hit = Some(p);
                    break;
                }
            }
        }
        let hit = hit.ok_or(RayTraceError::MissedSurface)?;

        let mut normal = (hit - center) / surface.radius;
        let mut cos_incident = -ray.direction.dot(&normal);
        if cos_incident < 0.0 {
            normal = -normal;
            cos_incident = -cos_incident;
        }

        let eta = index / surface.index_after;
        let sin2_transmitted = eta * eta * (1.0 - cos_incident * cos_incident);
        if sin2_transmitted > 1.0 {
            return Err(RayTraceError::TotalInternalReflection);
        }
        let cos_transmitted = (1.0 - sin2_transmitted).sqrt();

        let refracted = ray.direction * eta + normal * (eta * cos_incident - cos_transmitted);
        ray = PlanarRay {
            origin: hit,
            direction: refracted.normalize(),
        };
        index = surface.index_after;
    }
    Ok(ray)
}

/// Perpendicular miss distance of a ray from a target point.
fn miss_distance(ray: &PlanarRay, target: Vector2<f64>) -> f64 {
    let to_target = target - ray.origin;
    (ray.direction.x * to_target.y - ray.direction.y * to_target.x).abs()
}

/// Solve one meridional plane: returns the virtual height of `point` (at
/// its own axial position) as seen through the surfaces by a nodal point
/// at `nodal`.
fn trace_plane(
    surfaces: &[OpticalSurface],
    starting_index: f64,
    point: Vector2<f64>,
    nodal: Vector2<f64>,
    options: &TraceOptions,
) -> Result<f64, RayTraceError> {
    if surfaces.is_empty() {
        return Ok(point.y);
    }

    let base = nodal - point;
    if base.x <= 0.0 {
        return Err(RayTraceError::DegenerateRay);
    }
    let base_angle = base.y.atan2(base.x);

    let departure_ray = |theta: f64| PlanarRay {
        origin: point,
        direction: Vector2::new((base_angle + theta).cos(), (base_angle + theta).sin()),
    };

    // NaN marks invalid departure angles; the scalar search treats them
    // as infinitely bad, keeping the bracket on tractable rays.
    let objective = |theta: f64| match trace_through(surfaces, starting_index, departure_ray(theta))
    {
        Ok(exit) => miss_distance(&exit, nodal),
        Err(_) => f64::NAN,
    };

    let (theta_star, _) = golden_section_min(
        objective,
        -options.bracket_half_width,
        options.bracket_half_width,
        &options.search,
    );

    // Re-trace at the solution; trace failures here (e.g. total internal
    // reflection across the whole bracket) propagate to the caller.
    let exit = trace_through(surfaces, starting_index, departure_ray(theta_star))?;
    if exit.direction.x.abs() < 1e-12 {
        return Err(RayTraceError::DegenerateRay);
    }

    // The virtual image lies on the backward extension of the exit ray,
    // evaluated at the axial position of the physical point.
    let slope = exit.direction.y / exit.direction.x;
    Ok(exit.origin.y + (point.x - exit.origin.x) * slope)
}

/// Compute the virtual image of an eye-frame point as seen by a camera
/// nodal point, via independent searches in the two principal meridians.
///
/// `nodal` must already be expressed in the eye frame (counter-rotated
/// for the current eye pose by the caller). The returned point preserves
/// the axial coordinate of the input.
pub fn virtual_image_point(
    point: &Vector3<f64>,
    nodal: &Vector3<f64>,
    system: &OpticalSystem,
    options: &TraceOptions,
) -> Result<Vector3<f64>, RayTraceError> {
    let virtual_x = trace_plane(
        &system.horizontal,
        system.starting_index,
        Vector2::new(point.z, point.x),
        Vector2::new(nodal.z, nodal.x),
        options,
    )?;
    let virtual_y = trace_plane(
        &system.vertical,
        system.starting_index,
        Vector2::new(point.z, point.y),
        Vector2::new(nodal.z, nodal.y),
        options,
    )?;
    Ok(Vector3::new(virtual_x, virtual_y, point.z))
}
