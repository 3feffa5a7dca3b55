//! Ellipse fitting: direct least-squares initialization and bounded
//! non-linear refinement.
//!
//! The direct stage is the Fitzgibbon et al. (1999) method: a normalized
//! design matrix, a 3x3 reduced scatter system, and the generalized
//! eigenvalue problem enforcing the ellipse constraint, solved explicitly
//! through the characteristic cubic. The refinement stage works on the
//! transparent parameters themselves with `tiny_solver`'s
//! Levenberg-Marquardt optimizer under box constraints, so callers can
//! bound center, area, eccentricity and theta, and pin any subset of the
//! five parameters from external knowledge.

use log::warn;
use nalgebra::{DMatrix, DVector, Matrix3, RealField, Vector2, Vector3};
use std::collections::HashMap;
use std::f64::consts::PI;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use super::{GeometricEllipse, TransparentEllipse};

#[derive(thiserror::Error, Debug)]
pub enum EllipseFitError {
    #[error("At least 5 boundary points are required, got {0}")]
    InsufficientPoints(usize),
    #[error("Boundary points are degenerate and do not determine an ellipse")]
    DegenerateFit,
}

/// Distance from a point to the boundary of a transparent ellipse,
/// generic over the scalar type so the same expression serves both plain
/// evaluation and `tiny_solver` automatic differentiation.
///
/// Invalid parameter combinations (non-positive area, eccentricity at or
/// beyond 1) return a large finite penalty instead of NaN so bounded
/// searches can back away from them.
fn point_ellipse_distance_generic<T: RealField>(params: &[T], x: T, y: T) -> T {
    let penalty = T::from_f64(1e6).unwrap();
    let pi = T::from_f64(PI).unwrap();

    let center_x = params[0].clone();
    let center_y = params[1].clone();
    let area = params[2].clone();
    let eccentricity = params[3].clone();
    let theta = params[4].clone();

    if area <= T::zero() || eccentricity < T::zero() || eccentricity >= T::one() {
        return penalty;
    }

    let ratio = (T::one() - eccentricity.clone() * eccentricity).sqrt();
    let semi_major = (area / (pi * ratio.clone())).sqrt();
    let semi_minor = semi_major.clone() * ratio;

    let dx = x - center_x;
    let dy = y - center_y;
    let (sin_t, cos_t) = theta.sin_cos();
    let xe = cos_t.clone() * dx.clone() + sin_t.clone() * dy.clone();
    let ye = cos_t * dy - sin_t * dx;

    // Nearest-boundary parameter angle, exact for circles.
    let phi = (ye.clone() * semi_major.clone()).atan2(xe.clone() * semi_minor.clone());
    let (sin_p, cos_p) = phi.sin_cos();
    let rx = xe - semi_major * cos_p;
    let ry = ye - semi_minor * sin_p;

    // Small floor inside the root keeps the derivative finite on the boundary.
    (rx.clone() * rx + ry.clone() * ry + T::from_f64(1e-18).unwrap()).sqrt()
}

pub(crate) fn point_ellipse_distance_scalar(params: &[f64; 5], x: f64, y: f64) -> f64 {
    point_ellipse_distance_generic::<f64>(params, x, y)
}

fn rms_distance(params: &[f64; 5], points: &[Vector2<f64>]) -> f64 {
    if points.is_empty() {
        return f64::INFINITY;
    }
    let sum: f64 = points
        .iter()
        .map(|p| {
            let d = point_ellipse_distance_scalar(params, p.x, p.y);
            d * d
        })
        .sum();
    (sum / points.len() as f64).sqrt()
}

/// Cost function for `tiny_solver` refinement of a transparent ellipse.
///
/// Holds the observed boundary points, the full 5-parameter template, and
/// the indices of the parameters left free; fixed parameters keep their
/// template values during optimization.
#[derive(Debug, Clone)]
struct EllipseDistanceCost {
    points: Vec<Vector2<f64>>,
    template: [f64; 5],
    free: Vec<usize>,
}

impl<T: RealField> Factor<T> for EllipseDistanceCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let free_params = &params[0];
        let mut full: Vec<T> = self
            .template
            .iter()
            .map(|&v| T::from_f64(v).unwrap())
            .collect();
        for (k, &i) in self.free.iter().enumerate() {
            full[i] = free_params[k].clone();
        }

        let mut residuals = DVector::zeros(self.points.len());
        for (i, p) in self.points.iter().enumerate() {
            residuals[i] = point_ellipse_distance_generic(
                &full,
                T::from_f64(p.x).unwrap(),
                T::from_f64(p.y).unwrap(),
            );
        }
        residuals
    }
}

/// Fit an ellipse with the direct least-squares method and convert to
/// transparent form.
///
/// Returns the fitted ellipse and the RMS boundary distance of the input
/// points. Requires at least 5 points; collinear or otherwise
/// non-elliptical configurations are [`EllipseFitError::DegenerateFit`].
pub fn fit_ellipse_direct(
    points: &[Vector2<f64>],
) -> Result<(TransparentEllipse, f64), EllipseFitError> {
    let n = points.len();
    if n < 5 {
        return Err(EllipseFitError::InsufficientPoints(n));
    }

    // Normalize for conditioning: centroid at the origin, mean radius sqrt(2).
    let inv_n = 1.0 / n as f64;
    let mean_x: f64 = points.iter().map(|p| p.x).sum::<f64>() * inv_n;
    let mean_y: f64 = points.iter().map(|p| p.y).sum::<f64>() * inv_n;
    let mean_dist: f64 = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        * inv_n;
    if mean_dist < 1e-12 {
        return Err(EllipseFitError::DegenerateFit);
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;

    // Design matrix columns [x^2, xy, y^2, x, y, 1] in normalized coords.
    let mut design = DMatrix::<f64>::zeros(n, 6);
    for (i, p) in points.iter().enumerate() {
        let x = (p.x - mean_x) * scale;
        let y = (p.y - mean_y) * scale;
        design[(i, 0)] = x * x;
        design[(i, 1)] = x * y;
        design[(i, 2)] = y * y;
        design[(i, 3)] = x;
        design[(i, 4)] = y;
        design[(i, 5)] = 1.0;
    }

    let scatter = design.transpose() * &design;
    let s11 = scatter.fixed_view::<3, 3>(0, 0).into_owned();
    let s12 = scatter.fixed_view::<3, 3>(0, 3).into_owned();
    let s22 = scatter.fixed_view::<3, 3>(3, 3).into_owned();

    let s22_inv = s22.try_inverse().ok_or(EllipseFitError::DegenerateFit)?;
    let reduced = s11 - s12 * s22_inv * s12.transpose();

    // Ellipse constraint matrix C1 and its fixed inverse.
    let c1_inv = Matrix3::new(0.0, 0.0, 0.5, 0.0, -1.0, 0.0, 0.5, 0.0, 0.0);
    let system = c1_inv * reduced;

    let quadratic = solve_constrained_eigenvector(&system).ok_or(EllipseFitError::DegenerateFit)?;
    let linear = -s22_inv * s12.transpose() * quadratic;

    let conic_normalized = [
        quadratic[0],
        quadratic[1],
        quadratic[2],
        linear[0],
        linear[1],
        linear[2],
    ];
    let conic = denormalize_conic(&conic_normalized, mean_x, mean_y, scale);

    let geometric = conic_to_geometric(&conic).ok_or(EllipseFitError::DegenerateFit)?;
    let transparent = TransparentEllipse::from_geometric(&geometric);
    if transparent.is_nan() {
        return Err(EllipseFitError::DegenerateFit);
    }

    let rmse = rms_distance(&transparent.as_array(), points);
    Ok((transparent, rmse))
}

/// Fit a transparent ellipse under box constraints, optionally pinning a
/// subset of the parameters.
///
/// The initial guess is the direct fit of [`fit_ellipse_direct`], clipped
/// into the box and overridden by `fixed`; the free parameters are then
/// refined by bounded Levenberg-Marquardt on the boundary-distance
/// residuals. Deterministic: same inputs, same result.
///
/// # Arguments
///
/// * `points` - Candidate boundary points; non-finite entries are dropped.
/// * `lower`, `upper` - Box constraints on the 5 transparent parameters.
/// * `fixed` - Per-parameter overrides; `Some(v)` pins that parameter to
///   `v`, `None` leaves it free.
///
/// # Errors
///
/// * [`EllipseFitError::InsufficientPoints`] with fewer than 5 finite
///   points.
/// * [`EllipseFitError::DegenerateFit`] when the points do not determine
///   an ellipse. Callers in the per-frame pipeline convert both into
///   NaN-sentinel rows; neither aborts a run.
pub fn fit_ellipse_constrained(
    points: &[Vector2<f64>],
    lower: &[f64; 5],
    upper: &[f64; 5],
    fixed: Option<&[Option<f64>; 5]>,
) -> Result<(TransparentEllipse, f64), EllipseFitError> {
    let finite: Vec<Vector2<f64>> = points
        .iter()
        .filter(|p| p.x.is_finite() && p.y.is_finite())
        .copied()
        .collect();
    if finite.len() < 5 {
        return Err(EllipseFitError::InsufficientPoints(finite.len()));
    }

    let (direct, direct_rmse) = fit_ellipse_direct(&finite)?;

    let mut seed = direct.as_array();
    if let Some(fixed) = fixed {
        for (i, value) in fixed.iter().enumerate() {
            if let Some(v) = value {
                seed[i] = *v;
            }
        }
    }
    for i in 0..5 {
        seed[i] = seed[i].clamp(lower[i], upper[i]);
    }

    let free: Vec<usize> = (0..5)
        .filter(|&i| fixed.map_or(true, |f| f[i].is_none()))
        .collect();

    // Fast path: the unconstrained direct solution already satisfies the
    // box and reproduces the data, so there is nothing to refine.
    if free.is_empty() || (seed == direct.as_array() && direct_rmse < 1e-9) {
        let ellipse = TransparentEllipse::from_array(seed);
        let rmse = rms_distance(&ellipse.as_array(), &finite);
        if ellipse.is_nan() || !rmse.is_finite() {
            return Err(EllipseFitError::DegenerateFit);
        }
        return Ok((ellipse, rmse));
    }

    let cost = EllipseDistanceCost {
        points: finite.clone(),
        template: seed,
        free: free.clone(),
    };

    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(finite.len(), &["ellipse"], Box::new(cost), None);
    for (k, &i) in free.iter().enumerate() {
        problem.set_variable_bounds("ellipse", k, lower[i], upper[i]);
    }

    let initial = DVector::from_vec(free.iter().map(|&i| seed[i]).collect::<Vec<f64>>());
    let mut initial_values = HashMap::new();
    initial_values.insert("ellipse".to_string(), initial);

    let optimizer = LevenbergMarquardtOptimizer::default();
    let mut refined = seed;
    match optimizer.optimize(&problem, &initial_values, None) {
        Some(solution) => {
            let values = &solution["ellipse"];
            for (k, &i) in free.iter().enumerate() {
                refined[i] = values[k].clamp(lower[i], upper[i]);
            }
        }
        None => {
            warn!("constrained ellipse refinement did not converge; keeping the clipped seed");
        }
    }
    refined[4] = super::wrap_theta(refined[4]).clamp(lower[4], upper[4]);

    // Keep whichever of seed and refinement explains the data better; a
    // refinement that wandered is discarded.
    let refined_rmse = rms_distance(&refined, &finite);
    let seed_rmse = rms_distance(&seed, &finite);
    let (best, best_rmse) = if refined_rmse <= seed_rmse {
        (refined, refined_rmse)
    } else {
        (seed, seed_rmse)
    };

    let ellipse = TransparentEllipse::from_array(best);
    if ellipse.is_nan() || !best_rmse.is_finite() {
        return Err(EllipseFitError::DegenerateFit);
    }
    Ok((ellipse, best_rmse))
}

/// Split-half standard-deviation estimate for the 5 ellipse parameters.
///
/// The boundary is rotated about its centroid through `n_splits` angles
/// spanning [0, pi/2); each rotation is cut into two half-sets by the
/// rotated vertical coordinate and each half refit under the same box.
/// The per-parameter sample SD across all half-fits is a resampling-based
/// local sensitivity measure, not a formal confidence interval.
///
/// Returns `None` when `n_splits` is zero or too few half-fits succeed.
pub fn split_half_sd(
    points: &[Vector2<f64>],
    lower: &[f64; 5],
    upper: &[f64; 5],
    n_splits: usize,
) -> Option<[f64; 5]> {
    if n_splits == 0 || points.len() < 10 {
        return None;
    }

    let inv_n = 1.0 / points.len() as f64;
    let centroid_x: f64 = points.iter().map(|p| p.x).sum::<f64>() * inv_n;
    let centroid_y: f64 = points.iter().map(|p| p.y).sum::<f64>() * inv_n;

    let mut fits: Vec<[f64; 5]> = Vec::new();
    for k in 0..n_splits {
        let angle = (PI / 2.0) * k as f64 / n_splits as f64;
        let (sin_a, cos_a) = angle.sin_cos();

        let mut upper_half = Vec::new();
        let mut lower_half = Vec::new();
        for p in points {
            let dy = -sin_a * (p.x - centroid_x) + cos_a * (p.y - centroid_y);
            if dy >= 0.0 {
                upper_half.push(*p);
            } else {
                lower_half.push(*p);
            }
        }

        for half in [&upper_half, &lower_half] {
            if half.len() >= 5 {
                if let Ok((ellipse, _)) = fit_ellipse_constrained(half, lower, upper, None) {
                    fits.push(ellipse.as_array());
                }
            }
        }
    }

    if fits.len() < 2 {
        return None;
    }

    let mut sd = [0.0; 5];
    for i in 0..5 {
        let mean = fits.iter().map(|f| f[i]).sum::<f64>() / fits.len() as f64;
        let var = fits.iter().map(|f| (f[i] - mean).powi(2)).sum::<f64>()
            / (fits.len() - 1) as f64;
        sd[i] = var.sqrt();
    }
    Some(sd)
}

/// Solve the 3x3 constrained eigenvector problem of the direct method:
/// the eigenvector of `C1^-1 M` that satisfies the ellipse constraint
/// `4 v0 v2 - v1^2 > 0`. When several qualify the one with the smallest
/// absolute eigenvalue is chosen, which makes the fit deterministic.
fn solve_constrained_eigenvector(system: &Matrix3<f64>) -> Option<Vector3<f64>> {
    // Characteristic polynomial of a 3x3 matrix:
    // lambda^3 - tr lambda^2 + (sum of principal minors) lambda - det = 0.
    let trace = system[(0, 0)] + system[(1, 1)] + system[(2, 2)];
    let minor_sum = system[(0, 0)] * system[(1, 1)] - system[(0, 1)] * system[(1, 0)]
        + system[(0, 0)] * system[(2, 2)]
        - system[(0, 2)] * system[(2, 0)]
        + system[(1, 1)] * system[(2, 2)]
        - system[(1, 2)] * system[(2, 1)];
    let det = system.determinant();

    let mut best: Option<(f64, Vector3<f64>)> = None;
    for lambda in real_cubic_roots(-trace, minor_sum, -det) {
        let shifted = system - Matrix3::identity() * lambda;
        let Some(v) = adjugate_null_vector(&shifted) else {
            continue;
        };
        if 4.0 * v[0] * v[2] - v[1] * v[1] > 0.0 {
            match best {
                Some((magnitude, _)) if lambda.abs() >= magnitude => {}
                _ => best = Some((lambda.abs(), v)),
            }
        }
    }
    best.map(|(_, v)| v)
}

/// Null vector of a near-singular 3x3 matrix: the adjugate row with the
/// largest norm (each row of the adjugate of a rank-2 matrix is
/// proportional to the null vector).
fn adjugate_null_vector(m: &Matrix3<f64>) -> Option<Vector3<f64>> {
    let rows = [
        Vector3::new(
            m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)],
            m[(1, 2)] * m[(2, 0)] - m[(1, 0)] * m[(2, 2)],
            m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)],
        ),
        Vector3::new(
            m[(0, 2)] * m[(2, 1)] - m[(0, 1)] * m[(2, 2)],
            m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)],
            m[(0, 1)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)],
        ),
        Vector3::new(
            m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)],
            m[(0, 2)] * m[(1, 0)] - m[(0, 0)] * m[(1, 2)],
            m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)],
        ),
    ];

    let best = rows
        .iter()
        .max_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()))?;
    let norm = best.norm();
    if norm < 1e-15 {
        return None;
    }
    Some(best / norm)
}

/// Real roots of `x^3 + b x^2 + c x + d = 0`.
fn real_cubic_roots(b: f64, c: f64, d: f64) -> Vec<f64> {
    let p = c - b * b / 3.0;
    let q = 2.0 * b * b * b / 27.0 - b * c / 3.0 + d;
    let shift = -b / 3.0;

    let discriminant = -4.0 * p * p * p - 27.0 * q * q;
    if discriminant >= 0.0 {
        // Three real roots, trigonometric form.
        let r = (-p / 3.0).max(0.0).sqrt();
        if r < 1e-15 {
            return vec![shift];
        }
        let cos_arg = (-q / (2.0 * r * r * r)).clamp(-1.0, 1.0);
        let theta = cos_arg.acos();
        (0..3)
            .map(|k| 2.0 * r * ((theta + 2.0 * PI * k as f64) / 3.0).cos() + shift)
            .collect()
    } else {
        // One real root, Cardano.
        let sqrt_term = (q * q / 4.0 + p * p * p / 27.0).sqrt();
        let u = (-q / 2.0 + sqrt_term).cbrt();
        let v = (-q / 2.0 - sqrt_term).cbrt();
        vec![u + v + shift]
    }
}

/// Convert general conic coefficients `[A, B, C, D, E, F]` to geometric
/// ellipse parameters. Returns `None` for non-ellipse conics.
fn conic_to_geometric(conic: &[f64; 6]) -> Option<GeometricEllipse> {
    let [a, b, c, d, e, f] = *conic;
    let discriminant = b * b - 4.0 * a * c;
    if discriminant >= 0.0 {
        return None;
    }

    let center_x = (2.0 * c * d - b * e) / discriminant;
    let center_y = (2.0 * a * e - b * d) / discriminant;

    // Conic value at the center; the centered conic is
    // l1 X^2 + l2 Y^2 + fc = 0 in the rotated frame.
    let fc = a * center_x * center_x
        + b * center_x * center_y
        + c * center_y * center_y
        + d * center_x
        + e * center_y
        + f;

    let theta = 0.5 * b.atan2(a - c);
    let (sin_t, cos_t) = theta.sin_cos();
    let l1 = a * cos_t * cos_t + b * cos_t * sin_t + c * sin_t * sin_t;
    let l2 = a * sin_t * sin_t - b * cos_t * sin_t + c * cos_t * cos_t;

    let r1_sq = -fc / l1;
    let r2_sq = -fc / l2;
    if !(r1_sq > 0.0) || !(r2_sq > 0.0) {
        return None;
    }

    let r1 = r1_sq.sqrt();
    let r2 = r2_sq.sqrt();
    let (semi_major, semi_minor, angle) = if r1 >= r2 {
        (r1, r2, theta)
    } else {
        (r2, r1, theta + PI / 2.0)
    };

    Some(GeometricEllipse {
        center_x,
        center_y,
        semi_major,
        semi_minor,
        angle: super::wrap_theta(angle),
    })
}

/// Undo the centroid/scale normalization on conic coefficients fitted in
/// normalized coordinates x' = s(x - mx), y' = s(y - my).
fn denormalize_conic(conic: &[f64; 6], mx: f64, my: f64, s: f64) -> [f64; 6] {
    let [a, b, c, d, e, f] = *conic;
    let s2 = s * s;
    [
        a * s2,
        b * s2,
        c * s2,
        -2.0 * a * s2 * mx - b * s2 * my + d * s,
        -b * s2 * mx - 2.0 * c * s2 * my + e * s,
        a * s2 * mx * mx + b * s2 * mx * my + c * s2 * my * my - d * s * mx - e * s * my + f,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn sample_ellipse(
        center: (f64, f64),
        semi_major: f64,
        semi_minor: f64,
        angle: f64,
        n: usize,
    ) -> Vec<Vector2<f64>> {
        TransparentEllipse::from_geometric(&GeometricEllipse {
            center_x: center.0,
            center_y: center.1,
            semi_major,
            semi_minor,
            angle,
        })
        .sample_boundary(n)
        .unwrap()
    }

    fn open_bounds() -> ([f64; 5], [f64; 5]) {
        (
            [-1e4, -1e4, 0.0, 0.0, 0.0],
            [1e4, 1e4, 1e7, 0.999, PI],
        )
    }

    #[test]
    fn test_direct_fit_recovers_known_ellipse() {
        let points = sample_ellipse((160.0, 120.0), 40.0, 25.0, 0.6, 24);
        let (ellipse, rmse) = fit_ellipse_direct(&points).unwrap();

        assert_relative_eq!(ellipse.center_x, 160.0, epsilon = 1e-6);
        assert_relative_eq!(ellipse.center_y, 120.0, epsilon = 1e-6);
        assert_relative_eq!(ellipse.area, PI * 40.0 * 25.0, epsilon = 1e-3);
        assert_relative_eq!(ellipse.theta, 0.6, epsilon = 1e-6);
        assert!(rmse < 1e-6);
    }

    #[test]
    fn test_direct_fit_minimum_point_count() {
        let points = sample_ellipse((0.0, 0.0), 10.0, 6.0, 0.3, 5);
        let (ellipse, _) = fit_ellipse_direct(&points).unwrap();
        assert_relative_eq!(ellipse.theta, 0.3, epsilon = 1e-6);

        let too_few = &points[..4];
        assert!(matches!(
            fit_ellipse_direct(too_few),
            Err(EllipseFitError::InsufficientPoints(4))
        ));
    }

    #[test]
    fn test_collinear_points_are_degenerate() {
        let points: Vec<Vector2<f64>> =
            (0..12).map(|i| Vector2::new(i as f64, 2.0 * i as f64)).collect();
        assert!(matches!(
            fit_ellipse_direct(&points),
            Err(EllipseFitError::DegenerateFit)
        ));
    }

    #[test]
    fn test_constrained_fit_honors_bounds() {
        let points = sample_ellipse((50.0, 50.0), 20.0, 15.0, 0.2, 20);
        let true_area = PI * 20.0 * 15.0;
        let (lower, mut upper) = open_bounds();
        upper[2] = true_area * 0.8;

        let (ellipse, _) = fit_ellipse_constrained(&points, &lower, &upper, None).unwrap();
        assert!(ellipse.area <= true_area * 0.8 + 1e-6);
    }

    #[test]
    fn test_constrained_fit_respects_fixed_params() {
        let points = sample_ellipse((80.0, 60.0), 30.0, 18.0, 0.9, 20);
        let (lower, upper) = open_bounds();
        let fixed = [None, None, None, Some(0.5), Some(1.0)];

        let (ellipse, _) = fit_ellipse_constrained(&points, &lower, &upper, Some(&fixed)).unwrap();
        assert_abs_diff_eq!(ellipse.eccentricity, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(ellipse.theta, 1.0, epsilon = 1e-12);
        // Center remains free and close to truth.
        assert_relative_eq!(ellipse.center_x, 80.0, epsilon = 1.0);
        assert_relative_eq!(ellipse.center_y, 60.0, epsilon = 1.0);
    }

    #[test]
    fn test_constrained_fit_insufficient_points() {
        let points = vec![
            Vector2::new(0.0, 0.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(0.0, 1.0),
            Vector2::new(f64::NAN, 1.0),
            Vector2::new(2.0, 2.0),
        ];
        let (lower, upper) = open_bounds();
        assert!(matches!(
            fit_ellipse_constrained(&points, &lower, &upper, None),
            Err(EllipseFitError::InsufficientPoints(4))
        ));
    }

    #[test]
    fn test_split_half_sd_near_zero_for_clean_data() {
        let points = sample_ellipse((100.0, 100.0), 35.0, 22.0, 0.4, 24);
        let (lower, upper) = open_bounds();
        let sd = split_half_sd(&points, &lower, &upper, 2).unwrap();

        // Noise-free data is perfectly consistent across splits.
        assert!(sd[0] < 1e-3, "center x SD too large: {}", sd[0]);
        assert!(sd[1] < 1e-3, "center y SD too large: {}", sd[1]);
        assert!(sd[3] < 1e-3, "eccentricity SD too large: {}", sd[3]);
    }

    #[test]
    fn test_split_half_sd_disabled_for_zero_splits() {
        let points = sample_ellipse((0.0, 0.0), 10.0, 8.0, 0.0, 24);
        let (lower, upper) = open_bounds();
        assert!(split_half_sd(&points, &lower, &upper, 0).is_none());
    }
}
