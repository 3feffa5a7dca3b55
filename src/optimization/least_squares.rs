//! Damped least-squares minimization with box constraints and a
//! forward-difference Jacobian.
//!
//! The eye-pose and scene-geometry objectives evaluate a full refractive
//! forward projection, which contains an inner one-dimensional search;
//! their derivatives are therefore only available numerically. This is a
//! compact Levenberg-Marquardt loop in the manner of the larger solver
//! crates: adaptive damping with success/failure accounting, an iteration
//! budget that returns the best point found rather than failing, and every
//! candidate step clamped into the caller's box.

use log::debug;
use nalgebra::{DMatrix, DVector};

/// Options controlling the damped least-squares search.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Iteration budget (accepted and rejected steps both count).
    pub max_iterations: usize,
    /// Initial damping parameter.
    pub initial_damping: f64,
    /// Relative forward-difference step used for the numeric Jacobian.
    pub gradient_step: f64,
    /// Relative cost-decrease threshold for convergence.
    pub cost_tolerance: f64,
    /// Step-norm threshold for convergence.
    pub step_tolerance: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            max_iterations: 50,
            initial_damping: 1e-3,
            gradient_step: 1e-6,
            cost_tolerance: 1e-12,
            step_tolerance: 1e-10,
        }
    }
}

/// Summary statistics for one search run.
#[derive(Debug, Clone)]
pub struct SearchSummary {
    pub iterations: usize,
    /// Steps that decreased the cost (damping relaxed).
    pub successful_steps: usize,
    /// Steps that increased the cost (damping raised, step discarded).
    pub unsuccessful_steps: usize,
    pub final_damping: f64,
    /// Whether a convergence criterion was met before the budget ran out.
    pub converged: bool,
}

/// Result of a bounded search: the best parameters found and the RMS of
/// the residual vector there.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub params: DVector<f64>,
    pub rmse: f64,
    pub summary: SearchSummary,
}

fn squared_cost(residuals: &DVector<f64>) -> f64 {
    let cost = residuals.norm_squared();
    if cost.is_finite() {
        cost
    } else {
        f64::INFINITY
    }
}

fn clamp_into(params: &mut DVector<f64>, lower: &DVector<f64>, upper: &DVector<f64>) {
    for i in 0..params.len() {
        params[i] = params[i].clamp(lower[i], upper[i]);
    }
}

/// Minimize the squared norm of `residual_fn` over the box
/// `[lower, upper]`, starting from `initial` (clamped into the box).
///
/// The residual function may return non-finite entries to mark invalid
/// parameter regions; such evaluations are treated as infinitely bad and
/// the step is rejected. Exceeding the iteration budget is not an error:
/// the best point seen is returned with `converged = false`.
pub fn minimize_bounded<F>(
    residual_fn: F,
    initial: &DVector<f64>,
    lower: &DVector<f64>,
    upper: &DVector<f64>,
    options: &SearchOptions,
) -> SearchResult
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    assert_eq!(initial.len(), lower.len());
    assert_eq!(initial.len(), upper.len());

    let n_params = initial.len();
    let mut params = initial.clone();
    clamp_into(&mut params, lower, upper);

    let mut residuals = residual_fn(&params);
    let n_residuals = residuals.len();
    let mut cost = squared_cost(&residuals);

    let mut best_params = params.clone();
    let mut best_cost = cost;

    let mut damping = options.initial_damping;
    let mut successful_steps = 0;
    let mut unsuccessful_steps = 0;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        iterations += 1;

        if !cost.is_finite() {
            // Start point is outside the valid region; nothing to linearize.
            break;
        }

        // Forward-difference Jacobian, stepping backward at the upper bound
        // so the probe never leaves the box.
        let mut jacobian = DMatrix::zeros(n_residuals, n_params);
        for j in 0..n_params {
            let scale = params[j].abs().max(1.0);
            let mut h = options.gradient_step * scale;
            if params[j] + h > upper[j] {
                h = -h;
            }
            if h == 0.0 {
                continue;
            }
            let mut probe = params.clone();
            probe[j] += h;
            let probe_residuals = residual_fn(&probe);
            if probe_residuals.len() != n_residuals {
                break;
            }
            for i in 0..n_residuals {
                let d = (probe_residuals[i] - residuals[i]) / h;
                jacobian[(i, j)] = if d.is_finite() { d } else { 0.0 };
            }
        }

        let jtj = jacobian.transpose() * &jacobian;
        let gradient = jacobian.transpose() * &residuals;

        // Marquardt scaling: damp along the diagonal of JtJ, with a floor
        // relative to the largest curvature so flat directions (e.g. a
        // parameter the residuals do not depend on) stay solvable.
        let max_diag = jtj.diagonal().iter().fold(0.0f64, |a, &b| a.max(b));
        let floor = (1e-8 * max_diag).max(1e-12);
        let mut system = jtj.clone();
        for d in 0..n_params {
            let diag = jtj[(d, d)].max(floor);
            system[(d, d)] += damping * diag + floor;
        }

        let rhs = -&gradient;
        let step = match system.clone().cholesky() {
            Some(chol) => chol.solve(&rhs),
            None => match system.lu().solve(&rhs) {
                Some(s) => s,
                None => break,
            },
        };

        let mut candidate = &params + &step;
        clamp_into(&mut candidate, lower, upper);
        let candidate_residuals = residual_fn(&candidate);
        let candidate_cost = squared_cost(&candidate_residuals);

        if candidate_cost < cost {
            let decrease = cost - candidate_cost;
            let step_norm = (&candidate - &params).norm();
            params = candidate;
            residuals = candidate_residuals;
            cost = candidate_cost;
            successful_steps += 1;
            damping = (damping * 0.3).max(1e-12);

            if cost < best_cost {
                best_cost = cost;
                best_params = params.clone();
            }

            if decrease <= options.cost_tolerance * cost.max(1e-30)
                || step_norm <= options.step_tolerance
            {
                converged = true;
                break;
            }
        } else {
            unsuccessful_steps += 1;
            damping *= 4.0;
            if damping > 1e12 {
                break;
            }
        }
    }

    debug!(
        "bounded search: {} iterations ({} ok / {} rejected), cost {:.6e}, converged: {}",
        iterations, successful_steps, unsuccessful_steps, best_cost, converged
    );

    let rmse = if n_residuals > 0 && best_cost.is_finite() {
        (best_cost / n_residuals as f64).sqrt()
    } else {
        f64::INFINITY
    };

    SearchResult {
        params: best_params,
        rmse,
        summary: SearchSummary {
            iterations,
            successful_steps,
            unsuccessful_steps,
            final_damping: damping,
            converged,
        },
    }
}
