//! Bounded one-dimensional minimization by golden-section search.

/// Options for the golden-section search.
#[derive(Debug, Clone)]
pub struct ScalarSearchOptions {
    /// Width of the bracketing interval at which the search stops.
    pub tolerance: f64,
    /// Iteration budget. Exhausting it returns the best point found
    /// rather than failing.
    pub max_iterations: usize,
}

impl Default for ScalarSearchOptions {
    fn default() -> Self {
        ScalarSearchOptions {
            tolerance: 1e-8,
            max_iterations: 100,
        }
    }
}

const INV_PHI: f64 = 0.618_033_988_749_894_9;

/// Minimize `f` over `[a, b]` by golden-section search.
///
/// Returns `(x, f(x))` for the best interior point examined. The routine
/// assumes the objective is unimodal on the bracket; on a multimodal
/// objective it converges to a local minimum. Non-finite objective values
/// are treated as infinitely bad, so an objective may signal invalid
/// regions with NaN without breaking the search.
pub fn golden_section_min<F>(f: F, a: f64, b: f64, options: &ScalarSearchOptions) -> (f64, f64)
where
    F: Fn(f64) -> f64,
{
    let eval = |x: f64| {
        let y = f(x);
        if y.is_finite() {
            y
        } else {
            f64::INFINITY
        }
    };

    let (mut lo, mut hi) = if a <= b { (a, b) } else { (b, a) };
    let mut x1 = hi - INV_PHI * (hi - lo);
    let mut x2 = lo + INV_PHI * (hi - lo);
    let mut f1 = eval(x1);
    let mut f2 = eval(x2);

    for _ in 0..options.max_iterations {
        if (hi - lo).abs() <= options.tolerance {
            break;
        }
        if f1 <= f2 {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - INV_PHI * (hi - lo);
            f1 = eval(x1);
        } else {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + INV_PHI * (hi - lo);
            f2 = eval(x2);
        }
    }

    if f1 <= f2 {
        (x1, f1)
    } else {
        (x2, f2)
    }
}
