//! The `optimization` module provides the bounded search engines used by
//! the fitting layers.
//!
//! Two kinds of objective arise in this crate. Closed-form residuals (the
//! constrained ellipse refinement) go through `tiny_solver`'s
//! Levenberg-Marquardt optimizer with automatic differentiation. The
//! eye-pose and scene-geometry objectives embed an inner iterative ray
//! trace, so their Jacobians are not available to autodiff; those run on
//! the damped least-squares loop in [`least_squares`], which differences
//! the residual vector numerically and projects every step into the
//! caller's box constraints. The ray tracer's one-dimensional departure
//! angle search uses the golden-section routine in [`scalar`].

pub mod least_squares;
pub mod scalar;

pub use least_squares::{minimize_bounded, SearchOptions, SearchResult, SearchSummary};
pub use scalar::{golden_section_min, ScalarSearchOptions};
