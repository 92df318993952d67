//! Scalar stability diagnostics derived from weight gradients.
//!
//! The names follow the training literature loosely: `S` is the summed
//! gradient norm, `V = S²` is tracked as a Lyapunov-style energy and the
//! damping factor `1 / (1 + S)` shrinks the step when gradients are large.
//! None of these are proofs of stability; they are diagnostics.

use crate::matrix::Mat;

use itertools::Itertools;
use serde_derive::{Deserialize, Serialize};

/// Relative slack allowed before an increase in `V` counts as a violation.
const LYAPUNOV_TOLERANCE: f64 = 1.01;

/// Fraction of transitions that may violate monotonic decrease while the
/// trajectory is still reported stable.
const MAX_VIOLATION_RATIO: f64 = 0.1;

/// Computes the stability scalar and its derived quantities.
#[derive(Copy, Clone, Debug, Default)]
pub struct StabilityMonitor;

/// Outcome of the post-training monotonicity check on `V`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityReport {
    /// Number of consecutive pairs compared.
    pub transitions: usize,
    /// Pairs where `V` grew by more than the tolerance.
    pub violations: usize,
    pub stable: bool,
}

impl StabilityMonitor {
    /// `S`: the sum of Frobenius norms over all layer gradients.
    pub fn stability(&self, gradients: &[Mat]) -> f64 {
        gradients.iter().map(Mat::frobenius_norm).sum()
    }

    /// `V = S²`.
    pub fn lyapunov(&self, stability: f64) -> f64 {
        stability * stability
    }

    /// `ψ = 1 / (1 + S)`, in `(0, 1]` for any `S >= 0`.
    pub fn damping(&self, stability: f64) -> f64 {
        1.0 / (1.0 + stability)
    }

    /// Counts the steps where `V` rose by more than 1% over its predecessor.
    ///
    /// The sequence is stable when fewer than 10% of the transitions are
    /// violations. Sequences with no transitions are stable.
    pub fn check<I>(&self, lyapunov: I) -> StabilityReport
    where
        I: IntoIterator<Item = f64>,
    {
        let (transitions, violations) = lyapunov
            .into_iter()
            .tuple_windows()
            .fold((0usize, 0usize), |(transitions, violations), (prev, next)| {
                let violated = next > prev * LYAPUNOV_TOLERANCE;
                (transitions + 1, violations + violated as usize)
            });
        let stable = transitions == 0
            || (violations as f64) < MAX_VIOLATION_RATIO * transitions as f64;
        StabilityReport {
            transitions,
            violations,
            stable,
        }
    }
}
