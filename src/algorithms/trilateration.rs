//! 2-D multilateration from anchor ranges
//!
//! Both methods linearize the range equations by subtracting the first
//! anchor's circle equation from the others, which cancels the quadratic
//! terms in the tag coordinates:
//!
//! ```text
//! 2(xi - x1)·x + 2(yi - y1)·y = r1² - ri² - x1² + xi² - y1² + yi²
//! ```
//!
//! [`SolverMethod::Trilateration`] keeps only anchors 2 and 3 and solves the
//! resulting 2x2 system directly. [`SolverMethod::LeastSquares`] stacks one
//! row per extra anchor and solves the over-determined system with SVD.

use crate::core::{AnchorPosition, TagPosition, MIN_ANCHORS};
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default bound on the sine of the angle between the two linearized rows
/// (or the inverse condition number for least squares) below which the
/// geometry is treated as degenerate.
pub const DEFAULT_SINGULARITY_TOLERANCE: f64 = 1e-9;

/// Errors reported when a frame cannot be turned into a position
#[derive(Debug, Clone, PartialEq)]
pub enum SolverError {
    InsufficientAnchors { available: usize, required: usize },
    DimensionMismatch { anchors: usize, distances: usize },
    NonFiniteInput { index: usize },
    SingularGeometry { determinant: f64 },
    IllConditioned { inverse_condition: f64 },
    NonFiniteResult,
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverError::InsufficientAnchors { available, required } => {
                write!(f, "Insufficient anchors: {} available, {} required", available, required)
            }
            SolverError::DimensionMismatch { anchors, distances } => {
                write!(f, "Got {} anchors but {} distances", anchors, distances)
            }
            SolverError::NonFiniteInput { index } => {
                write!(f, "Anchor or distance {} is not a finite number", index)
            }
            SolverError::SingularGeometry { determinant } => {
                write!(f, "Anchor geometry is singular (determinant {:e})", determinant)
            }
            SolverError::IllConditioned { inverse_condition } => {
                write!(f, "Anchor geometry is ill-conditioned (1/cond {:e})", inverse_condition)
            }
            SolverError::NonFiniteResult => write!(f, "Solution is not finite"),
        }
    }
}

impl std::error::Error for SolverError {}

/// Which linearization the solver applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMethod {
    /// First three anchors only, exact 2x2 solve
    #[default]
    Trilateration,
    /// Every supplied anchor, SVD least squares
    LeastSquares,
}

impl FromStr for SolverMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trilateration" | "lu" => Ok(SolverMethod::Trilateration),
            "least_squares" | "least-squares" | "lsq" => Ok(SolverMethod::LeastSquares),
            other => Err(format!("unknown solver method '{}'", other)),
        }
    }
}

impl fmt::Display for SolverMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverMethod::Trilateration => write!(f, "trilateration"),
            SolverMethod::LeastSquares => write!(f, "least_squares"),
        }
    }
}

/// Multilateration solver for a single tag in the anchor plane
#[derive(Debug, Clone)]
pub struct MultilaterationSolver {
    pub method: SolverMethod,
    pub singularity_tolerance: f64,
}

impl Default for MultilaterationSolver {
    fn default() -> Self {
        Self {
            method: SolverMethod::Trilateration,
            singularity_tolerance: DEFAULT_SINGULARITY_TOLERANCE,
        }
    }
}

impl MultilaterationSolver {
    pub fn new(method: SolverMethod) -> Self {
        Self {
            method,
            ..Default::default()
        }
    }

    /// Estimate the tag position, or `Unsolved` if the input cannot be solved.
    ///
    /// The reason for an unsolved result is logged at debug level.
    pub fn solve(&self, anchors: &[AnchorPosition], distances: &[f64]) -> TagPosition {
        match self.estimate(anchors, distances) {
            Ok(position) => position,
            Err(e) => {
                tracing::debug!(method = %self.method, "position unsolved: {}", e);
                TagPosition::Unsolved
            }
        }
    }

    /// Estimate the tag position, reporting why the input could not be solved.
    ///
    /// On success the result is always [`TagPosition::Solved`].
    pub fn estimate(&self, anchors: &[AnchorPosition], distances: &[f64]) -> Result<TagPosition, SolverError> {
        let available = anchors.len().min(distances.len());
        if available < MIN_ANCHORS {
            return Err(SolverError::InsufficientAnchors {
                available,
                required: MIN_ANCHORS,
            });
        }
        if anchors.len() != distances.len() {
            return Err(SolverError::DimensionMismatch {
                anchors: anchors.len(),
                distances: distances.len(),
            });
        }

        let used = match self.method {
            SolverMethod::Trilateration => MIN_ANCHORS,
            SolverMethod::LeastSquares => anchors.len(),
        };
        let (anchors, distances) = (&anchors[..used], &distances[..used]);

        if let Some(index) = anchors
            .iter()
            .zip(distances)
            .position(|(a, r)| !(a.x.is_finite() && a.y.is_finite() && r.is_finite()))
        {
            return Err(SolverError::NonFiniteInput { index });
        }

        let (x, y) = match self.method {
            SolverMethod::Trilateration => self.solve_three(anchors, distances)?,
            SolverMethod::LeastSquares => self.solve_least_squares(anchors, distances)?,
        };

        if !(x.is_finite() && y.is_finite()) {
            return Err(SolverError::NonFiniteResult);
        }

        Ok(TagPosition::Solved {
            x,
            y,
            residual: rms_residual(anchors, distances, x, y),
        })
    }

    /// Exact solve of the 2x2 system built from the first three anchors
    fn solve_three(&self, anchors: &[AnchorPosition], distances: &[f64]) -> Result<(f64, f64), SolverError> {
        let p1 = &anchors[0];
        let r1 = distances[0];

        let mut a_matrix = Matrix2::zeros();
        let mut b_vector = Vector2::zeros();
        for i in 1..3 {
            let (row, b) = linearized_row(p1, r1, &anchors[i], distances[i]);
            a_matrix[(i - 1, 0)] = row.0;
            a_matrix[(i - 1, 1)] = row.1;
            b_vector[i - 1] = b;
        }

        let determinant = a_matrix.determinant();
        let row_norms = a_matrix.row(0).norm() * a_matrix.row(1).norm();
        if row_norms == 0.0 || determinant.abs() <= self.singularity_tolerance * row_norms {
            return Err(SolverError::SingularGeometry { determinant });
        }

        let solution = a_matrix
            .lu()
            .solve(&b_vector)
            .ok_or(SolverError::SingularGeometry { determinant })?;

        Ok((solution.x, solution.y))
    }

    /// Least-squares solve using every anchor against the first one
    fn solve_least_squares(&self, anchors: &[AnchorPosition], distances: &[f64]) -> Result<(f64, f64), SolverError> {
        let n = anchors.len();
        let p1 = &anchors[0];
        let r1 = distances[0];

        let mut a_matrix = DMatrix::zeros(n - 1, 2);
        let mut b_vector = DVector::zeros(n - 1);
        for i in 1..n {
            let (row, b) = linearized_row(p1, r1, &anchors[i], distances[i]);
            a_matrix[(i - 1, 0)] = row.0;
            a_matrix[(i - 1, 1)] = row.1;
            b_vector[i - 1] = b;
        }

        let svd = a_matrix.svd(true, true);
        let (max_sv, min_sv) = svd
            .singular_values
            .iter()
            .fold((0.0f64, f64::INFINITY), |(max, min), &s| (max.max(s), min.min(s)));

        let inverse_condition = if max_sv > 0.0 { min_sv / max_sv } else { 0.0 };
        if inverse_condition <= self.singularity_tolerance {
            return Err(SolverError::IllConditioned { inverse_condition });
        }

        let solution = svd
            .solve(&b_vector, self.singularity_tolerance * max_sv)
            .map_err(|_| SolverError::IllConditioned { inverse_condition })?;

        Ok((solution[0], solution[1]))
    }
}

/// Estimate a tag position with the default three-anchor solver
pub fn solve(anchors: &[AnchorPosition], distances: &[f64]) -> TagPosition {
    MultilaterationSolver::default().solve(anchors, distances)
}

/// One row of the linearized system for anchor `pi` against reference `p1`
fn linearized_row(p1: &AnchorPosition, r1: f64, pi: &AnchorPosition, ri: f64) -> ((f64, f64), f64) {
    let row = (2.0 * (pi.x - p1.x), 2.0 * (pi.y - p1.y));
    let b = r1.powi(2) - ri.powi(2) - p1.x.powi(2) + pi.x.powi(2) - p1.y.powi(2) + pi.y.powi(2);
    (row, b)
}

/// Root-mean-square range error of an estimate over the given anchors
fn rms_residual(anchors: &[AnchorPosition], distances: &[f64], x: f64, y: f64) -> f64 {
    let sum: f64 = anchors
        .iter()
        .zip(distances)
        .map(|(anchor, r)| (anchor.distance_to(x, y) - r).powi(2))
        .sum();
    (sum / anchors.len() as f64).sqrt()
}
