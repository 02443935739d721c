//! Positioning algorithms

pub mod trilateration;

pub use trilateration::{solve, MultilaterationSolver, SolverError, SolverMethod};
