//! Core types and constants for the UWB positioning relay

pub mod types;
pub mod constants;

pub use types::*;
pub use constants::*;
