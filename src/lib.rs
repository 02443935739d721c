//! UWB Positioning Relay
//!
//! Accepts streams of newline-delimited JSON ranging frames from UWB anchors,
//! relays every frame to real-time clients, and solves the tag's 2-D position
//! from the anchor layout.

pub mod core;
pub mod algorithms;
pub mod processing;
pub mod utils;
pub mod broadcast;
pub mod ingestion;

// Re-export commonly used types
pub use core::{AnchorPosition, MeasurementFrame, RangeLink, TagPosition};
pub use algorithms::{solve, MultilaterationSolver, SolverError, SolverMethod};
pub use processing::{decode_line, FrameParser, ParseError};
pub use utils::{AnchorSet, ConfigError, ServerConfig};
pub use broadcast::{BroadcastHub, HubEvent, PublishReport, Subscription};
pub use ingestion::{ConnectionError, FramePipeline, IngestionListener, IngestionSession, Positioner};
