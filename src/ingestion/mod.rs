//! TCP ingestion of anchor ranging streams
//!
//! The listener accepts any number of plaintext connections and runs each as
//! an independent [`IngestionSession`] task. Sessions share one
//! [`FramePipeline`], which publishes every valid frame to the broadcast hub
//! and, when an anchor layout is loaded, the tag position solved from it.

pub mod error;
pub mod listener;
pub mod pipeline;
pub mod session;

pub use error::{ConnectionError, ConnectionResult};
pub use listener::IngestionListener;
pub use pipeline::{Dispatch, FramePipeline, PositionUpdate, Positioner};
pub use session::{IngestionSession, SessionState, SessionSummary};
