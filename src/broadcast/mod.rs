//! # Broadcasting Module
//!
//! Real-time fan-out of ranging data and tag positions.
//!
//! - [`hub`]: the client registry. Ingestion sessions publish into it;
//!   every subscriber gets its own bounded queue.
//! - [`server`]: the Axum server exposing the hub over WebSocket, plus the
//!   anchor layout endpoint.

pub mod hub;
pub mod server;

pub use hub::{BroadcastHub, ClientHandle, HubEvent, PublishReport, Subscription};
