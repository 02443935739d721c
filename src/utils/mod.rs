//! Configuration loading

pub mod config;

pub use config::{AnchorSet, ConfigError, ServerConfig, ANCHOR_FILE_NAME};
