//! # quay-core
//!
//! Shared types for the Quay deployment engine.
//!
//! Quay builds and publishes user-submitted projects as hosted static
//! artifacts while streaming build progress to live viewers. This crate
//! carries the vocabulary every other crate speaks:
//!
//! - Projects ARE immutable descriptors (name + source reference)
//! - Jobs ARE one build-and-publish attempt each, in-memory by design
//! - Progress IS an ordered stream of log and status events
//! - Fixes ARE best-effort repairs, never required steps

mod config;
mod error;
mod types;

pub use config::{EngineConfig, QuayConfig, ServerConfig};
pub use error::{QuayError, Result};
pub use types::*;
