//! Storage engine for Vellum
//!
//! This crate ties volume channels to an engine instance:
//! - Engine: open/close, volume registry, graceful and abrupt shutdown
//! - Volume: page and byte I/O guarded by the engine's fatal latch
//! - FatalLatch: one-way shutdown on unrecoverable errors
//! - EngineConfig: `vellum.toml` in the engine directory
//!
//! The engine is the only component that knows about the latch. Channels
//! below it never consult it; every public entry point here does.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod engine;
pub mod latch;
mod volume;

pub use config::{EngineConfig, CONFIG_FILE_NAME};
pub use engine::{Engine, FATAL_MARKER_FILE};
pub use latch::FatalLatch;
pub use volume::Volume;
