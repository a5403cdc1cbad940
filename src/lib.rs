//! Vellum - embedded page-structured storage engine
//!
//! Vellum stores pages in volume files and keeps them consistent when
//! threads are cancelled mid-operation or the engine detects damage it
//! cannot repair.
//!
//! # Quick Start
//!
//! ```ignore
//! use vellum::{CancelToken, Engine, EngineConfig, VolumeSpec};
//!
//! let engine = Engine::open_with_config(
//!     "/path/to/engine",
//!     EngineConfig::default().with_volume(VolumeSpec::new("main.v01").with_alias("main")),
//! )?;
//!
//! let volume = engine.volume("main")?;
//! let cancel = CancelToken::new();
//! volume.write_page(0, &[0u8; 8192], &cancel)?;
//! volume.force(&cancel)?;
//! ```
//!
//! # Architecture
//!
//! - `vellum-core`: errors, fatal causes and volume specs
//! - `vellum-durability`: mediated channels that reopen and retry when a
//!   shared file handle is invalidated by another caller's cancellation
//! - `vellum-engine`: engine instances, volumes and the fatal latch

pub use vellum_core::{
    AccessMode, ChannelError, ChannelResult, FatalCause, VellumError, VellumResult, VolumeSpec,
    VolumeSpecError, DEFAULT_PAGE_SIZE,
};
pub use vellum_durability::{
    CancelToken, ChannelLock, ChannelOpener, DurableChannel, FileOpener, MediatedChannel,
};
pub use vellum_engine::*;
