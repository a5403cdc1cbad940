//! Core types for Vellum
//!
//! This crate defines the foundational types shared by every layer:
//! - ChannelError: failures of mediated volume channels
//! - VellumError: engine-level error hierarchy, including fatal shutdown
//! - FatalCause: the recorded reason an engine instance was shut down
//! - VolumeSpec / AccessMode: resolved volume descriptions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod volume;

pub use error::{ChannelError, ChannelResult, FatalCause, VellumError, VellumResult};
pub use volume::{AccessMode, VolumeSpec, VolumeSpecError, DEFAULT_PAGE_SIZE};

impl From<VolumeSpecError> for VellumError {
    fn from(e: VolumeSpecError) -> Self {
        VellumError::Config(e.to_string())
    }
}
