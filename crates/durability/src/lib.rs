//! Durability layer for Vellum
//!
//! This crate handles everything that touches volume files:
//!
//! - Mediated channels: positional I/O that survives collateral channel
//!   invalidation by reopening and retrying
//! - Cancellation tokens: per-call interrupt signal
//! - Lock channels: lazily opened advisory locks on `<volume>.lck`
//! - Fault injection: deterministic synthetic failures for tests
//! - Testing infrastructure: in-memory opener with invalidation control

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod testing;

pub use channel::{
    lock_path_for, CancelToken, ChannelLock, ChannelOpener, DurableChannel, FileChannel,
    FileOpener, MediatedChannel, LOCK_EXTENSION,
};
pub use channel::{FaultInjector, InjectedFault, OpTag};
pub use vellum_core::{AccessMode, ChannelError, ChannelResult};
