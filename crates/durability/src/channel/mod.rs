//! Volume channels
//!
//! Every page read and write reaches disk through a [`MediatedChannel`],
//! which wraps one real [`DurableChannel`] per volume file and keeps it
//! usable when an unrelated caller's cancellation invalidates the shared
//! handle.
//!
//! # Layers
//!
//! - [`ChannelOpener`]: opens real channels by path (the OS seam)
//! - [`DurableChannel`]: one open handle supporting positional I/O, sizing,
//!   truncation, durability flushes and advisory locks
//! - [`MediatedChannel`]: reopen-and-retry on collateral invalidation,
//!   `Interrupted` for the cancelled caller, lazy lock channel
//!
//! Only positional operations exist. A real channel's cursor does not
//! survive a reopen, so callers always pass an explicit position.

mod cancel;
mod fault;
mod file;
mod lock;
mod mediator;

pub use cancel::CancelToken;
pub use fault::{FaultInjector, InjectedFault, OpTag};
pub use file::{FileChannel, FileOpener};
pub use lock::ChannelLock;
pub use mediator::{lock_path_for, MediatedChannel, LOCK_EXTENSION};

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use vellum_core::{AccessMode, ChannelResult};

/// One open handle on a durable file.
///
/// Implementations must support concurrent positional access from many
/// threads. Once a handle is closed or invalidated every operation returns
/// `ChannelError::Closed`; a handle never reopens itself.
pub trait DurableChannel: Send + Sync + fmt::Debug {
    /// Read into `buf` starting at `position`; returns bytes read, 0 at end
    /// of file.
    fn read_at(&self, buf: &mut [u8], position: u64) -> ChannelResult<usize>;

    /// Write `buf` starting at `position`; returns bytes written.
    fn write_at(&self, buf: &[u8], position: u64) -> ChannelResult<usize>;

    /// Current file size in bytes.
    fn size(&self) -> ChannelResult<u64>;

    /// Shrink the file to `size` bytes. No effect when `size` is not less
    /// than the current size.
    fn truncate(&self, size: u64) -> ChannelResult<()>;

    /// Flush written data to stable storage, and file metadata too when
    /// `metadata` is set.
    fn sync(&self, metadata: bool) -> ChannelResult<()>;

    /// Try to take an advisory lock on `len` bytes at `position`.
    ///
    /// Returns `false` when another handle holds an incompatible lock.
    fn try_lock(&self, position: u64, len: u64, shared: bool) -> ChannelResult<bool>;

    /// Release a lock previously taken with [`DurableChannel::try_lock`].
    fn unlock(&self, position: u64, len: u64) -> ChannelResult<()>;

    /// Check if the handle is still usable
    fn is_open(&self) -> bool;

    /// Close the handle. Closing twice is not an error.
    fn close(&self) -> ChannelResult<()>;
}

/// Opens real channels.
///
/// `AccessMode::ReadWrite` creates the file when missing;
/// `AccessMode::ReadOnly` requires it to exist.
pub trait ChannelOpener: Send + Sync + fmt::Debug {
    /// Open a channel on `path`
    fn open(&self, path: &Path, access: AccessMode) -> ChannelResult<Arc<dyn DurableChannel>>;

    /// Check if a file exists at `path`
    fn exists(&self, path: &Path) -> bool;

    /// Remove the file at `path`
    fn remove(&self, path: &Path) -> ChannelResult<()>;
}
