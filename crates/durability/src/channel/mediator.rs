//! Interrupt-resilient channel mediator
//!
//! A volume file is shared by every thread doing page I/O. When one caller is
//! cancelled mid-operation the file layer may close the real handle out from
//! under all the others. The mediator hides that collateral damage:
//!
//! 1. An operation that finds its real channel closed checks whether the
//!    mediator itself was closed by its owner; if so the failure is real.
//! 2. Otherwise the mediator reopens the file (once, no matter how many
//!    callers noticed) and then asks the caller's [`CancelToken`]:
//!    - cancelled: this caller caused the invalidation, so it gets
//!      `ChannelError::Interrupted` wrapping the original failure;
//!    - not cancelled: the operation is retried on the new channel.
//!
//! Only channel invalidation is retried. Every other I/O failure propagates
//! unchanged.

use super::fault::OpTag;
#[cfg(any(test, feature = "fault-injection"))]
use super::fault::FaultInjector;
use super::{CancelToken, ChannelLock, ChannelOpener, DurableChannel};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use vellum_core::{AccessMode, ChannelError, ChannelResult};

/// Suffix appended to a volume file's name to form its lock file name
pub const LOCK_EXTENSION: &str = ".lck";

/// Lock file path for a volume file: same directory, `.lck` appended.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(LOCK_EXTENSION);
    path.with_file_name(name)
}

/// Mediated handle on one volume file.
///
/// Holds exactly one live real channel at a time, replaced wholesale on
/// reopen. I/O calls are not serialized against each other; each attempt
/// works on one `Arc` snapshot of the real channel. Reopening and the lazy
/// lock-channel open are the only critical sections.
///
/// After [`MediatedChannel::close`] every operation fails with
/// `ChannelError::Closed` and nothing is reopened.
#[derive(Debug)]
pub struct MediatedChannel {
    path: PathBuf,
    lock_path: PathBuf,
    access: AccessMode,
    opener: Arc<dyn ChannelOpener>,
    channel: Mutex<Option<Arc<dyn DurableChannel>>>,
    lock_channel: Mutex<Option<Arc<dyn DurableChannel>>>,
    closed: AtomicBool,
    reopens: AtomicU64,
    #[cfg(any(test, feature = "fault-injection"))]
    faults: FaultInjector,
}

impl MediatedChannel {
    /// Open `path` through `opener`.
    pub fn open(
        path: impl Into<PathBuf>,
        access: AccessMode,
        opener: Arc<dyn ChannelOpener>,
    ) -> ChannelResult<Self> {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        let channel = opener.open(&path, access)?;
        Ok(MediatedChannel {
            path,
            lock_path,
            access,
            opener,
            channel: Mutex::new(Some(channel)),
            lock_channel: Mutex::new(None),
            closed: AtomicBool::new(false),
            reopens: AtomicU64::new(0),
            #[cfg(any(test, feature = "fault-injection"))]
            faults: FaultInjector::new(),
        })
    }

    /// Volume file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock file path
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Access mode the file is opened with
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Check if the owner closed this channel
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of real reopens performed after invalidations
    pub fn reopen_count(&self) -> u64 {
        self.reopens.load(Ordering::Relaxed)
    }

    /// Fault injector consulted before every real operation
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn fault_injector(&self) -> &FaultInjector {
        &self.faults
    }

    // ========================================================================
    // Positional I/O
    // ========================================================================

    /// Read into `buf` at `position`; returns bytes read (0 at end of file).
    pub fn read(&self, buf: &mut [u8], position: u64, cancel: &CancelToken) -> ChannelResult<usize> {
        if buf.is_empty() {
            return Err(ChannelError::InvalidArgument("read buffer is empty".into()));
        }
        self.mediate(OpTag::Read, cancel, |ch| ch.read_at(buf, position))
    }

    /// Write `buf` at `position`; returns bytes written.
    ///
    /// A single-byte write is how volume files are extended and additionally
    /// consults the `Extend` fault tag.
    pub fn write(&self, buf: &[u8], position: u64, cancel: &CancelToken) -> ChannelResult<usize> {
        if buf.is_empty() {
            return Err(ChannelError::InvalidArgument("write buffer is empty".into()));
        }
        self.require_writable()?;
        self.mediate(OpTag::Write, cancel, |ch| {
            if buf.len() == 1 {
                self.inject_failure(OpTag::Extend)?;
            }
            ch.write_at(buf, position)
        })
    }

    /// Flush written data, and metadata when `metadata` is set.
    pub fn force(&self, metadata: bool, cancel: &CancelToken) -> ChannelResult<()> {
        self.mediate(OpTag::Force, cancel, |ch| ch.sync(metadata))
    }

    /// Current file size in bytes.
    pub fn size(&self, cancel: &CancelToken) -> ChannelResult<u64> {
        self.mediate(OpTag::Size, cancel, |ch| ch.size())
    }

    /// Shrink the file to `new_size` bytes.
    pub fn truncate(&self, new_size: u64, cancel: &CancelToken) -> ChannelResult<()> {
        self.require_writable()?;
        self.mediate(OpTag::Truncate, cancel, |ch| ch.truncate(new_size))
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Try to lock `len` bytes at `position` of the volume's lock file.
    ///
    /// The lock channel is opened on first use. If it cannot be opened, a
    /// shared request still succeeds with an unbacked lock: a read-only
    /// volume may lack permission to create the lock file, and a missing
    /// writer lock file means no writer is active. An exclusive request
    /// propagates the failure.
    ///
    /// Returns `None` when another handle holds an incompatible lock.
    pub fn try_lock(&self, position: u64, len: u64, shared: bool) -> ChannelResult<Option<ChannelLock>> {
        self.ensure_open()?;
        let mut slot = self.lock_channel.lock();
        // close() may have won the race for the slot
        self.ensure_open()?;
        let channel = match slot.as_ref() {
            Some(channel) => Arc::clone(channel),
            None => {
                self.inject_failure(OpTag::Lock)?;
                match self.opener.open(&self.lock_path, AccessMode::ReadWrite) {
                    Ok(channel) => {
                        *slot = Some(Arc::clone(&channel));
                        channel
                    }
                    Err(e) if shared => {
                        warn!(
                            target: "vellum::channel",
                            lock_path = %self.lock_path.display(),
                            error = %e,
                            "lock file unavailable, granting shared lock without it"
                        );
                        return Ok(Some(ChannelLock::unbacked(position, len, shared)));
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        if channel.try_lock(position, len, shared)? {
            Ok(Some(ChannelLock::backed(channel, position, len, shared)))
        } else {
            Ok(None)
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the mediator. The first caller performs the close; later and
    /// concurrent callers return immediately.
    ///
    /// Deletes the lock file and closes the lock channel, then closes the
    /// data channel. Both steps always run; if both fail, the data channel's
    /// failure is returned.
    ///
    /// The lock file is deleted even while other mediators still hold shared
    /// locks on it. A later exclusive request then creates a fresh lock file
    /// and succeeds while those readers are still active, so shared holders
    /// are only protected against writers that opened the old file.
    pub fn close(&self) -> ChannelResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut lock_failure = None;
        if let Some(lock_channel) = self.lock_channel.lock().take() {
            if let Err(e) = self.opener.remove(&self.lock_path) {
                lock_failure = Some(e);
            }
            if let Err(e) = lock_channel.close() {
                lock_failure.get_or_insert(e);
            }
        }

        let data_result = match self.channel.lock().take() {
            Some(channel) => channel
                .close()
                .and_then(|()| self.inject_failure(OpTag::Close)),
            None => Ok(()),
        };

        debug!(target: "vellum::channel", path = %self.path.display(), "channel closed");

        match (data_result, lock_failure) {
            (Err(e), _) if !e.is_closed() => Err(e),
            (_, Some(e)) if !e.is_closed() => Err(e),
            _ => Ok(()),
        }
    }

    /// Drop every handle without flushing or removing the lock file, leaving
    /// the files exactly as a killed process would.
    pub fn abandon(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lock_channel.lock().take();
        self.channel.lock().take();
        debug!(target: "vellum::channel", path = %self.path.display(), "channel abandoned");
    }

    // ========================================================================
    // Reopen and retry
    // ========================================================================

    /// Run `op` against the current real channel until it returns something
    /// other than a collateral invalidation.
    fn mediate<T>(
        &self,
        tag: OpTag,
        cancel: &CancelToken,
        mut op: impl FnMut(&dyn DurableChannel) -> ChannelResult<T>,
    ) -> ChannelResult<T> {
        loop {
            self.ensure_open()?;
            self.inject_failure(tag)?;
            let channel = self.current()?;
            match op(channel.as_ref()) {
                Err(e) if e.is_closed() => self.handle_invalidation(e, cancel)?,
                result => return result,
            }
        }
    }

    fn handle_invalidation(&self, invalidation: ChannelError, cancel: &CancelToken) -> ChannelResult<()> {
        if self.is_closed() {
            return Err(invalidation);
        }
        self.reopen()?;
        if cancel.is_cancelled() {
            return Err(ChannelError::Interrupted {
                path: self.path.clone(),
                source: Box::new(invalidation),
            });
        }
        Ok(())
    }

    /// Replace an invalidated real channel. Callers that lose the race find
    /// an open channel in the slot and return without opening another.
    fn reopen(&self) -> ChannelResult<()> {
        let mut slot = self.channel.lock();
        if self.is_closed() {
            return Err(ChannelError::closed(&self.path));
        }
        if slot.as_ref().map_or(false, |channel| channel.is_open()) {
            return Ok(());
        }
        self.inject_failure(OpTag::Open)?;
        *slot = Some(self.opener.open(&self.path, self.access)?);
        let reopens = self.reopens.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            target: "vellum::channel",
            path = %self.path.display(),
            reopens,
            "reopened channel after invalidation"
        );
        Ok(())
    }

    fn current(&self) -> ChannelResult<Arc<dyn DurableChannel>> {
        match self.channel.lock().as_ref() {
            Some(channel) => Ok(Arc::clone(channel)),
            None => Err(ChannelError::closed(&self.path)),
        }
    }

    fn ensure_open(&self) -> ChannelResult<()> {
        if self.is_closed() {
            Err(ChannelError::closed(&self.path))
        } else {
            Ok(())
        }
    }

    fn require_writable(&self) -> ChannelResult<()> {
        if self.access.is_writable() {
            Ok(())
        } else {
            Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is open read-only", self.path.display()),
            )))
        }
    }

    #[cfg(any(test, feature = "fault-injection"))]
    fn inject_failure(&self, tag: OpTag) -> ChannelResult<()> {
        self.faults.check(tag)
    }

    #[cfg(not(any(test, feature = "fault-injection")))]
    #[inline(always)]
    fn inject_failure(&self, _tag: OpTag) -> ChannelResult<()> {
        Ok(())
    }
}
