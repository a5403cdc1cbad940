//! In-memory channel opener
//!
//! [`MemOpener`] keeps file contents in memory and lets tests do what the OS
//! does when a cancelled caller's close propagates: invalidate every handle
//! that shares an open file. It also counts opens, explicit closes and syncs
//! per path, and can deny opens or removals to simulate permission failures.

use crate::channel::{ChannelOpener, DurableChannel};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use vellum_core::{AccessMode, ChannelError, ChannelResult};

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    owner: u64,
    position: u64,
    len: u64,
    shared: bool,
}

impl HeldLock {
    fn overlaps(&self, position: u64, len: u64) -> bool {
        let end = position.saturating_add(len);
        let held_end = self.position.saturating_add(self.len);
        position < held_end && self.position < end
    }
}

#[derive(Debug, Default)]
struct MemFile {
    data: RwLock<Vec<u8>>,
    locks: Mutex<Vec<HeldLock>>,
}

#[derive(Debug, Default)]
struct PathCounters {
    opens: AtomicU64,
    closes: AtomicU64,
    syncs: AtomicU64,
    fail_next_read: Mutex<Option<io::ErrorKind>>,
    stall_writes: AtomicBool,
}

/// Handle on an in-memory file.
#[derive(Debug)]
pub struct MemChannel {
    id: u64,
    path: PathBuf,
    access: AccessMode,
    file: Arc<MemFile>,
    counters: Arc<PathCounters>,
    open: AtomicBool,
}

impl MemChannel {
    fn check_open(&self) -> ChannelResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ChannelError::closed(&self.path))
        }
    }

    fn check_writable(&self) -> ChannelResult<()> {
        if self.access.is_writable() {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "channel opened read-only").into())
        }
    }

    /// Invalidate this handle without counting an explicit close
    pub fn invalidate(&self) {
        self.open.store(false, Ordering::Release);
        self.release_locks();
    }

    fn release_locks(&self) {
        self.file.locks.lock().retain(|held| held.owner != self.id);
    }
}

impl DurableChannel for MemChannel {
    fn read_at(&self, buf: &mut [u8], position: u64) -> ChannelResult<usize> {
        self.check_open()?;
        if let Some(kind) = self.counters.fail_next_read.lock().take() {
            return Err(io::Error::new(kind, "scripted read failure").into());
        }
        let data = self.file.data.read();
        let start = match usize::try_from(position) {
            Ok(start) if start < data.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], position: u64) -> ChannelResult<usize> {
        self.check_open()?;
        self.check_writable()?;
        if self.counters.stall_writes.load(Ordering::Acquire) {
            return Ok(0);
        }
        let start = usize::try_from(position)
            .map_err(|_| ChannelError::InvalidArgument(format!("position {} too large", position)))?;
        let end = start + buf.len();
        let mut data = self.file.data.write();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> ChannelResult<u64> {
        self.check_open()?;
        Ok(self.file.data.read().len() as u64)
    }

    fn truncate(&self, size: u64) -> ChannelResult<()> {
        self.check_open()?;
        self.check_writable()?;
        let mut data = self.file.data.write();
        if let Ok(size) = usize::try_from(size) {
            if size < data.len() {
                data.truncate(size);
            }
        }
        Ok(())
    }

    fn sync(&self, _metadata: bool) -> ChannelResult<()> {
        self.check_open()?;
        self.counters.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn try_lock(&self, position: u64, len: u64, shared: bool) -> ChannelResult<bool> {
        self.check_open()?;
        let mut locks = self.file.locks.lock();
        let conflict = locks.iter().any(|held| {
            held.owner != self.id && held.overlaps(position, len) && !(shared && held.shared)
        });
        if conflict {
            return Ok(false);
        }
        locks.push(HeldLock {
            owner: self.id,
            position,
            len,
            shared,
        });
        Ok(true)
    }

    fn unlock(&self, position: u64, len: u64) -> ChannelResult<()> {
        self.check_open()?;
        self.file
            .locks
            .lock()
            .retain(|held| !(held.owner == self.id && held.position == position && held.len == len));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) -> ChannelResult<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.counters.closes.fetch_add(1, Ordering::Relaxed);
            self.release_locks();
        }
        Ok(())
    }
}

impl Drop for MemChannel {
    fn drop(&mut self) {
        self.release_locks();
    }
}

/// In-memory [`ChannelOpener`].
#[derive(Debug, Default)]
pub struct MemOpener {
    files: Mutex<HashMap<PathBuf, Arc<MemFile>>>,
    counters: Mutex<HashMap<PathBuf, Arc<PathCounters>>>,
    channels: Mutex<Vec<Weak<MemChannel>>>,
    denied: Mutex<HashSet<PathBuf>>,
    undeletable: Mutex<HashSet<PathBuf>>,
    next_id: AtomicU64,
}

impl MemOpener {
    /// Create an opener with no files
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the file at `path`
    pub fn put(&self, path: &Path, contents: Vec<u8>) {
        let file = MemFile {
            data: RwLock::new(contents),
            locks: Mutex::new(Vec::new()),
        };
        self.files.lock().insert(path.to_path_buf(), Arc::new(file));
    }

    /// Contents of the file at `path`
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).map(|f| f.data.read().clone())
    }

    /// Make every subsequent open of `path` fail with `PermissionDenied`
    pub fn deny(&self, path: &Path) {
        self.denied.lock().insert(path.to_path_buf());
    }

    /// Undo [`MemOpener::deny`]
    pub fn allow(&self, path: &Path) {
        self.denied.lock().remove(path);
    }

    /// Make every subsequent removal of `path` fail with `PermissionDenied`
    pub fn fail_remove(&self, path: &Path) {
        self.undeletable.lock().insert(path.to_path_buf());
    }

    /// Make writes on handles of `path` accept no bytes (`Ok(0)`) until
    /// called again with `false`
    pub fn stall_writes(&self, path: &Path, stalled: bool) {
        self.counters_for(path).stall_writes.store(stalled, Ordering::Release);
    }

    /// Make the next read on any handle of `path` fail with `kind`
    pub fn fail_next_read(&self, path: &Path, kind: io::ErrorKind) {
        *self.counters_for(path).fail_next_read.lock() = Some(kind);
    }

    /// Invalidate every open handle on `path`, as a cancelled caller's close
    /// would. Returns how many handles were invalidated.
    pub fn invalidate(&self, path: &Path) -> usize {
        let channels: Vec<Arc<MemChannel>> = self
            .channels
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|ch| ch.path == path && ch.is_open())
            .collect();
        for channel in &channels {
            channel.invalidate();
        }
        channels.len()
    }

    /// Number of handles on `path` currently open
    pub fn open_handles(&self, path: &Path) -> usize {
        self.channels
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|ch| ch.path == path && ch.is_open())
            .count()
    }

    /// Successful opens of `path`
    pub fn opens(&self, path: &Path) -> u64 {
        self.counters_for(path).opens.load(Ordering::Relaxed)
    }

    /// Explicit closes of handles on `path`
    pub fn closes(&self, path: &Path) -> u64 {
        self.counters_for(path).closes.load(Ordering::Relaxed)
    }

    /// Syncs issued on handles of `path`
    pub fn syncs(&self, path: &Path) -> u64 {
        self.counters_for(path).syncs.load(Ordering::Relaxed)
    }

    fn counters_for(&self, path: &Path) -> Arc<PathCounters> {
        Arc::clone(self.counters.lock().entry(path.to_path_buf()).or_default())
    }
}

impl ChannelOpener for MemOpener {
    fn open(&self, path: &Path, access: AccessMode) -> ChannelResult<Arc<dyn DurableChannel>> {
        if self.denied.lock().contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {}", path.display()),
            )
            .into());
        }
        let file = {
            let mut files = self.files.lock();
            if let Some(file) = files.get(path) {
                Arc::clone(file)
            } else if access == AccessMode::ReadOnly {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such file: {}", path.display()),
                )
                .into());
            } else {
                let file = Arc::new(MemFile::default());
                files.insert(path.to_path_buf(), Arc::clone(&file));
                file
            }
        };
        let counters = self.counters_for(path);
        counters.opens.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(MemChannel {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            path: path.to_path_buf(),
            access,
            file,
            counters,
            open: AtomicBool::new(true),
        });
        let mut channels = self.channels.lock();
        channels.retain(|w| w.strong_count() > 0);
        channels.push(Arc::downgrade(&channel));
        Ok(channel)
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().contains_key(path)
    }

    fn remove(&self, path: &Path) -> ChannelResult<()> {
        if self.undeletable.lock().contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("cannot remove: {}", path.display()),
            )
            .into());
        }
        self.files.lock().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_open_requires_file() {
        let opener = MemOpener::new();
        let err = opener.open(Path::new("/x"), AccessMode::ReadOnly).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
        assert!(opener.open(Path::new("/x"), AccessMode::ReadWrite).is_ok());
        assert!(opener.exists(Path::new("/x")));
    }

    #[test]
    fn test_invalidate_closes_all_handles_on_path() {
        let opener = MemOpener::new();
        let a = opener.open(Path::new("/x"), AccessMode::ReadWrite).unwrap();
        let b = opener.open(Path::new("/x"), AccessMode::ReadWrite).unwrap();
        let other = opener.open(Path::new("/y"), AccessMode::ReadWrite).unwrap();

        assert_eq!(opener.invalidate(Path::new("/x")), 2);
        assert!(!a.is_open());
        assert!(!b.is_open());
        assert!(other.is_open());
        assert!(a.size().unwrap_err().is_closed());
        // Invalidation is not an explicit close
        assert_eq!(opener.closes(Path::new("/x")), 0);
    }

    #[test]
    fn test_locks_conflict_between_handles() {
        let opener = MemOpener::new();
        let a = opener.open(Path::new("/l"), AccessMode::ReadWrite).unwrap();
        let b = opener.open(Path::new("/l"), AccessMode::ReadWrite).unwrap();

        assert!(a.try_lock(0, 10, true).unwrap());
        assert!(b.try_lock(5, 10, true).unwrap());
        assert!(!b.try_lock(0, 10, false).unwrap());
        assert!(b.try_lock(20, 10, false).unwrap());

        a.close().unwrap();
        b.unlock(5, 10).unwrap();
        assert!(b.try_lock(0, 10, false).unwrap());
    }

    #[test]
    fn test_deny_and_allow() {
        let opener = MemOpener::new();
        opener.deny(Path::new("/d"));
        let err = opener.open(Path::new("/d"), AccessMode::ReadWrite).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::PermissionDenied));
        opener.allow(Path::new("/d"));
        assert!(opener.open(Path::new("/d"), AccessMode::ReadWrite).is_ok());
    }

    #[test]
    fn test_fail_remove_keeps_file() {
        let opener = MemOpener::new();
        opener.put(Path::new("/r"), vec![1]);
        opener.fail_remove(Path::new("/r"));
        let err = opener.remove(Path::new("/r")).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::PermissionDenied));
        assert!(opener.exists(Path::new("/r")));
    }

    #[test]
    fn test_stalled_writes_accept_nothing() {
        let opener = MemOpener::new();
        let ch = opener.open(Path::new("/s"), AccessMode::ReadWrite).unwrap();
        opener.stall_writes(Path::new("/s"), true);
        assert_eq!(ch.write_at(&[1, 2], 0).unwrap(), 0);
        assert_eq!(ch.size().unwrap(), 0);
        opener.stall_writes(Path::new("/s"), false);
        assert_eq!(ch.write_at(&[1, 2], 0).unwrap(), 2);
    }
}
