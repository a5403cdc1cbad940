//! Channels backed by real files
//!
//! [`FileChannel`] wraps a `std::fs::File` and performs positional I/O with
//! the platform's `FileExt`. Advisory locks are taken with `fs2` on the whole
//! file; the requested range is recorded by the caller but the OS lock always
//! covers the entire lock file.

use super::{ChannelOpener, DurableChannel};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vellum_core::{AccessMode, ChannelError, ChannelResult};

/// Real file handle.
///
/// The `File` lives in an `RwLock<Option<_>>` slot: I/O holds the read side,
/// `close()` takes the write side and drops the handle. Any operation that
/// finds the slot empty reports `ChannelError::Closed`.
#[derive(Debug)]
pub struct FileChannel {
    path: PathBuf,
    file: RwLock<Option<File>>,
}

impl FileChannel {
    /// Open `path` with the given access mode
    pub fn open(path: &Path, access: AccessMode) -> io::Result<Self> {
        let file = match access {
            AccessMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            AccessMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?,
        };
        Ok(FileChannel {
            path: path.to_path_buf(),
            file: RwLock::new(Some(file)),
        })
    }

    /// Path this channel was opened on
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> ChannelResult<T> {
        let guard = self.file.read();
        match guard.as_ref() {
            Some(file) => f(file).map_err(ChannelError::from),
            None => Err(ChannelError::closed(&self.path)),
        }
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], position: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, position)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], position: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, position)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], position: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, position)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], position: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, position)
}

impl DurableChannel for FileChannel {
    fn read_at(&self, buf: &mut [u8], position: u64) -> ChannelResult<usize> {
        self.with_file(|file| loop {
            match pread(file, buf, position) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        })
    }

    fn write_at(&self, buf: &[u8], position: u64) -> ChannelResult<usize> {
        self.with_file(|file| loop {
            match pwrite(file, buf, position) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        })
    }

    fn size(&self) -> ChannelResult<u64> {
        self.with_file(|file| Ok(file.metadata()?.len()))
    }

    fn truncate(&self, size: u64) -> ChannelResult<()> {
        self.with_file(|file| {
            if size < file.metadata()?.len() {
                file.set_len(size)?;
            }
            Ok(())
        })
    }

    fn sync(&self, metadata: bool) -> ChannelResult<()> {
        self.with_file(|file| {
            if metadata {
                file.sync_all()
            } else {
                file.sync_data()
            }
        })
    }

    fn try_lock(&self, _position: u64, _len: u64, shared: bool) -> ChannelResult<bool> {
        self.with_file(|file| {
            let result = if shared {
                fs2::FileExt::try_lock_shared(file)
            } else {
                fs2::FileExt::try_lock_exclusive(file)
            };
            match result {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn unlock(&self, _position: u64, _len: u64) -> ChannelResult<()> {
        self.with_file(<File as fs2::FileExt>::unlock)
    }

    fn is_open(&self) -> bool {
        self.file.read().is_some()
    }

    fn close(&self) -> ChannelResult<()> {
        // Dropping the File closes the descriptor and releases its locks
        self.file.write().take();
        Ok(())
    }
}

/// Opens [`FileChannel`]s on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileOpener;

impl ChannelOpener for FileOpener {
    fn open(&self, path: &Path, access: AccessMode) -> ChannelResult<Arc<dyn DurableChannel>> {
        Ok(Arc::new(FileChannel::open(path, access)?))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> ChannelResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
