//! Open volumes
//!
//! A [`Volume`] is one volume file opened by an engine: its spec, its
//! mediated channel and the file lock held for as long as it stays open.
//! Every public operation checks the engine's fatal latch first and the
//! engine's shut-down flag second, so a tripped engine always reports the
//! fatal cause.

use crate::engine::EngineState;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use vellum_core::{VellumError, VellumResult, VolumeSpec};
use vellum_durability::{CancelToken, ChannelLock, MediatedChannel};

/// One open volume.
#[derive(Debug)]
pub struct Volume {
    name: String,
    path: PathBuf,
    spec: VolumeSpec,
    channel: MediatedChannel,
    file_lock: Mutex<Option<ChannelLock>>,
    state: Arc<EngineState>,
}

impl Volume {
    pub(crate) fn new(
        spec: VolumeSpec,
        path: PathBuf,
        channel: MediatedChannel,
        file_lock: ChannelLock,
        state: Arc<EngineState>,
    ) -> Self {
        Volume {
            name: spec.describe(),
            path,
            spec,
            channel,
            file_lock: Mutex::new(Some(file_lock)),
            state,
        }
    }

    /// Name the volume is registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved path of the volume file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spec the volume was opened with
    pub fn spec(&self) -> &VolumeSpec {
        &self.spec
    }

    /// Page size in bytes
    pub fn page_size(&self) -> u64 {
        u64::from(self.spec.page_size)
    }

    /// Check if the volume was opened read-only
    pub fn is_read_only(&self) -> bool {
        self.spec.read_only
    }

    /// Check if the volume file is removed on close
    pub fn is_transient(&self) -> bool {
        self.spec.transient
    }

    /// Number of times the underlying channel was reopened after an
    /// invalidation
    pub fn reopen_count(&self) -> u64 {
        self.channel.reopen_count()
    }

    /// Mediated channel underneath this volume. Not exposed outside the
    /// crate: calls on it bypass the engine's fatal latch.
    #[cfg(test)]
    pub(crate) fn channel(&self) -> &MediatedChannel {
        &self.channel
    }

    // ========================================================================
    // Byte I/O
    // ========================================================================

    /// Read into `buf` at byte `position`; returns bytes read.
    pub fn read_at(&self, buf: &mut [u8], position: u64, cancel: &CancelToken) -> VellumResult<usize> {
        self.guard()?;
        Ok(self.channel.read(buf, position, cancel)?)
    }

    /// Write `buf` at byte `position`; returns bytes written.
    pub fn write_at(&self, buf: &[u8], position: u64, cancel: &CancelToken) -> VellumResult<usize> {
        self.guard()?;
        self.require_writable()?;
        let end = position
            .checked_add(buf.len() as u64)
            .ok_or_else(|| VellumError::invalid_input("write extends past u64::MAX"))?;
        self.check_capacity(end / self.page_size() + u64::from(end % self.page_size() != 0))?;
        Ok(self.channel.write(buf, position, cancel)?)
    }

    // ========================================================================
    // Page I/O
    // ========================================================================

    /// Read page `page` into `buf`, which must be exactly one page long.
    ///
    /// A page that lies wholly or partly beyond the end of the file fails
    /// with `UnexpectedEof`.
    pub fn read_page(&self, page: u64, buf: &mut [u8], cancel: &CancelToken) -> VellumResult<()> {
        self.guard()?;
        self.check_page_buffer(buf.len())?;
        let base = self.page_offset(page)?;
        let mut done = 0;
        while done < buf.len() {
            let n = self.channel.read(&mut buf[done..], base + done as u64, cancel)?;
            if n == 0 {
                return Err(VellumError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("page {} of volume {} is beyond end of file", page, self.name),
                )));
            }
            done += n;
        }
        Ok(())
    }

    /// Write `buf`, exactly one page long, as page `page`.
    pub fn write_page(&self, page: u64, buf: &[u8], cancel: &CancelToken) -> VellumResult<()> {
        self.guard()?;
        self.require_writable()?;
        self.check_page_buffer(buf.len())?;
        self.check_capacity(page.saturating_add(1))?;
        let base = self.page_offset(page)?;
        let mut done = 0;
        while done < buf.len() {
            let n = self.channel.write(&buf[done..], base + done as u64, cancel)?;
            if n == 0 {
                return Err(VellumError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("page {} of volume {} accepted no bytes", page, self.name),
                )));
            }
            done += n;
        }
        Ok(())
    }

    // ========================================================================
    // Sizing
    // ========================================================================

    /// File size in bytes
    pub fn size(&self, cancel: &CancelToken) -> VellumResult<u64> {
        self.guard()?;
        Ok(self.channel.size(cancel)?)
    }

    /// Number of whole pages in the file
    pub fn page_count(&self, cancel: &CancelToken) -> VellumResult<u64> {
        Ok(self.size(cancel)? / self.page_size())
    }

    /// Grow the file to hold `pages` pages by writing its last byte.
    ///
    /// No effect when the file already holds that many pages.
    pub fn extend_to_pages(&self, pages: u64, cancel: &CancelToken) -> VellumResult<()> {
        self.guard()?;
        self.require_writable()?;
        self.check_capacity(pages)?;
        let current = self.channel.size(cancel)? / self.page_size();
        if pages <= current {
            return Ok(());
        }
        let last_byte = self.page_offset(pages)? - 1;
        self.channel.write(&[0], last_byte, cancel)?;
        debug!(
            target: "vellum::engine",
            volume = %self.name,
            from_pages = current,
            to_pages = pages,
            "volume extended"
        );
        Ok(())
    }

    /// Grow the file by the spec's extension page count (one page when
    /// unset), stopping at the maximum. Returns the new page count.
    pub fn grow(&self, cancel: &CancelToken) -> VellumResult<u64> {
        self.guard()?;
        let current = self.page_count(cancel)?;
        let mut target = current.saturating_add(self.spec.extension_pages().unwrap_or(1).max(1));
        if let Some(maximum) = self.spec.maximum_pages() {
            if current < maximum {
                target = target.min(maximum);
            }
        }
        self.extend_to_pages(target, cancel)?;
        Ok(target)
    }

    /// Shrink the file to `pages` pages.
    pub fn truncate(&self, pages: u64, cancel: &CancelToken) -> VellumResult<()> {
        self.guard()?;
        self.require_writable()?;
        let new_size = self.page_offset(pages)?;
        Ok(self.channel.truncate(new_size, cancel)?)
    }

    /// Force written data and file metadata to stable storage.
    pub fn force(&self, cancel: &CancelToken) -> VellumResult<()> {
        self.guard()?;
        Ok(self.channel.force(true, cancel)?)
    }

    /// Try to take an advisory lock on the volume's lock file.
    ///
    /// The OS lock covers the whole lock file; the range is advisory
    /// bookkeeping only.
    pub fn try_lock(&self, position: u64, len: u64, shared: bool) -> VellumResult<Option<ChannelLock>> {
        self.guard()?;
        Ok(self.channel.try_lock(position, len, shared)?)
    }

    // ========================================================================
    // Engine-internal lifecycle
    // ========================================================================

    /// Force without consulting the latch. Used by the emergency step,
    /// which runs after the latch has already tripped.
    pub(crate) fn emergency_force(&self) -> VellumResult<()> {
        Ok(self.channel.force(true, &CancelToken::new())?)
    }

    /// Optionally force, then release the file lock and close the channel.
    pub(crate) fn close(&self, flush: bool) -> VellumResult<()> {
        let mut result = Ok(());
        if flush {
            if let Err(e) = self.channel.force(true, &CancelToken::new()) {
                result = Err(VellumError::from(e));
            }
        }
        if let Some(lock) = self.file_lock.lock().take() {
            lock.release();
        }
        if let Err(e) = self.channel.close() {
            if result.is_ok() {
                result = Err(VellumError::from(e));
            }
        }
        result
    }

    /// Drop every handle the way a killed process would.
    pub(crate) fn abandon(&self) {
        self.channel.abandon();
        self.file_lock.lock().take();
    }

    fn guard(&self) -> VellumResult<()> {
        self.state.check()
    }

    fn require_writable(&self) -> VellumResult<()> {
        if self.spec.read_only {
            Err(VellumError::ReadOnly(self.name.clone()))
        } else {
            Ok(())
        }
    }

    fn check_page_buffer(&self, len: usize) -> VellumResult<()> {
        if len as u64 == self.page_size() {
            Ok(())
        } else {
            Err(VellumError::invalid_input(format!(
                "page buffer is {} bytes, volume {} uses {}-byte pages",
                len,
                self.name,
                self.page_size()
            )))
        }
    }

    fn check_capacity(&self, pages: u64) -> VellumResult<()> {
        match self.spec.maximum_pages() {
            Some(maximum) if pages > maximum => Err(VellumError::VolumeFull {
                name: self.name.clone(),
                requested: pages,
                maximum,
            }),
            _ => Ok(()),
        }
    }

    fn page_offset(&self, page: u64) -> VellumResult<u64> {
        page.checked_mul(self.page_size()).ok_or_else(|| {
            VellumError::invalid_input(format!("page {} is out of range for volume {}", page, self.name))
        })
    }
}
