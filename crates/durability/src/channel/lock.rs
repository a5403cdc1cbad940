//! Advisory lock guard returned by `MediatedChannel::try_lock`

use super::DurableChannel;
use std::sync::Arc;
use tracing::debug;

/// Held advisory lock on a volume's lock file.
///
/// Released when dropped or via [`ChannelLock::release`]. A lock granted
/// without a lock file (shared request on a volume whose lock file could not
/// be created) is *unbacked*: it records the request but holds nothing.
#[derive(Debug)]
pub struct ChannelLock {
    channel: Option<Arc<dyn DurableChannel>>,
    position: u64,
    len: u64,
    shared: bool,
}

impl ChannelLock {
    pub(crate) fn backed(
        channel: Arc<dyn DurableChannel>,
        position: u64,
        len: u64,
        shared: bool,
    ) -> Self {
        ChannelLock {
            channel: Some(channel),
            position,
            len,
            shared,
        }
    }

    pub(crate) fn unbacked(position: u64, len: u64, shared: bool) -> Self {
        ChannelLock {
            channel: None,
            position,
            len,
            shared,
        }
    }

    /// Start of the locked range
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Length of the locked range
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Check if the locked range is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if this is a shared lock
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Check if a real file lock backs this guard
    pub fn is_backed(&self) -> bool {
        self.channel.is_some()
    }

    /// Release the lock now
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(channel) = self.channel.take() {
            // A closed lock channel has already dropped the OS lock
            if let Err(e) = channel.unlock(self.position, self.len) {
                debug!(target: "vellum::channel", error = %e, "lock release skipped");
            }
        }
    }
}

impl Drop for ChannelLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
