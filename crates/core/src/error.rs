//! Error types for the Vellum storage engine
//!
//! Two layers of errors are defined here:
//!
//! - [`ChannelError`]: failures surfaced by a volume channel (the mediated
//!   file handle every page read and write goes through)
//! - [`VellumError`]: failures surfaced by engine entry points, including the
//!   engine-wide [`VellumError::Fatal`] raised once the fatal latch trips
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for channel operations
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Result type alias for engine operations
pub type VellumResult<T> = std::result::Result<T, VellumError>;

// ============================================================================
// Channel errors
// ============================================================================

/// Failure of a positional I/O operation on a volume channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is closed.
    ///
    /// Raised by a real channel that was invalidated, and by a mediated
    /// channel after its owner explicitly closed it.
    #[error("channel closed: {}", path.display())]
    Closed {
        /// File the channel was opened on
        path: PathBuf,
    },

    /// The calling operation's own cancellation was requested while the
    /// channel it was using got invalidated. Never retried.
    #[error("operation interrupted on {}", path.display())]
    Interrupted {
        /// File the channel was opened on
        path: PathBuf,
        /// The invalidation observed by the interrupted operation
        #[source]
        source: Box<ChannelError>,
    },

    /// Caller supplied an argument the channel cannot act on
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure reported by the underlying file (propagated verbatim)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Create a `Closed` error for the given path
    pub fn closed(path: impl Into<PathBuf>) -> Self {
        ChannelError::Closed { path: path.into() }
    }

    /// Check if this is a channel-closed condition
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelError::Closed { .. })
    }

    /// Check if the operation was interrupted by its own cancellation
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ChannelError::Interrupted { .. })
    }

    /// The underlying `io::ErrorKind`, if this wraps an I/O failure
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ChannelError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

// ============================================================================
// Fatal cause
// ============================================================================

/// Why an engine instance was shut down.
///
/// Captured once, when the fatal latch trips, and then reported verbatim by
/// every subsequent operation on that engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalCause {
    /// Description of the unrecoverable condition
    pub message: String,
    /// Rendered error that triggered the trip, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// When the latch tripped
    pub tripped_at: DateTime<Utc>,
}

impl FatalCause {
    /// Create a cause stamped with the current time
    pub fn new(message: impl Into<String>) -> Self {
        FatalCause {
            message: message.into(),
            source: None,
            tripped_at: Utc::now(),
        }
    }

    /// Attach the error that triggered the trip
    pub fn with_source(mut self, source: &dyn std::error::Error) -> Self {
        self.source = Some(source.to_string());
        self
    }
}

impl fmt::Display for FatalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{} ({})", self.message, source),
            None => f.write_str(&self.message),
        }
    }
}

// ============================================================================
// Engine errors
// ============================================================================

/// Error returned by engine entry points.
#[derive(Debug, Error)]
pub enum VellumError {
    /// The engine's fatal latch is tripped; no I/O was attempted
    #[error("fatal error: {0}")]
    Fatal(FatalCause),

    /// Volume channel failure
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// I/O failure outside of a volume channel (config file, markers)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Caller supplied invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No volume is registered under this name
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    /// A volume with this name is already open, or `create_only` found an
    /// existing file
    #[error("volume already exists: {0}")]
    VolumeExists(String),

    /// Another handle holds an incompatible lock on the volume's lock file
    #[error("volume in use: {0}")]
    VolumeInUse(String),

    /// Extending the volume would exceed its configured maximum
    #[error("volume {name} full: {requested} pages requested, maximum {maximum}")]
    VolumeFull {
        /// Volume name
        name: String,
        /// Page count that was requested
        requested: u64,
        /// Configured maximum page count
        maximum: u64,
    },

    /// Mutation attempted on a read-only volume
    #[error("volume is read-only: {0}")]
    ReadOnly(String),

    /// The engine was closed or crashed
    #[error("engine is shut down")]
    ShutDown,

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(String),
}

impl VellumError {
    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        VellumError::InvalidInput(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        VellumError::Config(msg.into())
    }

    /// Check if the engine's fatal latch caused this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, VellumError::Fatal(_))
    }

    /// The fatal cause, if this is a fatal error
    pub fn fatal_cause(&self) -> Option<&FatalCause> {
        match self {
            VellumError::Fatal(cause) => Some(cause),
            _ => None,
        }
    }

    /// Check if the operation was cancelled by its caller
    pub fn is_interrupted(&self) -> bool {
        matches!(self, VellumError::Channel(e) if e.is_interrupted())
    }

    /// Check if the volume channel was closed
    pub fn is_closed(&self) -> bool {
        matches!(self, VellumError::Channel(e) if e.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_channel_closed_display() {
        let err = ChannelError::closed("/data/vol.v01");
        let msg = err.to_string();
        assert!(msg.contains("channel closed"));
        assert!(msg.contains("vol.v01"));
        assert!(err.is_closed());
        assert!(!err.is_interrupted());
    }

    #[test]
    fn test_interrupted_keeps_invalidation_as_source() {
        let err = ChannelError::Interrupted {
            path: PathBuf::from("/data/vol.v01"),
            source: Box::new(ChannelError::closed("/data/vol.v01")),
        };
        assert!(err.is_interrupted());
        let source = err.source().expect("interrupted error must carry a source");
        assert!(source.to_string().contains("channel closed"));
    }

    #[test]
    fn test_io_kind() {
        let err: ChannelError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::PermissionDenied));
        assert_eq!(ChannelError::closed("x").io_kind(), None);
    }

    #[test]
    fn test_fatal_cause_display() {
        let cause = FatalCause::new("corruption detected at page 42");
        assert_eq!(cause.to_string(), "corruption detected at page 42");

        let io_err = io::Error::new(io::ErrorKind::InvalidData, "bad checksum");
        let cause = FatalCause::new("journal damaged").with_source(&io_err);
        assert_eq!(cause.to_string(), "journal damaged (bad checksum)");
    }

    #[test]
    fn test_vellum_error_classification() {
        let fatal = VellumError::Fatal(FatalCause::new("boom"));
        assert!(fatal.is_fatal());
        assert_eq!(fatal.fatal_cause().map(|c| c.message.as_str()), Some("boom"));
        assert!(fatal.to_string().contains("fatal error: boom"));

        let closed = VellumError::from(ChannelError::closed("v"));
        assert!(closed.is_closed());
        assert!(!closed.is_fatal());

        let interrupted = VellumError::from(ChannelError::Interrupted {
            path: PathBuf::from("v"),
            source: Box::new(ChannelError::closed("v")),
        });
        assert!(interrupted.is_interrupted());
    }

    #[test]
    fn test_volume_full_display() {
        let err = VellumError::VolumeFull {
            name: "main".to_string(),
            requested: 12,
            maximum: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("main"));
        assert!(msg.contains("12"));
        assert!(msg.contains("10"));
    }
}
