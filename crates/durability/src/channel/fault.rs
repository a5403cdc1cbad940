//! Fault injection for mediated channels
//!
//! Test harnesses register a synthetic I/O failure together with the set of
//! operations it applies to. Until cleared, every operation whose tag is in
//! the set fails with that error before any real I/O happens. This makes the
//! reopen/retry paths testable without depending on real interrupt timing.
//!
//! Mediated channels only hold and consult an injector in test builds and
//! builds that enable the `fault-injection` feature; elsewhere the check
//! compiles to nothing.

use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use vellum_core::ChannelError;

/// Channel operation a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpTag {
    /// Opening (or reopening) the data channel
    Open,
    /// Closing the data channel
    Close,
    /// Positional read
    Read,
    /// Positional write
    Write,
    /// Durability flush
    Force,
    /// Size query
    Size,
    /// Truncation
    Truncate,
    /// Opening the lock channel
    Lock,
    /// Single-byte write that extends the volume file
    Extend,
}

impl OpTag {
    /// Get all tags
    pub fn all() -> Vec<OpTag> {
        vec![
            OpTag::Open,
            OpTag::Close,
            OpTag::Read,
            OpTag::Write,
            OpTag::Force,
            OpTag::Size,
            OpTag::Truncate,
            OpTag::Lock,
            OpTag::Extend,
        ]
    }

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

impl fmt::Display for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpTag::Open => "open",
            OpTag::Close => "close",
            OpTag::Read => "read",
            OpTag::Write => "write",
            OpTag::Force => "force",
            OpTag::Size => "size",
            OpTag::Truncate => "truncate",
            OpTag::Lock => "lock",
            OpTag::Extend => "extend",
        };
        f.write_str(name)
    }
}

/// Registered failure: error kind and message plus the tags it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedFault {
    kind: io::ErrorKind,
    message: String,
    tags: u16,
}

impl InjectedFault {
    /// Create a fault raising `io::Error::new(kind, message)` on `tags`
    pub fn new(kind: io::ErrorKind, message: impl Into<String>, tags: &[OpTag]) -> Self {
        InjectedFault {
            kind,
            message: message.into(),
            tags: tags.iter().fold(0, |acc, tag| acc | tag.bit()),
        }
    }

    /// Check if the fault applies to `tag`
    pub fn applies_to(&self, tag: OpTag) -> bool {
        self.tags & tag.bit() != 0
    }

    fn to_error(&self) -> ChannelError {
        ChannelError::Io(io::Error::new(self.kind, self.message.clone()))
    }
}

/// Holder for at most one registered fault.
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: AtomicBool,
    fault: RwLock<Option<InjectedFault>>,
}

impl FaultInjector {
    /// Create an injector with nothing registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fault`, replacing any previous one
    pub fn inject(&self, fault: InjectedFault) {
        *self.fault.write() = Some(fault);
        self.armed.store(true, Ordering::Release);
    }

    /// Remove the registered fault
    pub fn clear(&self) {
        self.armed.store(false, Ordering::Release);
        *self.fault.write() = None;
    }

    /// Currently registered fault
    pub fn current(&self) -> Option<InjectedFault> {
        self.fault.read().clone()
    }

    /// Fail with the registered error if it applies to `tag`.
    pub fn check(&self, tag: OpTag) -> Result<(), ChannelError> {
        if !self.armed.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.fault.read().as_ref() {
            Some(fault) if fault.applies_to(tag) => Err(fault.to_error()),
            _ => Ok(()),
        }
    }
}
