//! Volume specifications
//!
//! A [`VolumeSpec`] is the resolved description of one volume file: where it
//! lives, how it may be opened, and how it grows. Specs arrive already
//! structured (deserialized from `vellum.toml` or built in code); this module
//! only validates and normalizes them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default page size in bytes
pub const DEFAULT_PAGE_SIZE: u32 = 8192;

/// How a volume file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Reads only; the file must exist
    ReadOnly,
    /// Reads and writes; the file is created when missing
    ReadWrite,
}

impl AccessMode {
    /// Check if writes are permitted
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessMode::ReadWrite)
    }
}

/// Resolved description of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Path of the volume file (relative paths resolve against the engine
    /// directory)
    pub path: PathBuf,
    /// Name the volume is registered under instead of its path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Volume id
    #[serde(default)]
    pub id: u64,
    /// Open without write access
    #[serde(default)]
    pub read_only: bool,
    /// Create the file if it does not exist
    #[serde(default)]
    pub create: bool,
    /// Create the file; fail if it already exists
    #[serde(default)]
    pub create_only: bool,
    /// Remove the file when the engine closes
    #[serde(default)]
    pub transient: bool,
    /// Page size in bytes
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Pages allocated when the volume is created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_pages: Option<u64>,
    /// Pages added each time the volume grows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_pages: Option<u64>,
    /// Upper bound on the volume's page count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_pages: Option<u64>,
    /// Initial size in bytes (used when `initial_pages` is unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_size: Option<u64>,
    /// Extension size in bytes (used when `extension_pages` is unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_size: Option<u64>,
    /// Maximum size in bytes (used when `maximum_pages` is unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_size: Option<u64>,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// Volume specification validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VolumeSpecError {
    /// Empty path
    #[error("volume path is empty")]
    EmptyPath,

    /// More than one of read_only / create / create_only
    #[error("{0}: read_only, create and create_only are mutually exclusive")]
    ConflictingOpenFlags(String),

    /// read_only together with transient
    #[error("{0}: read_only and transient are mutually exclusive")]
    ReadOnlyTransient(String),

    /// Page size of zero
    #[error("{0}: page size must be positive")]
    ZeroPageSize(String),

    /// Initial page count exceeds the maximum
    #[error("{name}: initial pages {initial} exceed maximum pages {maximum}")]
    InitialExceedsMaximum {
        /// Volume name
        name: String,
        /// Initial page count
        initial: u64,
        /// Maximum page count
        maximum: u64,
    },
}

impl VolumeSpec {
    /// Create a read-write spec for `path` that creates the file if missing
    pub fn new(path: impl Into<PathBuf>) -> Self {
        VolumeSpec {
            path: path.into(),
            alias: None,
            id: 0,
            read_only: false,
            create: true,
            create_only: false,
            transient: false,
            page_size: DEFAULT_PAGE_SIZE,
            initial_pages: None,
            extension_pages: None,
            maximum_pages: None,
            initial_size: None,
            extension_size: None,
            maximum_size: None,
        }
    }

    /// Create a read-only spec for an existing file
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        VolumeSpec {
            read_only: true,
            create: false,
            ..Self::new(path)
        }
    }

    /// Set the alias
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Set the page size
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the initial page count
    pub fn with_initial_pages(mut self, pages: u64) -> Self {
        self.initial_pages = Some(pages);
        self
    }

    /// Set the maximum page count
    pub fn with_maximum_pages(mut self, pages: u64) -> Self {
        self.maximum_pages = Some(pages);
        self
    }

    /// Require the file to not exist yet
    pub fn create_only(mut self) -> Self {
        self.create = false;
        self.create_only = true;
        self
    }

    /// Mark the volume transient
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Access mode implied by the flags
    pub fn access_mode(&self) -> AccessMode {
        if self.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        }
    }

    /// Name the volume is registered under: alias if set, else the path
    pub fn describe(&self) -> String {
        match &self.alias {
            Some(alias) if !alias.is_empty() => alias.clone(),
            _ => self.path.display().to_string(),
        }
    }

    /// Path resolved against `base` when relative
    pub fn resolve_path(&self, base: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            base.join(&self.path)
        }
    }

    /// Validate flag combinations and sizes.
    pub fn validate(&self) -> Result<(), VolumeSpecError> {
        if self.path.as_os_str().is_empty() {
            return Err(VolumeSpecError::EmptyPath);
        }
        let flags = [self.read_only, self.create, self.create_only]
            .iter()
            .filter(|f| **f)
            .count();
        if flags > 1 {
            return Err(VolumeSpecError::ConflictingOpenFlags(self.describe()));
        }
        if self.read_only && self.transient {
            return Err(VolumeSpecError::ReadOnlyTransient(self.describe()));
        }
        if self.page_size == 0 {
            return Err(VolumeSpecError::ZeroPageSize(self.describe()));
        }
        if let (Some(initial), Some(maximum)) = (self.initial_pages(), self.maximum_pages()) {
            if initial > maximum {
                return Err(VolumeSpecError::InitialExceedsMaximum {
                    name: self.describe(),
                    initial,
                    maximum,
                });
            }
        }
        Ok(())
    }

    /// Initial page count, derived from `initial_size` when unset
    pub fn initial_pages(&self) -> Option<u64> {
        self.initial_pages
            .or_else(|| self.bytes_to_pages(self.initial_size))
    }

    /// Extension page count, derived from `extension_size` when unset
    pub fn extension_pages(&self) -> Option<u64> {
        self.extension_pages
            .or_else(|| self.bytes_to_pages(self.extension_size))
    }

    /// Maximum page count, derived from `maximum_size` when unset
    pub fn maximum_pages(&self) -> Option<u64> {
        self.maximum_pages
            .or_else(|| self.bytes_to_pages(self.maximum_size))
    }

    fn bytes_to_pages(&self, bytes: Option<u64>) -> Option<u64> {
        let page_size = u64::from(self.page_size);
        match bytes {
            Some(b) if b > 0 && page_size > 0 => Some(b / page_size + u64::from(b % page_size != 0)),
            _ => None,
        }
    }
}
