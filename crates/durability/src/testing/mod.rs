//! Testing utilities for volume channels
//!
//! - **MemOpener**: in-memory files whose open handles can be invalidated on
//!   demand, reproducing the collateral close a cancelled caller causes
//!
//! # Example
//!
//! ```ignore
//! use vellum_durability::testing::MemOpener;
//!
//! let opener = Arc::new(MemOpener::new());
//! let channel = MediatedChannel::open("/vol", AccessMode::ReadWrite, opener.clone())?;
//! opener.invalidate(Path::new("/vol"));
//! // next operation on `channel` reopens and retries
//! ```

mod mem;

pub use mem::{MemChannel, MemOpener};
