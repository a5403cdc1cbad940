//! Fatal error latch
//!
//! Once an engine detects an inconsistency it cannot repair, the latch trips
//! and stays tripped for the life of the engine instance. Every public entry
//! point calls [`FatalLatch::check_ok`] before touching a volume, so a trip
//! stops new I/O at the door while I/O already past the check finishes or
//! fails on its own.
//!
//! The latch records exactly one [`FatalCause`]: the first trip wins and
//! later trips report the original cause back to their callers.

use once_cell::sync::OnceCell;
use tracing::{error, warn};
use vellum_core::{FatalCause, VellumError, VellumResult};

/// One-way latch guarding an engine instance.
///
/// Reads are a single acquire load; no lock is taken on the check path.
#[derive(Debug, Default)]
pub struct FatalLatch {
    cause: OnceCell<FatalCause>,
}

impl FatalLatch {
    /// Create an untripped latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the latch. Returns the cause the latch holds afterwards, which
    /// is `cause` only for the first tripper.
    pub fn trip(&self, cause: FatalCause) -> FatalCause {
        self.trip_with(cause, |_| Ok(()))
    }

    /// Trip the latch and, if this call is the one that tripped it, run
    /// `emergency` with the recorded cause.
    ///
    /// A failing emergency step is logged and otherwise ignored; the latch
    /// is tripped either way.
    pub fn trip_with<F>(&self, cause: FatalCause, emergency: F) -> FatalCause
    where
        F: FnOnce(&FatalCause) -> VellumResult<()>,
    {
        let mut tripped_here = false;
        let recorded = self.cause.get_or_init(|| {
            tripped_here = true;
            cause
        });

        if tripped_here {
            error!(
                target: "vellum::latch",
                cause = %recorded,
                tripped_at = %recorded.tripped_at,
                "fatal error, engine instance shut down"
            );
            if let Err(e) = emergency(recorded) {
                warn!(target: "vellum::latch", error = %e, "emergency step failed");
            }
        }
        recorded.clone()
    }

    /// Check if the latch has tripped
    pub fn is_tripped(&self) -> bool {
        self.cause.get().is_some()
    }

    /// Fail with `VellumError::Fatal` once the latch has tripped.
    pub fn check_ok(&self) -> VellumResult<()> {
        match self.cause.get() {
            Some(cause) => Err(VellumError::Fatal(cause.clone())),
            None => Ok(()),
        }
    }

    /// Recorded cause, if tripped
    pub fn cause(&self) -> Option<&FatalCause> {
        self.cause.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_new_latch_is_ok() {
        let latch = FatalLatch::new();
        assert!(!latch.is_tripped());
        assert!(latch.check_ok().is_ok());
        assert!(latch.cause().is_none());
    }

    #[test]
    fn test_trip_is_one_way() {
        let latch = FatalLatch::new();
        let recorded = latch.trip(FatalCause::new("torn page"));
        assert_eq!(recorded.message, "torn page");
        assert!(latch.is_tripped());

        for _ in 0..3 {
            let err = latch.check_ok().unwrap_err();
            assert_eq!(err.fatal_cause().unwrap().message, "torn page");
        }
    }

    #[test]
    fn test_first_cause_wins() {
        let latch = FatalLatch::new();
        latch.trip(FatalCause::new("first"));
        let recorded = latch.trip(FatalCause::new("second"));
        assert_eq!(recorded.message, "first");
        assert_eq!(latch.cause().unwrap().message, "first");
    }

    #[test]
    fn test_emergency_runs_only_for_first_tripper() {
        let latch = FatalLatch::new();
        let runs = AtomicUsize::new(0);
        latch.trip_with(FatalCause::new("a"), |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        latch.trip_with(FatalCause::new("b"), |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emergency_failure_still_trips() {
        let latch = FatalLatch::new();
        let recorded = latch.trip_with(FatalCause::new("bad checksum"), |_| {
            Err(VellumError::invalid_input("flush refused"))
        });
        assert_eq!(recorded.message, "bad checksum");
        assert!(latch.check_ok().unwrap_err().is_fatal());
    }
}
