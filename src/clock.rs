// ===============================
// src/clock.rs
// ===============================
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tracing::{debug, info};

use crate::domain::now_ms;
use crate::error::{VenueError, VenueResult};
use crate::metrics::CLOCK_SKEW_MS;

/// Millisecond clock aligned to a venue's server time.
#[derive(Debug)]
pub struct Clock {
    venue: String,
    skew_ms: AtomicI64,
    initialized: AtomicBool,
    jitter_ms: i64,
    requires_sync: bool,
}

impl Clock {
    pub fn new(venue: impl Into<String>, jitter_ms: i64, requires_sync: bool) -> Self {
        Self {
            venue: venue.into(),
            skew_ms: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
            jitter_ms,
            requires_sync,
        }
    }

    /// Venue time in ms. Fails only for signed venues that were never synced.
    pub fn now_ms(&self) -> VenueResult<i64> {
        if self.requires_sync && !self.is_initialized() {
            return Err(VenueError::ClockNotInitialized);
        }
        Ok(now_ms() + self.skew_ms.load(Ordering::Relaxed))
    }

    /// Venue time without the readiness check (logging, watchdogs).
    pub fn now_ms_lossy(&self) -> i64 {
        now_ms() + self.skew_ms.load(Ordering::Relaxed)
    }

    pub fn skew_ms(&self) -> i64 {
        self.skew_ms.load(Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Fold in one server-time measurement taken between `sent_ms` and
    /// `recv_ms` (local). Returns true when the stored skew changed.
    pub fn update_from_server(&self, server_ms: i64, sent_ms: i64, recv_ms: i64) -> bool {
        let midpoint = sent_ms + (recv_ms - sent_ms).max(0) / 2;
        let measured = server_ms - midpoint;
        let current = self.skew_ms.load(Ordering::Relaxed);

        if self.is_initialized() && (measured - current).abs() <= self.jitter_ms {
            debug!(venue = %self.venue, measured, current, "clock skew within jitter, kept");
            return false;
        }
        self.skew_ms.store(measured, Ordering::Relaxed);
        let first = !self.initialized.swap(true, Ordering::AcqRel);
        CLOCK_SKEW_MS.with_label_values(&[&self.venue]).set(measured);
        info!(venue = %self.venue, skew_ms = measured, first, "clock skew updated");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_clock_refuses_before_first_sync() {
        let c = Clock::new("t", 250, true);
        assert_eq!(c.now_ms(), Err(VenueError::ClockNotInitialized));
        assert!(c.update_from_server(10_000, 1_000, 1_200));
        assert!(c.now_ms().is_ok());
        assert_eq!(c.skew_ms(), 10_000 - 1_100);
    }

    #[test]
    fn unsigned_clock_works_unsynced() {
        let c = Clock::new("t", 250, false);
        assert!(c.now_ms().is_ok());
        assert_eq!(c.skew_ms(), 0);
    }

    #[test]
    fn jitter_suppresses_small_updates() {
        let c = Clock::new("t", 250, true);
        assert!(c.update_from_server(5_000, 0, 0));
        assert!(!c.update_from_server(5_200, 0, 0));
        assert_eq!(c.skew_ms(), 5_000);
        assert!(c.update_from_server(5_400, 0, 0));
        assert_eq!(c.skew_ms(), 5_400);
        // same measurement twice is idempotent
        assert!(!c.update_from_server(5_400, 0, 0));
    }
}
