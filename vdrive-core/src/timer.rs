// vim: tw=80
//! Debounce timers
//!
//! Each timer doubles as the flag recording that its condition was observed:
//! a running timer means "the condition is present and has been for
//! `elapsed()`".

use std::time::Duration;

use tokio::time::Instant;

use crate::types::*;

/// Time elapsed since `start`, saturating at zero.
pub fn elapsed_since(start: Instant) -> Duration {
    Instant::now().saturating_duration_since(start)
}

/// A monotonic start stamp that may be unset.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Timer(Option<Instant>);

impl Timer {
    /// Stamp the current time, whether or not the timer was running.
    pub fn start(&mut self) {
        self.0 = Some(Instant::now());
    }

    /// Stop the timer and forget its start time.
    pub fn stop(&mut self) {
        self.0 = None;
    }

    /// Re-stamp a running timer.  It's an error if the timer is stopped.
    pub fn restart(&mut self) -> Result<()> {
        if self.0.is_none() {
            return Err(Error::FlagNotSet);
        }
        self.start();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.0.is_some()
    }

    pub fn started_at(&self) -> Result<Instant> {
        self.0.ok_or(Error::FlagNotSet)
    }

    pub fn elapsed(&self) -> Result<Duration> {
        self.started_at().map(elapsed_since)
    }

    /// Has the timer been running for at least `d`?
    pub fn expired(&self, d: Duration) -> Result<bool> {
        self.elapsed().map(|e| e >= d)
    }
}

/// The three debounce timers owned by a virtual drive
#[derive(Clone, Copy, Debug, Default)]
pub struct Timers {
    /// Started when a downstream drive first went missing
    pub need_replacement_drive: Timer,
    /// Started when a missing drive was seen to have definitively faulted
    pub drive_fault: Timer,
    /// Started when a drive was first seen to be End-Of-Life
    pub need_proactive_copy: Timer,
}

// LCOV_EXCL_STOP
