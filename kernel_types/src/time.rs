//! Guest time abstractions

use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};

/// A point in guest time.
///
/// Opaque nanosecond count since an arbitrary epoch. The scheduling core
/// never reads host wall-clock time for guest-visible decisions; deadlines
/// are computed against the time source the embedder provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instant {
    nanos: u64,
}

impl Instant {
    /// Creates an instant from nanoseconds
    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Returns nanoseconds since epoch
    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Returns the duration since another instant
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_nanos(self.nanos.saturating_sub(earlier.nanos))
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, duration: Duration) -> Self::Output {
        Instant::from_nanos(self.nanos.saturating_add(duration.as_nanos()))
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, duration: Duration) -> Self::Output {
        Instant::from_nanos(self.nanos.saturating_sub(duration.as_nanos()))
    }
}

/// A span of guest time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    /// Creates a duration from nanoseconds
    pub fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Creates a duration from milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis.saturating_mul(1_000_000),
        }
    }

    /// Returns the duration in nanoseconds
    pub fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Returns the equivalent host duration
    pub fn to_std(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.nanos)
    }
}

/// A wait bound as the guest expresses it.
///
/// Guest syscalls pass timeouts as signed nanosecond counts: zero means
/// "poll, never block", negative means "wait forever". The distinction
/// matters to the wait protocols — a `Poll` wait must return `Timeout`
/// without the caller ever entering the paused state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeout {
    /// Never block; report `Timeout` if nothing is ready
    Poll,
    /// Block for at most this long
    After(Duration),
    /// Block until signaled
    Never,
}

impl Timeout {
    /// Decodes the guest's raw signed nanosecond timeout argument.
    pub fn from_nanos(raw: i64) -> Self {
        if raw == 0 {
            Timeout::Poll
        } else if raw < 0 {
            Timeout::Never
        } else {
            Timeout::After(Duration::from_nanos(raw as u64))
        }
    }

    /// True for the zero timeout
    pub fn is_poll(&self) -> bool {
        matches!(self, Timeout::Poll)
    }
}
