//! Adaptive polling cadence.
//!
//! Every poll nudges a source's `interval` (minutes) through one
//! [`Cadence`] step; [`schedule`] then clamps it and sets the next
//! `due_poll`. Feeds that change often drift towards hourly polling, quiet
//! or failing feeds towards daily.

use crate::storage::Source;

/// Shortest allowed interval (1 hour)
pub const MIN_INTERVAL: i64 = 60;

/// Longest allowed interval (1 day)
pub const MAX_INTERVAL: i64 = 24 * 60;

/// Interval an expired JSON feed is forced to before clamping
pub const EXPIRED_INTERVAL: i64 = 3 * 24 * 60;

/// One adjustment to a source's interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Add minutes
    Backoff(i64),
    /// Integer halving
    Halve,
    /// Overwrite
    Force(i64),
}

impl Cadence {
    /// Server errors, missing feeds, fetch failures and failed imports
    pub const FAILURE: Cadence = Cadence::Backoff(120);
    pub const REDIRECT_FAILED: Cadence = Cadence::Backoff(60);
    pub const UNCHANGED: Cadence = Cadence::Backoff(20);
    pub const NOT_MODIFIED: Cadence = Cadence::Backoff(10);
    /// New posts arrived, or a proxy failed and the next attempt should come soon
    pub const SOON: Cadence = Cadence::Halve;
    pub const EXPIRED: Cadence = Cadence::Force(EXPIRED_INTERVAL);

    pub fn apply(self, interval: i64) -> i64 {
        match self {
            Cadence::Backoff(minutes) => interval.saturating_add(minutes),
            Cadence::Halve => interval / 2,
            Cadence::Force(minutes) => minutes,
        }
    }
}

/// Apply one cadence step to `source` in place.
pub fn adjust(source: &mut Source, cadence: Cadence) {
    source.interval = cadence.apply(source.interval);
}

pub fn clamp(interval: i64) -> i64 {
    interval.clamp(MIN_INTERVAL, MAX_INTERVAL)
}

/// Clamp the interval and set `due_poll` that many minutes after `now`.
pub fn schedule(source: &mut Source, now: i64) {
    source.interval = clamp(source.interval);
    source.due_poll = now + source.interval * 60;
}
