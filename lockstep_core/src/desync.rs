// Desync detection.
//
// Every `sync_freq` ticks the host sends a `Sync{tick, digest}` record with
// the state digest it computed after executing `tick`. A peer compares that
// record against its own digest for the same tick:
//
// - Record for a tick still ahead: stored as an expectation and checked when
//   the peer reaches that tick.
// - Record for a tick already executed (the peer ran ahead on a lagging
//   link): checked against a bounded history of the last
//   `HISTORY_LENGTH` local digests. If the tick has fallen out of the history
//   the record is dropped with a debug log and never retried.
//
// A mismatch is fatal and reported as `SessionError::DesyncDetected`.
//
// The host additionally logs its digest at the start of each in-game day to
// the `desync` target, once per day, so two logs can be diffed to find
// where participants diverged. A paused session does not advance its date,
// so nothing is repeated while paused.

use std::collections::{BTreeMap, VecDeque};

use lockstep_protocol::types::{SimDate, StateDigest};
use tracing::{debug, info};

use crate::error::SessionError;

/// Number of local digests kept for checking late records.
pub const HISTORY_LENGTH: usize = 64;

/// Whether two digests describe the same state.
pub fn compare(expected: &StateDigest, actual: &StateDigest) -> bool {
    expected == actual
}

/// `Ok` if the digests match, `DesyncDetected` otherwise.
pub fn verify(tick: u64, expected: &StateDigest, actual: &StateDigest) -> Result<(), SessionError> {
    if compare(expected, actual) {
        Ok(())
    } else {
        debug!(
            target: "desync",
            tick,
            expected = %expected,
            actual = %actual,
            "state digest mismatch"
        );
        Err(SessionError::DesyncDetected { tick })
    }
}

#[derive(Debug, Default)]
pub struct DesyncDetector {
    expectations: BTreeMap<u64, StateDigest>,
    history: VecDeque<(u64, StateDigest)>,
    last_logged_day: Option<u32>,
}

impl DesyncDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `Sync` record arrived. `executed_tick` is the last tick run locally.
    pub fn expect(
        &mut self,
        tick: u64,
        digest: StateDigest,
        executed_tick: u64,
    ) -> Result<(), SessionError> {
        if tick > executed_tick {
            self.expectations.insert(tick, digest);
            return Ok(());
        }
        match self.history.iter().find(|(t, _)| *t == tick) {
            Some((_, local)) => verify(tick, &digest, local),
            None => {
                debug!(
                    target: "desync",
                    tick,
                    executed_tick,
                    "sync record older than local history; dropped"
                );
                Ok(())
            }
        }
    }

    /// The local simulation produced `digest` after executing `tick`.
    pub fn record_local(&mut self, tick: u64, digest: StateDigest) -> Result<(), SessionError> {
        if self.history.len() == HISTORY_LENGTH {
            self.history.pop_front();
        }
        self.history.push_back((tick, digest));

        // Anything at or before `tick` is now checkable or unreachable.
        let later = self.expectations.split_off(&(tick + 1));
        let due = std::mem::replace(&mut self.expectations, later);
        match due.get(&tick) {
            Some(expected) => verify(tick, expected, &digest),
            None => Ok(()),
        }
    }

    pub fn pending_expectations(&self) -> usize {
        self.expectations.len()
    }

    /// Host: log the digest at a day start. Returns whether anything was
    /// logged.
    pub fn log_day_start(&mut self, tick: u64, date: SimDate, digest: &StateDigest) -> bool {
        if !date.is_day_start() || self.last_logged_day == Some(date.day) {
            return false;
        }
        self.last_logged_day = Some(date.day);
        info!(
            target: "desync",
            tick,
            "sync: {}; {}",
            date,
            digest
        );
        true
    }
}
