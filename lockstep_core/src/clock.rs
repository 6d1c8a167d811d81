// Frame clock: the tick counters that keep every participant in lockstep.
//
// `SyncState` is owned by the session (host or client) and mutated only
// through `FrameClock`. Three counters matter:
//
// - `tick`: the last tick this participant has executed.
// - `max_tick`: the last tick anyone may execute. On a peer this comes from
//   the host's `Frame` messages; on the host it moves forward at each
//   distribution boundary.
// - `server_tick`: the host's `tick` as last heard by a peer (equal to
//   `tick` on the host).
//
// Host, once per tick:
//
//   if tick >= max_tick           → boundary: commands get target tick + frame_freq
//   tick += 1
//   if tick > previous max_tick   → max_tick = that target; announce a Frame
//
// So with tick 100 = max 100 and `frame_freq` 4, commands queued so far are
// tagged 104, the tick becomes 101, and peers learn they may run to 104.
// Every command is tagged with a tick no participant has executed yet, and
// it is sent before the `Frame` that allows executing that tick.
//
// Peer: if the host is ahead (`server_tick > tick`) run as many steps as it
// takes to catch up; otherwise run one step if `tick < max_tick`.
//
// Lag of a peer, in ticks, is the distance between the host tick at its last
// acknowledgement and the tick it acknowledged, plus however long it has
// gone silent beyond `grace + frame_freq`.

use lockstep_protocol::types::{SimDate, StateDigest};

/// Per-session tick counters and the latest state digest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    pub tick: u64,
    pub server_tick: u64,
    pub max_tick: u64,
    /// Last tick a `Sync` record was produced (host) or checked (peer).
    pub last_sync_tick: u64,
    pub digest: StateDigest,
    pub date: SimDate,
}

/// What happened when the host advanced one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostAdvance {
    /// Set when the tick started at a boundary: the target tick for commands
    /// distributed at this boundary.
    pub distribute_at: Option<u64>,
    /// Whether peers must be told the new `max_tick`.
    pub send_frame: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameClock {
    frame_freq: u64,
    grace: u64,
}

impl FrameClock {
    /// `frame_freq` must be at least 1; `grace` is the number of silent ticks
    /// tolerated before lag starts accruing.
    pub fn new(frame_freq: u64, grace: u64) -> Self {
        FrameClock {
            frame_freq: frame_freq.max(1),
            grace,
        }
    }

    pub fn frame_freq(&self) -> u64 {
        self.frame_freq
    }

    /// Whether the host is at a distribution boundary.
    pub fn at_boundary(&self, state: &SyncState) -> bool {
        state.tick >= state.max_tick
    }

    /// Target tick for commands distributed at the current boundary.
    pub fn next_max(&self, state: &SyncState) -> u64 {
        state.tick + self.frame_freq
    }

    /// Advance the host's counters by one tick. The caller distributes
    /// commands between `at_boundary` and this call, tagging them with
    /// `next_max`.
    pub fn advance_host(&self, state: &mut SyncState) -> HostAdvance {
        let distribute_at = self.at_boundary(state).then(|| self.next_max(state));
        let previous_max = state.max_tick;
        let next_max = self.next_max(state);

        state.tick += 1;
        state.server_tick = state.tick;

        let send_frame = state.tick > previous_max;
        if send_frame {
            state.max_tick = next_max;
        }
        HostAdvance {
            distribute_at,
            send_frame,
        }
    }

    /// A `Frame` arrived from the host.
    pub fn on_frame(&self, state: &mut SyncState, server_tick: u64, max_tick: u64) {
        state.server_tick = state.server_tick.max(server_tick);
        state.max_tick = state.max_tick.max(max_tick);
    }

    /// How many steps a peer should run now.
    pub fn steps_due(&self, state: &SyncState) -> u64 {
        if state.server_tick > state.tick {
            state.server_tick.min(state.max_tick).saturating_sub(state.tick)
        } else if state.tick < state.max_tick {
            1
        } else {
            0
        }
    }

    /// Advance a peer's tick by one.
    pub fn advance_peer(&self, state: &mut SyncState) {
        state.tick += 1;
    }

    /// Lag of a peer whose last acknowledgement reported `acked_tick` and
    /// arrived at host tick `acked_at`, as of host tick `now`.
    pub fn calculate_lag(&self, acked_tick: u64, acked_at: u64, now: u64) -> u64 {
        let mut lag = acked_at.saturating_sub(acked_tick);
        let deadline = acked_at + self.grace + self.frame_freq;
        if now > deadline {
            lag += now - deadline;
        }
        lag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_at(tick: u64, max_tick: u64) -> SyncState {
        SyncState {
            tick,
            server_tick: tick,
            max_tick,
            ..Default::default()
        }
    }

    #[test]
    fn boundary_extends_max_by_frame_freq() {
        let clock = FrameClock::new(4, 74);
        let mut state = host_at(100, 100);
        let advance = clock.advance_host(&mut state);
        assert_eq!(advance.distribute_at, Some(104));
        assert!(advance.send_frame);
        assert_eq!(state.tick, 101);
        assert_eq!(state.max_tick, 104);
    }

    #[test]
    fn ticks_between_boundaries_are_quiet() {
        let clock = FrameClock::new(4, 74);
        let mut state = host_at(100, 100);
        clock.advance_host(&mut state);
        for expected_tick in 102..=104 {
            let advance = clock.advance_host(&mut state);
            assert_eq!(advance.distribute_at, None);
            assert!(!advance.send_frame);
            assert_eq!(state.tick, expected_tick);
        }
        let advance = clock.advance_host(&mut state);
        assert_eq!(advance.distribute_at, Some(108));
        assert_eq!(state.max_tick, 108);
    }

    #[test]
    fn distributed_targets_are_never_already_executed() {
        let clock = FrameClock::new(3, 74);
        let mut state = SyncState::default();
        for _ in 0..50 {
            let before = state.tick;
            let advance = clock.advance_host(&mut state);
            if let Some(target) = advance.distribute_at {
                assert!(target > before);
                assert!(target >= state.tick);
                assert!(target <= state.max_tick);
            }
        }
    }

    #[test]
    fn every_tick_is_a_frame_at_freq_one() {
        let clock = FrameClock::new(1, 74);
        let mut state = host_at(10, 10);
        for _ in 0..5 {
            let advance = clock.advance_host(&mut state);
            assert_eq!(advance.distribute_at, Some(state.tick));
            assert!(advance.send_frame);
            assert_eq!(state.max_tick, state.tick);
        }
    }

    #[test]
    fn peer_catches_up_then_single_steps() {
        let clock = FrameClock::new(4, 74);
        let mut state = SyncState::default();
        clock.on_frame(&mut state, 10, 12);
        assert_eq!(clock.steps_due(&state), 10);
        for _ in 0..10 {
            clock.advance_peer(&mut state);
        }
        assert_eq!(clock.steps_due(&state), 1);
        clock.advance_peer(&mut state);
        clock.advance_peer(&mut state);
        assert_eq!(clock.steps_due(&state), 0);
    }

    #[test]
    fn stale_frames_do_not_rewind() {
        let clock = FrameClock::new(1, 74);
        let mut state = SyncState::default();
        clock.on_frame(&mut state, 20, 21);
        clock.on_frame(&mut state, 15, 16);
        assert_eq!((state.server_tick, state.max_tick), (20, 21));
    }

    #[test]
    fn lag_grows_while_stalled_and_resets_on_ack() {
        let clock = FrameClock::new(1, 74);
        // Acked tick 90 when the host was at 95.
        let mut previous = clock.calculate_lag(90, 95, 95);
        assert_eq!(previous, 5);
        for now in 96..400 {
            let lag = clock.calculate_lag(90, 95, now);
            assert!(lag >= previous);
            previous = lag;
        }
        assert_eq!(previous, 5 + (399 - (95 + 74 + 1)));
        assert_eq!(clock.calculate_lag(398, 400, 400), 2);
    }
}
