// Pause coordination.
//
// The session is paused whenever at least one reason bit is set in the
// `PauseMode` mask. Reasons are independent: a manual pause and a
// pause-on-join can overlap, and the session resumes only when both are
// cleared.
//
// Pause changes never take effect locally on the spot. The host turns each
// change into a `Opcode::PAUSE` command, so it is distributed like any other
// command and every participant flips its mask at the same tick. The
// coordinator here just applies those commands and reports transitions.
//
// The host also runs two policy checks at each distribution boundary:
// - ACTIVE_CLIENTS: a dedicated host with fewer active players than
//   `min_active_clients` pauses until enough are present.
// - JOIN: with `pause_on_join`, the session pauses while anyone is being
//   admitted.
// Both stand down entirely while the ERROR reason is set. Each check only
// asks for a change when the wanted state differs from the current bit.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Reasons the session is paused.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PauseMode: u8 {
        const MANUAL = 1 << 0;
        const JOIN = 1 << 1;
        const GAME_SCRIPT = 1 << 2;
        const ACTIVE_CLIENTS = 1 << 3;
        const LINK_GRAPH = 1 << 4;
        const ERROR = 1 << 5;
    }
}

impl PauseMode {
    fn label(reason: PauseMode) -> &'static str {
        match reason {
            PauseMode::MANUAL => "manual",
            PauseMode::JOIN => "connecting clients",
            PauseMode::GAME_SCRIPT => "game script",
            PauseMode::ACTIVE_CLIENTS => "not enough players",
            PauseMode::LINK_GRAPH => "link graph",
            PauseMode::ERROR => "error",
            _ => "unknown",
        }
    }
}

impl fmt::Display for PauseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.iter().map(PauseMode::label).collect();
        f.write_str(&labels.join(", "))
    }
}

/// A change of the pause mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PauseTransition {
    pub previous: PauseMode,
    pub current: PauseMode,
    /// The reason that changed.
    pub reason: PauseMode,
}

impl PauseTransition {
    pub fn message(&self) -> String {
        match (self.previous.is_empty(), self.current.is_empty()) {
            (true, false) => format!("paused ({})", self.current),
            (false, true) => format!("unpaused ({})", self.reason),
            _ => format!("still paused ({})", self.current),
        }
    }
}

/// Holds the applied pause mask.
#[derive(Clone, Debug, Default)]
pub struct PauseCoordinator {
    mode: PauseMode,
}

impl PauseCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> PauseMode {
        self.mode
    }

    pub fn is_paused(&self) -> bool {
        !self.mode.is_empty()
    }

    /// Set or clear one reason. Returns the transition, or `None` if the mask
    /// did not change.
    pub fn set_reason(&mut self, reason: PauseMode, active: bool) -> Option<PauseTransition> {
        let previous = self.mode;
        let mut current = previous;
        current.set(reason, active);
        if current == previous {
            return None;
        }
        self.mode = current;
        Some(PauseTransition {
            previous,
            current,
            reason,
        })
    }

    /// Replace the whole mask, e.g. from a loaded snapshot.
    pub fn restore(&mut self, mode: PauseMode) {
        self.mode = mode;
    }
}

/// Wanted value of ACTIVE_CLIENTS, if it should change.
pub fn check_min_active_clients(
    mode: PauseMode,
    dedicated: bool,
    min_active_clients: u32,
    active_players: usize,
) -> Option<bool> {
    if mode.contains(PauseMode::ERROR) || !dedicated {
        return None;
    }
    if min_active_clients == 0 && !mode.contains(PauseMode::ACTIVE_CLIENTS) {
        return None;
    }
    let wanted = active_players < min_active_clients as usize;
    (wanted != mode.contains(PauseMode::ACTIVE_CLIENTS)).then_some(wanted)
}

/// Wanted value of JOIN, if it should change.
pub fn check_pause_on_join(
    mode: PauseMode,
    pause_on_join: bool,
    has_joining: bool,
) -> Option<bool> {
    if mode.contains(PauseMode::ERROR) {
        return None;
    }
    if !pause_on_join && !mode.contains(PauseMode::JOIN) {
        return None;
    }
    (has_joining != mode.contains(PauseMode::JOIN)).then_some(has_joining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_notification_per_transition() {
        let mut pause = PauseCoordinator::new();
        let t = pause.set_reason(PauseMode::MANUAL, true).unwrap();
        assert_eq!(t.message(), "paused (manual)");
        assert!(pause.set_reason(PauseMode::MANUAL, true).is_none());

        let t = pause.set_reason(PauseMode::JOIN, true).unwrap();
        assert_eq!(t.message(), "still paused (manual, connecting clients)");

        pause.set_reason(PauseMode::MANUAL, false).unwrap();
        assert!(pause.is_paused());
        let t = pause.set_reason(PauseMode::JOIN, false).unwrap();
        assert_eq!(t.message(), "unpaused (connecting clients)");
        assert!(!pause.is_paused());
        assert!(pause.set_reason(PauseMode::JOIN, false).is_none());
    }

    #[test]
    fn min_active_only_on_dedicated_hosts() {
        assert_eq!(check_min_active_clients(PauseMode::empty(), false, 2, 0), None);
        assert_eq!(
            check_min_active_clients(PauseMode::empty(), true, 2, 1),
            Some(true)
        );
        assert_eq!(
            check_min_active_clients(PauseMode::ACTIVE_CLIENTS, true, 2, 1),
            None
        );
        assert_eq!(
            check_min_active_clients(PauseMode::ACTIVE_CLIENTS, true, 2, 2),
            Some(false)
        );
    }

    #[test]
    fn min_active_zero_still_clears_a_stale_bit() {
        assert_eq!(check_min_active_clients(PauseMode::empty(), true, 0, 0), None);
        assert_eq!(
            check_min_active_clients(PauseMode::ACTIVE_CLIENTS, true, 0, 0),
            Some(false)
        );
    }

    #[test]
    fn error_suspends_policy_checks() {
        let mode = PauseMode::ERROR;
        assert_eq!(check_min_active_clients(mode, true, 5, 0), None);
        assert_eq!(check_pause_on_join(mode, true, true), None);
    }

    #[test]
    fn pause_on_join_follows_joining_peers() {
        assert_eq!(check_pause_on_join(PauseMode::empty(), false, true), None);
        assert_eq!(check_pause_on_join(PauseMode::empty(), true, true), Some(true));
        assert_eq!(check_pause_on_join(PauseMode::JOIN, true, true), None);
        assert_eq!(check_pause_on_join(PauseMode::JOIN, true, false), Some(false));
        // Turning the setting off still lets a set bit clear.
        assert_eq!(check_pause_on_join(PauseMode::JOIN, false, false), Some(false));
    }
}
