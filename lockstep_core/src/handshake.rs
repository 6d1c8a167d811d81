// Per-peer connection handshake.
//
// Lifecycle of one peer as seen by the host:
//
//   Inactive → Authorizing → MapTransfer → Active → Closed
//
// `Closed` is reachable from every state (violation, timeout, quit, kick).
// Inside `Authorizing`, an `AuthStep` tracks how far admission has got:
//
//   AwaitingJoin → [AwaitingSessionPassword] → [AwaitingGroupPassword] → Authorized
//
// The bracketed steps are skipped when the session or the requested group
// has no password. A peer in `Authorized` asks for the session snapshot,
// which moves it to `MapTransfer`; reporting the snapshot loaded makes it
// `Active`.
//
// Only `Authorizing` counts as joining (for the pause-on-join policy) and
// only `Active` counts as active (for command delivery and the
// minimum-active-clients policy). A peer in `MapTransfer` receives commands
// into its deferred queue instead.
//
// Every transition stamps `entered_tick`; `timeout()` compares the time spent
// in the current step against the configured limits. Rejoining after a close
// is always a fresh handshake on a fresh registry slot.

use lockstep_protocol::types::{
    ErrorCode, GroupSelector, MAX_CLIENT_NAME_LENGTH, PROTOCOL_REVISION,
};
use thiserror::Error;

/// Coarse connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Inactive,
    Authorizing(AuthStep),
    MapTransfer,
    Active,
    Closed,
}

/// Progress through admission while `Authorizing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStep {
    AwaitingJoin,
    AwaitingSessionPassword,
    AwaitingGroupPassword,
    Authorized,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// A handshake message arrived in a state that does not accept it.
    #[error("unexpected {message} in state {state:?}")]
    Unexpected {
        message: &'static str,
        state: HandshakeState,
    },

    /// Admission was refused.
    #[error("rejected: {0}")]
    Rejected(ErrorCode),
}

/// How long (in host ticks) a peer may stay in each waiting state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutLimits {
    pub password: u64,
    pub join: u64,
    pub download: u64,
}

/// Handshake state of one peer plus the tick it entered that state.
#[derive(Clone, Debug)]
pub struct Handshake {
    state: HandshakeState,
    entered_tick: u64,
}

impl Handshake {
    pub fn new(now: u64) -> Self {
        Handshake {
            state: HandshakeState::Inactive,
            entered_tick: now,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_joining(&self) -> bool {
        matches!(self.state, HandshakeState::Authorizing(_))
    }

    pub fn is_active(&self) -> bool {
        self.state == HandshakeState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state == HandshakeState::Closed
    }

    fn enter(&mut self, state: HandshakeState, now: u64) {
        self.state = state;
        self.entered_tick = now;
    }

    fn unexpected(&self, message: &'static str) -> HandshakeError {
        HandshakeError::Unexpected {
            message,
            state: self.state,
        }
    }

    /// The transport is up; wait for `Join`.
    pub fn begin(&mut self, now: u64) -> Result<(), HandshakeError> {
        match self.state {
            HandshakeState::Inactive => {
                self.enter(HandshakeState::Authorizing(AuthStep::AwaitingJoin), now);
                Ok(())
            }
            _ => Err(self.unexpected("connection start")),
        }
    }

    /// A valid `Join` arrived. Returns the step now awaited.
    pub fn on_join(
        &mut self,
        session_password_required: bool,
        group_password_required: bool,
        now: u64,
    ) -> Result<AuthStep, HandshakeError> {
        if self.state != HandshakeState::Authorizing(AuthStep::AwaitingJoin) {
            return Err(self.unexpected("join"));
        }
        let next = if session_password_required {
            AuthStep::AwaitingSessionPassword
        } else if group_password_required {
            AuthStep::AwaitingGroupPassword
        } else {
            AuthStep::Authorized
        };
        self.enter(HandshakeState::Authorizing(next), now);
        Ok(next)
    }

    /// The session password was checked.
    pub fn on_session_password(
        &mut self,
        accepted: bool,
        group_password_required: bool,
        now: u64,
    ) -> Result<AuthStep, HandshakeError> {
        if self.state != HandshakeState::Authorizing(AuthStep::AwaitingSessionPassword) {
            return Err(self.unexpected("session password"));
        }
        if !accepted {
            return Err(HandshakeError::Rejected(ErrorCode::WrongPassword));
        }
        let next = if group_password_required {
            AuthStep::AwaitingGroupPassword
        } else {
            AuthStep::Authorized
        };
        self.enter(HandshakeState::Authorizing(next), now);
        Ok(next)
    }

    /// The group password hash was checked.
    pub fn on_group_password(&mut self, accepted: bool, now: u64) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::Authorizing(AuthStep::AwaitingGroupPassword) {
            return Err(self.unexpected("group password"));
        }
        if !accepted {
            return Err(HandshakeError::Rejected(ErrorCode::WrongPassword));
        }
        self.enter(HandshakeState::Authorizing(AuthStep::Authorized), now);
        Ok(())
    }

    pub fn on_request_snapshot(&mut self, now: u64) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::Authorizing(AuthStep::Authorized) {
            return Err(match self.state {
                HandshakeState::Authorizing(_) => {
                    HandshakeError::Rejected(ErrorCode::NotAuthorized)
                }
                _ => self.unexpected("snapshot request"),
            });
        }
        self.enter(HandshakeState::MapTransfer, now);
        Ok(())
    }

    pub fn on_snapshot_loaded(&mut self, now: u64) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::MapTransfer {
            return Err(self.unexpected("snapshot loaded"));
        }
        self.enter(HandshakeState::Active, now);
        Ok(())
    }

    pub fn close(&mut self, now: u64) {
        self.enter(HandshakeState::Closed, now);
    }

    /// The reason to drop this peer if it has waited too long in its current
    /// state. Active peers are policed by lag instead.
    pub fn timeout(&self, now: u64, limits: &TimeoutLimits) -> Option<ErrorCode> {
        let waited = now.saturating_sub(self.entered_tick);
        let (limit, code) = match self.state {
            HandshakeState::Authorizing(
                AuthStep::AwaitingSessionPassword | AuthStep::AwaitingGroupPassword,
            ) => (limits.password, ErrorCode::TimeoutPassword),
            HandshakeState::Inactive | HandshakeState::Authorizing(_) => {
                (limits.join, ErrorCode::TimeoutJoin)
            }
            HandshakeState::MapTransfer => (limits.download, ErrorCode::TimeoutMap),
            HandshakeState::Active | HandshakeState::Closed => return None,
        };
        (waited > limit).then_some(code)
    }
}

/// Validate the fields of a `Join`. Returns the trimmed name and the group
/// the peer will actually get (an out-of-range group spectates).
pub fn validate_join(
    protocol_revision: u32,
    client_name: &str,
    group: GroupSelector,
    max_groups: u8,
) -> Result<(String, GroupSelector), HandshakeError> {
    if protocol_revision != PROTOCOL_REVISION {
        return Err(HandshakeError::Rejected(ErrorCode::WrongRevision));
    }
    let name = client_name.trim();
    if name.is_empty() || name.len() > MAX_CLIENT_NAME_LENGTH {
        return Err(HandshakeError::Rejected(ErrorCode::InvalidClientName));
    }
    let group = match group {
        GroupSelector::Group(index) if index >= max_groups => GroupSelector::Spectator,
        other => other,
    };
    Ok((name.to_string(), group))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: TimeoutLimits = TimeoutLimits {
        password: 100,
        join: 50,
        download: 200,
    };

    #[test]
    fn open_session_goes_straight_to_authorized() {
        let mut hs = Handshake::new(0);
        hs.begin(0).unwrap();
        assert!(hs.is_joining());
        assert_eq!(hs.on_join(false, false, 1).unwrap(), AuthStep::Authorized);
        hs.on_request_snapshot(2).unwrap();
        assert_eq!(hs.state(), HandshakeState::MapTransfer);
        assert!(!hs.is_joining());
        hs.on_snapshot_loaded(3).unwrap();
        assert!(hs.is_active());
    }

    #[test]
    fn both_passwords_in_order() {
        let mut hs = Handshake::new(0);
        hs.begin(0).unwrap();
        assert_eq!(
            hs.on_join(true, true, 0).unwrap(),
            AuthStep::AwaitingSessionPassword
        );
        assert_eq!(
            hs.on_session_password(true, true, 0).unwrap(),
            AuthStep::AwaitingGroupPassword
        );
        hs.on_group_password(true, 0).unwrap();
        assert_eq!(
            hs.state(),
            HandshakeState::Authorizing(AuthStep::Authorized)
        );
    }

    #[test]
    fn wrong_password_is_rejected() {
        let mut hs = Handshake::new(0);
        hs.begin(0).unwrap();
        hs.on_join(true, false, 0).unwrap();
        assert_eq!(
            hs.on_session_password(false, false, 0),
            Err(HandshakeError::Rejected(ErrorCode::WrongPassword))
        );
    }

    #[test]
    fn snapshot_before_authorization_is_not_authorized() {
        let mut hs = Handshake::new(0);
        hs.begin(0).unwrap();
        hs.on_join(true, false, 0).unwrap();
        assert_eq!(
            hs.on_request_snapshot(0),
            Err(HandshakeError::Rejected(ErrorCode::NotAuthorized))
        );
    }

    #[test]
    fn out_of_order_messages_are_unexpected() {
        let mut hs = Handshake::new(0);
        hs.begin(0).unwrap();
        hs.on_join(false, false, 0).unwrap();
        assert!(matches!(
            hs.on_join(false, false, 0),
            Err(HandshakeError::Unexpected { message: "join", .. })
        ));
        assert!(matches!(
            hs.on_snapshot_loaded(0),
            Err(HandshakeError::Unexpected { .. })
        ));
    }

    #[test]
    fn close_from_any_state() {
        let mut hs = Handshake::new(0);
        hs.close(5);
        assert!(hs.is_closed());
        assert_eq!(hs.timeout(10_000, &LIMITS), None);
    }

    #[test]
    fn timeouts_follow_the_waiting_state() {
        let mut hs = Handshake::new(0);
        hs.begin(0).unwrap();
        assert_eq!(hs.timeout(50, &LIMITS), None);
        assert_eq!(hs.timeout(51, &LIMITS), Some(ErrorCode::TimeoutJoin));

        hs.on_join(true, false, 10).unwrap();
        assert_eq!(hs.timeout(110, &LIMITS), None);
        assert_eq!(hs.timeout(111, &LIMITS), Some(ErrorCode::TimeoutPassword));

        hs.on_session_password(true, false, 20).unwrap();
        hs.on_request_snapshot(20).unwrap();
        assert_eq!(hs.timeout(221, &LIMITS), Some(ErrorCode::TimeoutMap));

        hs.on_snapshot_loaded(30).unwrap();
        assert_eq!(hs.timeout(100_000, &LIMITS), None);
    }

    #[test]
    fn join_validation() {
        assert_eq!(
            validate_join(PROTOCOL_REVISION + 1, "a", GroupSelector::Group(0), 15),
            Err(HandshakeError::Rejected(ErrorCode::WrongRevision))
        );
        assert_eq!(
            validate_join(PROTOCOL_REVISION, "   ", GroupSelector::Group(0), 15),
            Err(HandshakeError::Rejected(ErrorCode::InvalidClientName))
        );
        assert_eq!(
            validate_join(PROTOCOL_REVISION, &"n".repeat(33), GroupSelector::Group(0), 15),
            Err(HandshakeError::Rejected(ErrorCode::InvalidClientName))
        );
        assert_eq!(
            validate_join(PROTOCOL_REVISION, "  Mira ", GroupSelector::Group(7), 4),
            Ok(("Mira".to_string(), GroupSelector::Spectator))
        );
        assert_eq!(
            validate_join(PROTOCOL_REVISION, "Mira", GroupSelector::Group(3), 4),
            Ok(("Mira".to_string(), GroupSelector::Group(3)))
        );
    }
}
