// Core ID and value types for the lockstep protocol.
//
// These are small value types shared by `message.rs` and by the session
// engine in `lockstep_core`. They describe who issued something
// (`ParticipantId`), which faction a participant plays as (`GroupSelector`),
// where the simulation clock is (`SimDate`), what a state digest looks like
// (`StateDigest`), and why a connection ended (`ErrorCode`).
//
// `ParticipantId` is a generation-checked arena handle: the slot index is
// reused after a participant leaves, but the generation is bumped, so a stale
// handle held by anyone never aliases the newcomer in that slot. Slot 0 with
// generation 0 is reserved for the host itself.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Revision of this wire protocol. Peers with a different revision are
/// rejected during the handshake.
pub const PROTOCOL_REVISION: u32 = 1;

/// Number of playable groups (factions) a session can have.
pub const MAX_GROUPS: u8 = 15;

/// Maximum length of a participant name in bytes.
pub const MAX_CLIENT_NAME_LENGTH: usize = 32;

/// Default TCP port of a session host.
pub const DEFAULT_PORT: u16 = 3979;

/// Generation-checked handle of a participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId {
    pub slot: u16,
    pub generation: u16,
}

impl ParticipantId {
    /// The host's own participant handle.
    pub const HOST: ParticipantId = ParticipantId {
        slot: 0,
        generation: 0,
    };

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "host")
        } else {
            write!(f, "#{}.{}", self.slot, self.generation)
        }
    }
}

/// Identifies a completion callback on the issuing participant. The host
/// carries it along with the command but only the issuer acts on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackId(pub u8);

/// Command opcode. Opcodes below `FIRST_SIMULATION` are interpreted by the
/// session engine itself; everything else is opaque and goes straight to the
/// simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Opcode(pub u16);

impl Opcode {
    /// Set or clear one pause reason.
    pub const PAUSE: Opcode = Opcode(0);
    /// First opcode handed to the simulation untouched.
    pub const FIRST_SIMULATION: Opcode = Opcode(16);

    pub fn is_session_control(self) -> bool {
        self < Self::FIRST_SIMULATION
    }
}

/// The group a participant plays as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupSelector {
    /// Zero-based group index.
    Group(u8),
    /// Watches without controlling any group.
    Spectator,
}

impl GroupSelector {
    /// Convert a one-based, user-entered group number. `0` and anything above
    /// `MAX_GROUPS` select spectating.
    pub fn from_user_value(value: u8) -> Self {
        if value == 0 || value > MAX_GROUPS {
            GroupSelector::Spectator
        } else {
            GroupSelector::Group(value - 1)
        }
    }

    pub fn is_spectator(self) -> bool {
        matches!(self, GroupSelector::Spectator)
    }

    pub fn index(self) -> Option<u8> {
        match self {
            GroupSelector::Group(index) => Some(index),
            GroupSelector::Spectator => None,
        }
    }
}

/// In-simulation calendar position. A "day" is the unit the desync log is
/// keyed on; `fraction` and `sub_tick` both being zero marks a day start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SimDate {
    pub day: u32,
    pub fraction: u16,
    pub sub_tick: u8,
}

impl SimDate {
    pub fn is_day_start(&self) -> bool {
        self.fraction == 0 && self.sub_tick == 0
    }
}

impl fmt::Display for SimDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "date{{{:08x}; {:02x}; {:02x}}}",
            self.day, self.fraction, self.sub_tick
        )
    }
}

/// Deterministic fingerprint of simulation state after a tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateDigest {
    /// The simulation's random generator state words.
    pub seeds: [u32; 2],
    /// Running checksum over the simulation state.
    pub checksum: u64,
}

impl fmt::Display for StateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}; {:08x}; {:016x}",
            self.seeds[0], self.seeds[1], self.checksum
        )
    }
}

/// Reason a connection was refused or ended. Every fatal condition maps to
/// exactly one of these, and the peer is told which one before the socket
/// closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    General,
    Desync,
    SnapshotFailed,
    ConnectionLost,
    IllegalPacket,
    NotAuthorized,
    NotExpected,
    WrongRevision,
    NameInUse,
    WrongPassword,
    GroupMismatch,
    Kicked,
    ServerFull,
    TooManyCommands,
    TimeoutPassword,
    TimeoutComputer,
    TimeoutMap,
    TimeoutJoin,
    InvalidClientName,
}

impl ErrorCode {
    /// User-facing description of the reason.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::General => "general error",
            ErrorCode::Desync => "desync error",
            ErrorCode::SnapshotFailed => "could not load the session state",
            ErrorCode::ConnectionLost => "connection lost",
            ErrorCode::IllegalPacket => "protocol error",
            ErrorCode::NotAuthorized => "not authorized",
            ErrorCode::NotExpected => "received invalid or unexpected packet",
            ErrorCode::WrongRevision => "wrong revision",
            ErrorCode::NameInUse => "name already in use",
            ErrorCode::WrongPassword => "wrong password",
            ErrorCode::GroupMismatch => "wrong group in command",
            ErrorCode::Kicked => "kicked by server",
            ErrorCode::ServerFull => "server full",
            ErrorCode::TooManyCommands => "was sending too many commands",
            ErrorCode::TimeoutPassword => "did not receive password in time",
            ErrorCode::TimeoutComputer => "general timeout",
            ErrorCode::TimeoutMap => "downloading the session state took too long",
            ErrorCode::TimeoutJoin => "processing the session state took too long",
            ErrorCode::InvalidClientName => "invalid client name",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_group_values_are_one_based() {
        assert_eq!(GroupSelector::from_user_value(1), GroupSelector::Group(0));
        assert_eq!(
            GroupSelector::from_user_value(MAX_GROUPS),
            GroupSelector::Group(MAX_GROUPS - 1)
        );
        assert_eq!(GroupSelector::from_user_value(0), GroupSelector::Spectator);
        assert_eq!(
            GroupSelector::from_user_value(MAX_GROUPS + 1),
            GroupSelector::Spectator
        );
    }

    #[test]
    fn pause_opcode_is_session_control() {
        assert!(Opcode::PAUSE.is_session_control());
        assert!(!Opcode::FIRST_SIMULATION.is_session_control());
        assert!(!Opcode(300).is_session_control());
    }

    #[test]
    fn host_id_displays_as_host() {
        assert_eq!(ParticipantId::HOST.to_string(), "host");
        let peer = ParticipantId {
            slot: 3,
            generation: 2,
        };
        assert_eq!(peer.to_string(), "#3.2");
        assert!(!peer.is_host());
    }

    #[test]
    fn day_start_requires_zero_fraction_and_sub_tick() {
        let mut date = SimDate {
            day: 10,
            fraction: 0,
            sub_tick: 0,
        };
        assert!(date.is_day_start());
        date.sub_tick = 1;
        assert!(!date.is_day_start());
        date.sub_tick = 0;
        date.fraction = 5;
        assert!(!date.is_day_start());
    }
}
