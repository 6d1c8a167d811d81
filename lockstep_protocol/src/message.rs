// Protocol messages exchanged between the session host and its peers.
//
// Two enums define the full vocabulary:
// - `ClientMessage`: sent by a peer (or a server-list query) to the host.
// - `ServerMessage`: sent by the host to a peer.
//
// The handshake runs Join → (NeedSessionPassword → SessionPassword) →
// (NeedGroupPassword → GroupPassword) → Welcome → RequestSnapshot → Snapshot →
// SnapshotLoaded. After that the host streams `Command`, `Frame` and `Sync`
// messages, and the peer answers with periodic `Ack`s.
//
// Command payloads are opaque bytes; only the pause opcode is interpreted by
// the session engine (see `lockstep_core::commands`).

use serde::{Deserialize, Serialize};

use crate::types::{
    CallbackId, ErrorCode, GroupSelector, Opcode, ParticipantId, StateDigest,
};

/// Messages sent by a peer to the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Start the handshake.
    Join {
        protocol_revision: u32,
        client_name: String,
        group: GroupSelector,
    },
    /// Answer to `NeedSessionPassword`.
    SessionPassword { password: String },
    /// Answer to `NeedGroupPassword`; the password hashed with the session
    /// salt and seed.
    GroupPassword { hash: String },
    /// Ask for the current session state after `Welcome`.
    RequestSnapshot,
    /// The snapshot was loaded; the peer is ready to run ticks.
    SnapshotLoaded,
    /// A command issued by this peer.
    Command {
        opcode: Opcode,
        payload: Vec<u8>,
        callback: Option<CallbackId>,
    },
    /// The peer has executed up to `tick`.
    Ack { tick: u64 },
    /// The peer hit a fatal error and is leaving.
    Error { code: ErrorCode },
    /// The peer is leaving gracefully.
    Quit,
    /// Server-list query; the host answers with `ServerInfo` and hangs up.
    ServerInfoQuery,
}

/// Messages sent by the host to a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// The session is password protected.
    NeedSessionPassword,
    /// The requested group is password protected.
    NeedGroupPassword { session_seed: u32, salt: String },
    /// Handshake accepted.
    Welcome {
        participant_id: ParticipantId,
        session_seed: u32,
        salt: String,
    },
    /// Session state for a joining peer: the simulation state after `tick`
    /// and the pause reasons in force.
    Snapshot {
        tick: u64,
        pause_mode: u8,
        data: Vec<u8>,
    },
    /// Everyone currently in the session, sent once a peer becomes active.
    Roster { participants: Vec<ParticipantInfo> },
    /// A participant became active.
    ParticipantJoined { info: ParticipantInfo },
    /// A participant left.
    ParticipantLeft {
        id: ParticipantId,
        reason: Option<ErrorCode>,
    },
    /// A command to execute at `packet.target_tick`.
    Command { packet: CommandPacket },
    /// The host's clock. Peers may run up to and including `max_tick`.
    Frame { server_tick: u64, max_tick: u64 },
    /// State digest the host computed at `tick`.
    Sync { tick: u64, digest: StateDigest },
    /// Fatal error for this peer; the connection closes right after.
    Error { code: ErrorCode },
    /// The host is shutting the session down.
    Shutdown,
    /// Answer to `ServerInfoQuery`.
    ServerInfo { info: ServerInfo },
}

/// A deterministic command bound to the tick it executes at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPacket {
    pub target_tick: u64,
    pub issuer: ParticipantId,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub callback: Option<CallbackId>,
}

/// Public identity of a participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub name: String,
    pub group: GroupSelector,
}

/// Summary of a session shown in server lists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_name: String,
    pub clients_on: u32,
    pub max_clients: u32,
    pub spectators_on: u32,
    pub tick: u64,
    pub paused: bool,
    pub password_required: bool,
}
