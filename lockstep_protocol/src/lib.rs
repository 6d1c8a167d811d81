// lockstep_protocol: wire protocol between a lockstep session host and its
// peers.
//
// This crate defines the message vocabulary, the value types those messages
// carry, and the framing used on the TCP stream. It is shared by the session
// engine (`lockstep_core`) and the TCP glue (`lockstep_relay`) and has no
// dependency on either.
//
// Module overview:
// - `types.rs`:    ID and value types: `ParticipantId`, `GroupSelector`,
//                  `Opcode`, `SimDate`, `StateDigest`, `ErrorCode`.
// - `message.rs`:  `ClientMessage` / `ServerMessage` plus `CommandPacket`,
//                  `ParticipantInfo`, `ServerInfo`.
// - `framing.rs`:  4-byte big-endian length prefix + JSON payload over any
//                  `Read` / `Write`.
//
// Design decisions:
// - **JSON payloads.** Bandwidth is dominated by small command messages; JSON
//   keeps captures readable. The framing layer is the only place that knows.
// - **Opaque command payloads.** The host never inspects simulation commands,
//   so this crate stays independent of any simulation.
// - **No async runtime.** Plain `std::io`, usable from blocking reader threads.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{MAX_FRAME_SIZE, encode_frame, read_frame, read_raw_frame, write_frame};
pub use message::{ClientMessage, CommandPacket, ParticipantInfo, ServerInfo, ServerMessage};
pub use types::{
    CallbackId, DEFAULT_PORT, ErrorCode, GroupSelector, MAX_CLIENT_NAME_LENGTH, MAX_GROUPS,
    Opcode, PROTOCOL_REVISION, ParticipantId, SimDate, StateDigest,
};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn client_roundtrip(msg: &ClientMessage) {
        let mut wire = Vec::new();
        write_frame(&mut wire, msg).unwrap();
        let recovered: ClientMessage = read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(&recovered, msg);
    }

    fn server_roundtrip(msg: &ServerMessage) {
        let mut wire = Vec::new();
        write_frame(&mut wire, msg).unwrap();
        let recovered: ServerMessage = read_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(&recovered, msg);
    }

    #[test]
    fn join_with_group_survives_the_wire() {
        client_roundtrip(&ClientMessage::Join {
            protocol_revision: PROTOCOL_REVISION,
            client_name: "Signal Tower".into(),
            group: GroupSelector::Group(3),
        });
        client_roundtrip(&ClientMessage::Join {
            protocol_revision: PROTOCOL_REVISION,
            client_name: "Observer".into(),
            group: GroupSelector::Spectator,
        });
    }

    #[test]
    fn command_with_callback_survives_the_wire() {
        client_roundtrip(&ClientMessage::Command {
            opcode: Opcode(42),
            payload: vec![9, 8, 7],
            callback: Some(CallbackId(5)),
        });
    }

    #[test]
    fn distributed_command_keeps_issuer_and_target() {
        server_roundtrip(&ServerMessage::Command {
            packet: CommandPacket {
                target_tick: 104,
                issuer: ParticipantId {
                    slot: 2,
                    generation: 7,
                },
                opcode: Opcode(17),
                payload: vec![1, 2, 3],
                callback: None,
            },
        });
    }

    #[test]
    fn sync_record_keeps_full_digest() {
        server_roundtrip(&ServerMessage::Sync {
            tick: 500,
            digest: StateDigest {
                seeds: [0xDEAD_BEEF, 0x0BAD_F00D],
                checksum: 0xFFFF_0000_ABCD_0001,
            },
        });
    }

    #[test]
    fn roster_and_departure() {
        server_roundtrip(&ServerMessage::Roster {
            participants: vec![
                ParticipantInfo {
                    id: ParticipantId::HOST,
                    name: "Dedicated".into(),
                    group: GroupSelector::Spectator,
                },
                ParticipantInfo {
                    id: ParticipantId {
                        slot: 1,
                        generation: 0,
                    },
                    name: "Alice".into(),
                    group: GroupSelector::Group(0),
                },
            ],
        });
        server_roundtrip(&ServerMessage::ParticipantLeft {
            id: ParticipantId {
                slot: 1,
                generation: 0,
            },
            reason: Some(ErrorCode::TimeoutComputer),
        });
    }

    #[test]
    fn server_info_answer() {
        server_roundtrip(&ServerMessage::ServerInfo {
            info: ServerInfo {
                server_name: "Night Freight".into(),
                clients_on: 3,
                max_clients: 8,
                spectators_on: 1,
                tick: 12_000,
                paused: true,
                password_required: false,
            },
        });
    }
}
