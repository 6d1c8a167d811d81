// Command distribution and execution queues.
//
// Host side: commands issued locally or received from active peers wait in
// a `PendingCommands` list until the next distribution boundary, where they
// are all tagged with the same target tick (see `clock.rs`) in arrival
// order. From there each tagged packet goes to every active peer, to the
// deferred queue of peers still loading the snapshot, and to the host's own
// `ExecutionQueue`. Peers still being admitted get nothing.
//
// Both sides execute from an `ExecutionQueue`, keyed by target tick. Packets
// with the same target run in the order they were inserted, which is the
// order the host distributed them. Inserting a packet for a tick that has
// already been executed is a protocol violation: executing it late would
// silently fork the simulation.
//
// The pause opcode carries a two-byte payload, `[reason bits, active]`.
// `execute_command` is the single place where a due packet takes effect:
// pause packets go to the pause coordinator, every other non-reserved opcode
// goes to the simulation.

use std::collections::BTreeMap;

use lockstep_protocol::message::CommandPacket;
use lockstep_protocol::types::{CallbackId, Opcode, ParticipantId};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::pause::{PauseCoordinator, PauseMode};
use crate::simulation::Simulation;

/// Commands waiting for the next boundary. Host only.
#[derive(Debug, Default)]
pub struct PendingCommands {
    queue: Vec<CommandPacket>,
}

impl PendingCommands {
    pub fn push(
        &mut self,
        issuer: ParticipantId,
        opcode: Opcode,
        payload: Vec<u8>,
        callback: Option<CallbackId>,
    ) {
        self.queue.push(CommandPacket {
            target_tick: 0,
            issuer,
            opcode,
            payload,
            callback,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Take everything queued so far, tagged with `target_tick`.
    pub fn drain_tagged(&mut self, target_tick: u64) -> Vec<CommandPacket> {
        let mut packets = std::mem::take(&mut self.queue);
        for packet in &mut packets {
            packet.target_tick = target_tick;
        }
        packets
    }
}

/// Commands tagged with a target tick, waiting to execute.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    by_tick: BTreeMap<u64, Vec<CommandPacket>>,
}

impl ExecutionQueue {
    /// Queue `packet`. `executed_tick` is the last tick already run locally.
    pub fn insert(
        &mut self,
        packet: CommandPacket,
        executed_tick: u64,
    ) -> Result<(), SessionError> {
        if packet.target_tick <= executed_tick {
            return Err(SessionError::ProtocolViolation(format!(
                "command for tick {} arrived after tick {executed_tick} was executed",
                packet.target_tick
            )));
        }
        self.by_tick.entry(packet.target_tick).or_default().push(packet);
        Ok(())
    }

    /// Remove and return the packets due at `tick`, in arrival order.
    pub fn take_due(&mut self, tick: u64) -> Vec<CommandPacket> {
        let later = self.by_tick.split_off(&(tick + 1));
        let due = std::mem::replace(&mut self.by_tick, later);
        due.into_values().flatten().collect()
    }

    /// Copies of every packet targeting a tick after `tick`, in execution
    /// order.
    pub fn pending_after(&self, tick: u64) -> Vec<CommandPacket> {
        self.by_tick
            .range(tick + 1..)
            .flat_map(|(_, packets)| packets.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tick.is_empty()
    }
}

/// Payload of an `Opcode::PAUSE` command.
pub fn encode_pause(reason: PauseMode, active: bool) -> Vec<u8> {
    vec![reason.bits(), u8::from(active)]
}

/// Decode an `Opcode::PAUSE` payload. Exactly one known reason bit must be
/// set.
pub fn decode_pause(payload: &[u8]) -> Result<(PauseMode, bool), SessionError> {
    let [bits, active] = payload else {
        return Err(SessionError::ProtocolViolation(format!(
            "pause payload must be 2 bytes, got {}",
            payload.len()
        )));
    };
    let reason = PauseMode::from_bits(*bits)
        .filter(|mode| mode.bits().count_ones() == 1)
        .ok_or_else(|| {
            SessionError::ProtocolViolation(format!("invalid pause reason {bits:#04x}"))
        })?;
    Ok((reason, *active != 0))
}

/// Apply one due packet at `tick`. `local` is the participant running this
/// session; its own callbacks are reported as `CommandCompleted`.
pub fn execute_command<S: Simulation>(
    packet: &CommandPacket,
    tick: u64,
    local: ParticipantId,
    pause: &mut PauseCoordinator,
    simulation: &mut S,
    events: &mut Vec<SessionEvent>,
) {
    debug!(
        target: "desync",
        tick,
        issuer = %packet.issuer,
        opcode = packet.opcode.0,
        len = packet.payload.len(),
        "cmd"
    );

    if packet.opcode == Opcode::PAUSE {
        match decode_pause(&packet.payload) {
            Ok((reason, active)) => {
                if let Some(transition) = pause.set_reason(reason, active) {
                    info!(tick, "{}", transition.message());
                    events.push(SessionEvent::PauseChanged(transition));
                }
            }
            Err(err) => warn!(tick, error = %err, "ignoring malformed pause command"),
        }
    } else if packet.opcode.is_session_control() {
        warn!(tick, opcode = packet.opcode.0, "ignoring reserved opcode");
    } else {
        simulation.execute(packet);
    }

    if let Some(callback) = packet.callback.filter(|_| packet.issuer == local) {
        events.push(SessionEvent::CommandCompleted { tick, callback });
    }
}
