// The peer side of a session.
//
// A `ClientSession` follows the host: it answers the handshake, loads the
// snapshot it is sent, and from then on executes exactly the commands the
// host distributes, at exactly their target ticks, never running past the
// host's `max_tick`. It reports progress with an `Ack` every
// `ack_interval_ticks` ticks and checks every `Sync` record it receives
// against its own digests.
//
//   Connecting --join()--> Joining --Welcome--> Loading --Snapshot--> Active
//
// Any error is fatal for a client: the host is told the reason (unless the
// host itself ended things, or the link is already gone), the link is closed,
// and the session moves to `Closed`. Every later call is a no-op.
//
// `tick()` is called at the local cadence. When the host is ahead it runs as
// many steps as needed to catch up in one call.

use std::collections::BTreeMap;
use std::mem;

use lockstep_protocol::message::{ClientMessage, ParticipantInfo, ServerMessage};
use lockstep_protocol::types::{
    CallbackId, ErrorCode, GroupSelector, Opcode, PROTOCOL_REVISION, ParticipantId,
};
use tracing::{debug, info, warn};

use crate::clock::{FrameClock, SyncState};
use crate::commands::{ExecutionQueue, encode_pause, execute_command};
use crate::config::SessionConfig;
use crate::credentials::hash_password;
use crate::desync::DesyncDetector;
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::link::Link;
use crate::pause::{PauseCoordinator, PauseMode};
use crate::simulation::Simulation;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Joining,
    Loading,
    Active,
    Closed,
}

pub struct ClientSession<S> {
    config: SessionConfig,
    link: Box<dyn Link<ClientMessage>>,
    state: ClientState,
    group: GroupSelector,
    participant_id: Option<ParticipantId>,
    clock: FrameClock,
    sync: SyncState,
    execution: ExecutionQueue,
    pause: PauseCoordinator,
    desync: DesyncDetector,
    simulation: S,
    roster: BTreeMap<ParticipantId, ParticipantInfo>,
    events: Vec<SessionEvent>,
    last_ack_tick: u64,
}

impl<S: Simulation> ClientSession<S> {
    pub fn new(config: SessionConfig, link: Box<dyn Link<ClientMessage>>, simulation: S) -> Self {
        ClientSession {
            clock: FrameClock::new(config.frame_freq, config.lag_grace_ticks),
            config,
            link,
            state: ClientState::Connecting,
            group: GroupSelector::Spectator,
            participant_id: None,
            sync: SyncState::default(),
            execution: ExecutionQueue::default(),
            pause: PauseCoordinator::new(),
            desync: DesyncDetector::new(),
            simulation,
            roster: BTreeMap::new(),
            events: Vec::new(),
            last_ack_tick: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ClientState::Closed
    }

    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.participant_id
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    pub fn pause_mode(&self) -> PauseMode {
        self.pause.mode()
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn roster(&self) -> impl Iterator<Item = &ParticipantInfo> {
        self.roster.values()
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        mem::take(&mut self.events)
    }

    /// Ask to join, playing `group` (or spectating).
    pub fn join(&mut self, group: GroupSelector) -> Result<(), SessionError> {
        if self.state != ClientState::Connecting {
            return Err(SessionError::ProtocolViolation(format!(
                "join while {:?}",
                self.state
            )));
        }
        self.group = group;
        self.state = ClientState::Joining;
        let message = ClientMessage::Join {
            protocol_revision: PROTOCOL_REVISION,
            client_name: self.config.client_name.clone(),
            group,
        };
        self.send(&message)
    }

    /// A message arrived from the host.
    pub fn handle_message(&mut self, message: ServerMessage) -> Result<(), SessionError> {
        if self.is_closed() {
            return Ok(());
        }
        let result = self.process_message(message);
        result.map_err(|err| self.fail(err))
    }

    /// The transport went away underneath us.
    pub fn handle_disconnect(&mut self) {
        if !self.is_closed() {
            warn!(tick = self.sync.tick, "connection to host lost");
            self.state = ClientState::Closed;
        }
    }

    /// Run every step currently allowed.
    pub fn tick(&mut self) -> Result<(), SessionError> {
        if self.state != ClientState::Active {
            return Ok(());
        }
        let steps = self.clock.steps_due(&self.sync);
        if steps > 1 {
            debug!(tick = self.sync.tick, steps, "catching up");
        }
        for _ in 0..steps {
            if let Err(err) = self.step() {
                return Err(self.fail(err));
            }
        }
        Ok(())
    }

    /// Send a simulation command to the host for distribution.
    pub fn send_command(
        &mut self,
        opcode: Opcode,
        payload: Vec<u8>,
        callback: Option<CallbackId>,
    ) -> Result<(), SessionError> {
        if opcode.is_session_control() {
            return Err(SessionError::ProtocolViolation(format!(
                "opcode {} is reserved for the session",
                opcode.0
            )));
        }
        self.send_active(ClientMessage::Command {
            opcode,
            payload,
            callback,
        })
    }

    /// Ask the host to set or clear the manual pause.
    pub fn request_pause(&mut self, active: bool) -> Result<(), SessionError> {
        self.send_active(ClientMessage::Command {
            opcode: Opcode::PAUSE,
            payload: encode_pause(PauseMode::MANUAL, active),
            callback: None,
        })
    }

    /// Leave the session gracefully.
    pub fn quit(&mut self) {
        if self.is_closed() {
            return;
        }
        let _ = self.link.send(&ClientMessage::Quit);
        self.link.close();
        self.state = ClientState::Closed;
        info!(tick = self.sync.tick, "left session");
    }

    fn send(&mut self, message: &ClientMessage) -> Result<(), SessionError> {
        match self.link.send(message) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.fail(SessionError::ConnectionLost)),
        }
    }

    fn send_active(&mut self, message: ClientMessage) -> Result<(), SessionError> {
        if self.state != ClientState::Active {
            return Err(SessionError::Refused(ErrorCode::NotExpected));
        }
        self.send(&message)
    }

    /// Close after a fatal error, telling the host why when it can still
    /// listen.
    fn fail(&mut self, err: SessionError) -> SessionError {
        if self.is_closed() {
            return err;
        }
        warn!(tick = self.sync.tick, error = %err, "leaving session");
        if !matches!(err, SessionError::Remote(_) | SessionError::ConnectionLost) {
            let _ = self.link.send(&ClientMessage::Error {
                code: err.reason_code(),
            });
        }
        self.link.close();
        self.state = ClientState::Closed;
        err
    }

    fn expect_state(&self, wanted: ClientState, message: &str) -> Result<(), SessionError> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(SessionError::ProtocolViolation(format!(
                "unexpected {message} while {:?}",
                self.state
            )))
        }
    }

    fn process_message(&mut self, message: ServerMessage) -> Result<(), SessionError> {
        match message {
            ServerMessage::NeedSessionPassword => {
                self.expect_state(ClientState::Joining, "session password request")?;
                let password = self.config.session_password().unwrap_or_default().to_string();
                self.send(&ClientMessage::SessionPassword { password })
            }
            ServerMessage::NeedGroupPassword { session_seed, salt } => {
                self.expect_state(ClientState::Joining, "group password request")?;
                let hash = self
                    .group
                    .index()
                    .and_then(|g| self.config.group_password(g))
                    .map(|password| hash_password(password, &salt, session_seed))
                    .unwrap_or_default();
                self.send(&ClientMessage::GroupPassword { hash })
            }
            ServerMessage::Welcome { participant_id, .. } => {
                self.expect_state(ClientState::Joining, "welcome")?;
                info!(id = %participant_id, "admitted; requesting snapshot");
                self.participant_id = Some(participant_id);
                self.state = ClientState::Loading;
                self.send(&ClientMessage::RequestSnapshot)
            }
            ServerMessage::Snapshot {
                tick,
                pause_mode,
                data,
            } => {
                self.expect_state(ClientState::Loading, "snapshot")?;
                self.simulation
                    .load_snapshot(&data)
                    .map_err(SessionError::Snapshot)?;
                self.sync = SyncState {
                    tick,
                    server_tick: tick,
                    max_tick: tick,
                    last_sync_tick: tick,
                    ..SyncState::default()
                };
                self.pause.restore(PauseMode::from_bits_truncate(pause_mode));
                self.last_ack_tick = tick;
                self.state = ClientState::Active;
                info!(tick, bytes = data.len(), paused = %self.pause.mode(), "snapshot loaded");
                self.send(&ClientMessage::SnapshotLoaded)
            }
            ServerMessage::Roster { participants } => {
                self.roster = participants.into_iter().map(|p| (p.id, p)).collect();
                Ok(())
            }
            ServerMessage::ParticipantJoined { info } => {
                info!(id = %info.id, name = %info.name, "participant joined");
                self.roster.insert(info.id, info.clone());
                self.events.push(SessionEvent::ParticipantJoined(info));
                Ok(())
            }
            ServerMessage::ParticipantLeft { id, reason } => {
                let name = self.roster.remove(&id).map(|p| p.name).unwrap_or_default();
                info!(%id, name, ?reason, "participant left");
                self.events
                    .push(SessionEvent::ParticipantLeft { id, name, reason });
                Ok(())
            }
            ServerMessage::Command { packet } => {
                self.expect_state(ClientState::Active, "command")?;
                self.execution.insert(packet, self.sync.tick)
            }
            ServerMessage::Frame {
                server_tick,
                max_tick,
            } => {
                self.expect_state(ClientState::Active, "frame")?;
                self.clock.on_frame(&mut self.sync, server_tick, max_tick);
                Ok(())
            }
            ServerMessage::Sync { tick, digest } => {
                self.expect_state(ClientState::Active, "sync")?;
                self.desync.expect(tick, digest, self.sync.tick)?;
                self.sync.last_sync_tick = tick;
                Ok(())
            }
            ServerMessage::Error { code } => Err(SessionError::Remote(code)),
            ServerMessage::Shutdown => {
                info!(tick = self.sync.tick, "host ended the session");
                self.link.close();
                self.state = ClientState::Closed;
                self.events.push(SessionEvent::SessionEnded);
                Ok(())
            }
            ServerMessage::ServerInfo { .. } => Err(SessionError::ProtocolViolation(
                "server info outside a query".into(),
            )),
        }
    }

    fn step(&mut self) -> Result<(), SessionError> {
        self.clock.advance_peer(&mut self.sync);
        let tick = self.sync.tick;
        let local = self.participant_id.unwrap_or(ParticipantId::HOST);

        for packet in self.execution.take_due(tick) {
            execute_command(
                &packet,
                tick,
                local,
                &mut self.pause,
                &mut self.simulation,
                &mut self.events,
            );
        }

        let outcome = self.simulation.advance(self.pause.mode());
        self.sync.digest = outcome.digest;
        self.sync.date = outcome.date;
        self.desync.record_local(tick, outcome.digest)?;

        if tick - self.last_ack_tick >= self.config.ack_interval_ticks {
            self.last_ack_tick = tick;
            self.link
                .send(&ClientMessage::Ack { tick })
                .map_err(|_| SessionError::ConnectionLost)?;
        }
        Ok(())
    }
}
