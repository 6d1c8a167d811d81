// The authoritative side of a session.
//
// `HostSession` owns everything the host needs: the registry of peers, the
// sync counters, the command queues, the pause and desync state, and the
// simulation. It is driven from one thread by three kinds of calls:
//
// - `accept` / `handle_message` / `handle_disconnect`: transport events,
//   forwarded by whatever owns the sockets (`lockstep_relay::server`, or a
//   test).
// - `send_command` / `set_pause_reason`: the host's own input.
// - `tick`: one simulation tick, called at the session's cadence.
//
// One host tick:
//   1. At the start of a simulated day, log the digest (target `desync`).
//   2. At a distribution boundary, run the pause policies and distribute
//      every pending command with target `tick + frame_freq`.
//   3. Advance the counters; execute commands due at the new tick; step the
//      simulation.
//   4. "Server tick": announce a new `max_tick` to active peers when it
//      moved, send a `Sync` record every `sync_freq` ticks, and drop peers
//      that lag or stall in the handshake.
//
// A failure caused by one peer closes that peer only, with the error's wire
// reason sent to it first. Pause changes, including those asked for by the
// policies, travel as pause commands so they apply everywhere at the same
// tick; `requested_pause` tracks the mask as it will be once the queued ones
// have run, so the policies don't ask twice.

use std::mem;

use lockstep_protocol::message::{ClientMessage, ServerInfo, ServerMessage};
use lockstep_protocol::types::{CallbackId, ErrorCode, GroupSelector, Opcode, ParticipantId};
use tracing::{debug, info, warn};

use crate::clock::{FrameClock, SyncState};
use crate::commands::{
    ExecutionQueue, PendingCommands, decode_pause, encode_pause, execute_command,
};
use crate::config::{ServerGameType, SessionConfig};
use crate::credentials::{
    EntropySource, GroupSecrets, fill_random, hash_password, open_group_secrets,
    seal_group_secrets,
};
use crate::desync::DesyncDetector;
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::handshake::{AuthStep, HandshakeState, validate_join};
use crate::link::Link;
use crate::pause::{PauseCoordinator, PauseMode, check_min_active_clients, check_pause_on_join};
use crate::registry::{PeerConnection, Registry};
use crate::simulation::Simulation;

pub struct HostSession<S> {
    config: SessionConfig,
    clock: FrameClock,
    sync: SyncState,
    registry: Registry,
    pending: PendingCommands,
    execution: ExecutionQueue,
    pause: PauseCoordinator,
    requested_pause: PauseMode,
    desync: DesyncDetector,
    simulation: S,
    session_seed: u32,
    events: Vec<SessionEvent>,
}

fn peer_mut(
    registry: &mut Registry,
    id: ParticipantId,
) -> Result<&mut PeerConnection, SessionError> {
    registry.lookup_mut(id).ok_or(SessionError::ConnectionLost)
}

impl<S: Simulation> HostSession<S> {
    /// Start hosting. Missing `server_id` and storage keys are generated into
    /// the config; check `config()` afterwards if it should be saved.
    pub fn new(
        mut config: SessionConfig,
        simulation: S,
        entropy: &mut dyn EntropySource,
    ) -> Result<Self, SessionError> {
        config
            .validate()
            .map_err(|e| SessionError::ResourceUnavailable(e.to_string()))?;
        if config.ensure_storage_keys(entropy) {
            debug!("generated server id and storage keys");
        }

        let mut registry = Registry::new(config.capacity())?;
        let host_group = if config.dedicated {
            GroupSelector::Spectator
        } else {
            GroupSelector::Group(0)
        };
        registry.allocate_host(config.client_name.clone(), host_group)?;

        let mut seed = [0u8; 4];
        fill_random(entropy, &mut seed);

        info!(
            server = %config.server_name,
            capacity = config.capacity(),
            dedicated = config.dedicated,
            frame_freq = config.frame_freq,
            "session hosted"
        );

        Ok(HostSession {
            clock: FrameClock::new(config.frame_freq, config.lag_grace_ticks),
            sync: SyncState::default(),
            registry,
            pending: PendingCommands::default(),
            execution: ExecutionQueue::default(),
            pause: PauseCoordinator::new(),
            requested_pause: PauseMode::empty(),
            desync: DesyncDetector::new(),
            simulation,
            session_seed: u32::from_be_bytes(seed),
            events: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn pause_mode(&self) -> PauseMode {
        self.pause.mode()
    }

    pub fn session_seed(&self) -> u32 {
        self.session_seed
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        mem::take(&mut self.events)
    }

    /// Current lag of an active peer, in ticks.
    pub fn lag_of(&self, id: ParticipantId) -> Option<u64> {
        let conn = self.registry.lookup(id)?;
        Some(self.clock.calculate_lag(
            conn.last_acked_tick,
            conn.last_acked_server_tick,
            self.sync.tick,
        ))
    }

    pub fn server_info(&self) -> ServerInfo {
        let mut clients_on = self.registry.roster().len();
        if self.config.dedicated {
            clients_on = clients_on.saturating_sub(1);
        }
        ServerInfo {
            server_name: self.config.server_name.clone(),
            clients_on: clients_on as u32,
            max_clients: u32::from(self.config.max_clients),
            spectators_on: self.registry.spectator_count(self.config.dedicated) as u32,
            tick: self.sync.tick,
            paused: self.pause.is_paused(),
            password_required: self.config.session_password().is_some(),
        }
    }

    /// Change how the session is advertised. Returns whether it changed;
    /// the caller re-registers or withdraws accordingly.
    pub fn set_server_game_type(&mut self, game_type: ServerGameType) -> bool {
        if self.config.server_game_type == game_type {
            return false;
        }
        info!(from = ?self.config.server_game_type, to = ?game_type, "server game type changed");
        self.config.server_game_type = game_type;
        true
    }

    // --- transport events ---

    /// A transport connection came in. Refused with `ServerFull` when there
    /// is no free slot.
    pub fn accept(
        &mut self,
        mut link: Box<dyn Link<ServerMessage>>,
        address: String,
    ) -> Result<ParticipantId, SessionError> {
        if self.registry.is_full() {
            warn!(address, "connection refused: session full");
            let _ = link.send(&ServerMessage::Error {
                code: ErrorCode::ServerFull,
            });
            link.close();
            return Err(SessionError::CapacityExceeded);
        }
        let now = self.sync.tick;
        let id = self.registry.allocate(link, address.clone(), now)?;
        peer_mut(&mut self.registry, id)?.handshake.begin(now)?;
        info!(peer = %id, address, "peer connected");
        Ok(id)
    }

    /// A message arrived from `id`. On error the peer is closed and the
    /// error returned for logging; the session itself carries on.
    pub fn handle_message(
        &mut self,
        id: ParticipantId,
        message: ClientMessage,
    ) -> Result<(), SessionError> {
        if self.registry.lookup(id).is_none() {
            debug!(peer = %id, "message from a closed connection ignored");
            return Ok(());
        }
        match self.process_message(id, message) {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(peer = %id, error = %err, "closing peer");
                let notify =
                    !matches!(err, SessionError::Remote(_) | SessionError::ConnectionLost);
                self.close_peer(id, Some(err.reason_code()), notify);
                Err(err)
            }
        }
    }

    /// The transport to `id` is gone.
    pub fn handle_disconnect(&mut self, id: ParticipantId) {
        if self.registry.contains(id) {
            self.close_peer(id, Some(ErrorCode::ConnectionLost), false);
        }
    }

    pub fn kick(&mut self, id: ParticipantId) -> bool {
        if self.registry.lookup(id).is_none() {
            return false;
        }
        self.close_peer(id, Some(ErrorCode::Kicked), true);
        true
    }

    /// Tell every peer the session is over and drop them.
    pub fn shutdown(&mut self) {
        info!(tick = self.sync.tick, "session shutting down");
        let now = self.sync.tick;
        for id in self.registry.peer_ids() {
            if let Some((_, Some(mut conn))) = self.registry.release(id) {
                let _ = conn.send(&ServerMessage::Shutdown);
                conn.handshake.close(now);
                conn.close_link();
            }
        }
        self.events.push(SessionEvent::SessionEnded);
    }

    // --- local input ---

    /// Queue a simulation command issued by the host.
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
        self.pending.push(ParticipantId::HOST, opcode, payload, callback);
        Ok(())
    }

    /// Ask for one pause reason to be set or cleared. Takes effect at the
    /// tick the resulting pause command is distributed for.
    pub fn set_pause_reason(&mut self, reason: PauseMode, active: bool) {
        if self.requested_pause.contains(reason) == active {
            return;
        }
        self.requested_pause.set(reason, active);
        self.pending.push(
            ParticipantId::HOST,
            Opcode::PAUSE,
            encode_pause(reason, active),
            None,
        );
    }

    // --- persistence ---

    /// Seal the session salt and group passwords for storing with a saved
    /// session.
    pub fn seal_secrets(&self, entropy: &mut dyn EntropySource) -> Result<Vec<u8>, SessionError> {
        let keys = self
            .config
            .storage_keys()
            .map_err(|e| SessionError::ResourceUnavailable(e.to_string()))?;
        let secrets = GroupSecrets {
            session_salt: self.config.server_id.clone(),
            group_passwords: self.config.group_passwords.clone(),
        };
        Ok(seal_group_secrets(&secrets, &keys, entropy)?)
    }

    /// Restore secrets sealed by `seal_secrets`. Returns `false` if they
    /// were sealed by another host and so were skipped.
    pub fn restore_secrets(&mut self, blob: &[u8]) -> Result<bool, SessionError> {
        let keys = self
            .config
            .storage_keys()
            .map_err(|e| SessionError::ResourceUnavailable(e.to_string()))?;
        let Some(secrets) = open_group_secrets(blob, &keys)? else {
            return Ok(false);
        };
        self.config.server_id = secrets.session_salt;
        self.config.group_passwords = secrets.group_passwords;
        Ok(true)
    }

    // --- the tick ---

    pub fn tick(&mut self) {
        self.desync
            .log_day_start(self.sync.tick, self.sync.date, &self.sync.digest);

        if self.clock.at_boundary(&self.sync) {
            self.check_pause_policies();
            let target = self.clock.next_max(&self.sync);
            self.distribute(target);
        }

        let advance = self.clock.advance_host(&mut self.sync);
        let tick = self.sync.tick;
        for packet in self.execution.take_due(tick) {
            execute_command(
                &packet,
                tick,
                ParticipantId::HOST,
                &mut self.pause,
                &mut self.simulation,
                &mut self.events,
            );
        }

        let outcome = self.simulation.advance(self.pause.mode());
        self.sync.digest = outcome.digest;
        self.sync.date = outcome.date;

        self.server_tick(advance.send_frame);
    }

    fn check_pause_policies(&mut self) {
        if let Some(wanted) = check_min_active_clients(
            self.requested_pause,
            self.config.dedicated,
            self.config.min_active_clients,
            self.registry.count_active_players(),
        ) {
            self.set_pause_reason(PauseMode::ACTIVE_CLIENTS, wanted);
        }
        if let Some(wanted) = check_pause_on_join(
            self.requested_pause,
            self.config.pause_on_join,
            self.registry.has_joining(),
        ) {
            self.set_pause_reason(PauseMode::JOIN, wanted);
        }
    }

    /// Send everything pending to eligible peers and queue it locally.
    fn distribute(&mut self, target: u64) {
        for id in self.registry.peer_ids() {
            if let Some(conn) = self.registry.lookup_mut(id) {
                conn.queued_commands = 0;
            }
        }
        if self.pending.is_empty() {
            return;
        }

        let packets = self.pending.drain_tagged(target);
        debug!(
            target: "desync",
            tick = self.sync.tick,
            target_tick = target,
            count = packets.len(),
            "distributing commands"
        );

        let mut broken = Vec::new();
        for id in self.registry.peer_ids() {
            let Some(conn) = self.registry.lookup_mut(id) else {
                continue;
            };
            if conn.handshake.is_active() {
                let failed = packets.iter().any(|packet| {
                    conn.send(&ServerMessage::Command {
                        packet: packet.clone(),
                    })
                    .is_err()
                });
                if failed {
                    broken.push(id);
                }
            } else if conn.handshake.state() == HandshakeState::MapTransfer {
                conn.deferred.extend(packets.iter().cloned());
            }
        }

        for packet in packets {
            if let Err(err) = self.execution.insert(packet, self.sync.tick) {
                warn!(error = %err, "host could not queue its own command");
            }
        }
        for id in broken {
            self.close_peer(id, Some(ErrorCode::ConnectionLost), false);
        }
    }

    fn server_tick(&mut self, send_frame: bool) {
        let tick = self.sync.tick;
        if send_frame {
            self.broadcast(
                &ServerMessage::Frame {
                    server_tick: tick,
                    max_tick: self.sync.max_tick,
                },
                None,
            );
        }
        if tick % self.config.sync_freq == 0 {
            self.sync.last_sync_tick = tick;
            self.broadcast(
                &ServerMessage::Sync {
                    tick,
                    digest: self.sync.digest,
                },
                None,
            );
        }
        self.enforce_timeouts();
    }

    fn enforce_timeouts(&mut self) {
        let now = self.sync.tick;
        let limits = self.config.timeout_limits();
        let mut expired = Vec::new();
        for id in self.registry.peer_ids() {
            let Some(conn) = self.registry.lookup(id) else {
                continue;
            };
            if conn.handshake.is_active() {
                let lag = self.clock.calculate_lag(
                    conn.last_acked_tick,
                    conn.last_acked_server_tick,
                    now,
                );
                if lag > self.config.max_lag_ticks {
                    expired.push((id, ErrorCode::TimeoutComputer));
                }
            } else if let Some(code) = conn.handshake.timeout(now, &limits) {
                expired.push((id, code));
            }
        }
        for (id, code) in expired {
            warn!(peer = %id, tick = now, reason = %code, "peer timed out");
            self.close_peer(id, Some(code), true);
        }
    }

    // --- message handling ---

    fn process_message(
        &mut self,
        id: ParticipantId,
        message: ClientMessage,
    ) -> Result<(), SessionError> {
        match message {
            ClientMessage::Join {
                protocol_revision,
                client_name,
                group,
            } => self.on_join(id, protocol_revision, &client_name, group),
            ClientMessage::SessionPassword { password } => self.on_session_password(id, &password),
            ClientMessage::GroupPassword { hash } => self.on_group_password(id, &hash),
            ClientMessage::RequestSnapshot => self.on_request_snapshot(id),
            ClientMessage::SnapshotLoaded => self.on_snapshot_loaded(id),
            ClientMessage::Command {
                opcode,
                payload,
                callback,
            } => self.on_peer_command(id, opcode, payload, callback),
            ClientMessage::Ack { tick } => self.on_ack(id, tick),
            ClientMessage::Error { code } => Err(SessionError::Remote(code)),
            ClientMessage::Quit => {
                self.close_peer(id, None, false);
                Ok(())
            }
            ClientMessage::ServerInfoQuery => self.on_server_info_query(id),
        }
    }

    fn group_password_required(&self, group: GroupSelector) -> bool {
        group
            .index()
            .and_then(|g| self.config.group_password(g))
            .is_some()
    }

    fn send_to(&mut self, id: ParticipantId, message: &ServerMessage) -> Result<(), SessionError> {
        peer_mut(&mut self.registry, id)?
            .send(message)
            .map_err(|_| SessionError::ConnectionLost)
    }

    fn send_auth_step(&mut self, id: ParticipantId, step: AuthStep) -> Result<(), SessionError> {
        let message = match step {
            AuthStep::AwaitingJoin => return Ok(()),
            AuthStep::AwaitingSessionPassword => ServerMessage::NeedSessionPassword,
            AuthStep::AwaitingGroupPassword => ServerMessage::NeedGroupPassword {
                session_seed: self.session_seed,
                salt: self.config.server_id.clone(),
            },
            AuthStep::Authorized => ServerMessage::Welcome {
                participant_id: id,
                session_seed: self.session_seed,
                salt: self.config.server_id.clone(),
            },
        };
        self.send_to(id, &message)
    }

    fn on_join(
        &mut self,
        id: ParticipantId,
        protocol_revision: u32,
        client_name: &str,
        group: GroupSelector,
    ) -> Result<(), SessionError> {
        let (name, group) =
            validate_join(protocol_revision, client_name, group, self.config.max_groups)?;
        let name = self.registry.unique_name(&name, id);
        let session_password = self.config.session_password().is_some();
        let group_password = self.group_password_required(group);

        let now = self.sync.tick;
        let step = peer_mut(&mut self.registry, id)?
            .handshake
            .on_join(session_password, group_password, now)?;
        if let Some(info) = self.registry.info_mut(id) {
            info.name = name.clone();
            info.group = group;
        }
        info!(peer = %id, name, ?group, "join requested");
        self.send_auth_step(id, step)
    }

    fn on_session_password(
        &mut self,
        id: ParticipantId,
        password: &str,
    ) -> Result<(), SessionError> {
        let accepted = self.config.session_password() == Some(password);
        let group = self
            .registry
            .info(id)
            .map_or(GroupSelector::Spectator, |info| info.group);
        let group_password = self.group_password_required(group);

        let now = self.sync.tick;
        let step = peer_mut(&mut self.registry, id)?
            .handshake
            .on_session_password(accepted, group_password, now)?;
        self.send_auth_step(id, step)
    }

    fn on_group_password(&mut self, id: ParticipantId, hash: &str) -> Result<(), SessionError> {
        let expected = self
            .registry
            .info(id)
            .and_then(|info| info.group.index())
            .and_then(|g| self.config.group_password(g))
            .map(|password| hash_password(password, &self.config.server_id, self.session_seed))
            .unwrap_or_default();
        let accepted = !expected.is_empty() && expected == hash;

        let now = self.sync.tick;
        peer_mut(&mut self.registry, id)?
            .handshake
            .on_group_password(accepted, now)?;
        self.send_auth_step(id, AuthStep::Authorized)
    }

    fn on_request_snapshot(&mut self, id: ParticipantId) -> Result<(), SessionError> {
        let tick = self.sync.tick;
        let conn = peer_mut(&mut self.registry, id)?;
        conn.handshake.on_request_snapshot(tick)?;
        conn.deferred = self.execution.pending_after(tick);

        let data = self.simulation.snapshot().map_err(SessionError::Snapshot)?;
        info!(peer = %id, tick, bytes = data.len(), "sending session snapshot");
        self.send_to(
            id,
            &ServerMessage::Snapshot {
                tick,
                pause_mode: self.pause.mode().bits(),
                data,
            },
        )
    }

    fn on_snapshot_loaded(&mut self, id: ParticipantId) -> Result<(), SessionError> {
        let tick = self.sync.tick;
        let max_tick = self.sync.max_tick;
        let conn = peer_mut(&mut self.registry, id)?;
        conn.handshake.on_snapshot_loaded(tick)?;
        conn.last_acked_tick = tick;
        conn.last_acked_server_tick = tick;

        let lost = |_: std::io::Error| SessionError::ConnectionLost;
        for packet in mem::take(&mut conn.deferred) {
            conn.send(&ServerMessage::Command { packet }).map_err(lost)?;
        }
        conn.send(&ServerMessage::Frame {
            server_tick: tick,
            max_tick,
        })
        .map_err(lost)?;

        let participants = self.registry.roster();
        self.send_to(id, &ServerMessage::Roster { participants })?;

        if let Some(info) = self.registry.info(id).cloned() {
            info!(peer = %id, name = %info.name, tick, "peer active");
            self.broadcast(
                &ServerMessage::ParticipantJoined { info: info.clone() },
                Some(id),
            );
            self.events.push(SessionEvent::ParticipantJoined(info));
        }
        Ok(())
    }

    fn on_peer_command(
        &mut self,
        id: ParticipantId,
        opcode: Opcode,
        payload: Vec<u8>,
        callback: Option<CallbackId>,
    ) -> Result<(), SessionError> {
        let limit = self.config.max_commands_in_queue;
        let conn = peer_mut(&mut self.registry, id)?;
        if !conn.handshake.is_active() {
            return Err(SessionError::Refused(ErrorCode::NotExpected));
        }
        if conn.queued_commands >= limit {
            return Err(SessionError::Refused(ErrorCode::TooManyCommands));
        }

        if opcode == Opcode::PAUSE {
            let (reason, active) = decode_pause(&payload)?;
            if reason != PauseMode::MANUAL {
                return Err(SessionError::Refused(ErrorCode::NotAuthorized));
            }
            self.requested_pause.set(reason, active);
        } else if opcode.is_session_control() {
            return Err(SessionError::ProtocolViolation(format!(
                "opcode {} is reserved for the session",
                opcode.0
            )));
        }

        conn.queued_commands += 1;
        self.pending.push(id, opcode, payload, callback);
        Ok(())
    }

    fn on_ack(&mut self, id: ParticipantId, tick: u64) -> Result<(), SessionError> {
        let now = self.sync.tick;
        let max_tick = self.sync.max_tick;
        let conn = peer_mut(&mut self.registry, id)?;
        if !conn.handshake.is_active() {
            return Err(SessionError::Refused(ErrorCode::NotExpected));
        }
        if tick > max_tick {
            return Err(SessionError::ProtocolViolation(format!(
                "ack for tick {tick} beyond max tick {max_tick}"
            )));
        }
        conn.last_acked_tick = tick;
        conn.last_acked_server_tick = now;
        Ok(())
    }

    fn on_server_info_query(&mut self, id: ParticipantId) -> Result<(), SessionError> {
        let joining = self
            .registry
            .lookup(id)
            .is_some_and(|c| {
                c.handshake.state() == HandshakeState::Authorizing(AuthStep::AwaitingJoin)
            });
        if !joining {
            return Err(SessionError::Refused(ErrorCode::NotExpected));
        }
        let info = self.server_info();
        self.send_to(id, &ServerMessage::ServerInfo { info })?;
        self.close_peer(id, None, false);
        Ok(())
    }

    // --- fan-out and teardown ---

    /// Send to every active peer except `except`. Peers whose link fails are
    /// closed.
    fn broadcast(&mut self, message: &ServerMessage, except: Option<ParticipantId>) {
        let mut broken = Vec::new();
        for id in self.registry.peer_ids() {
            if Some(id) == except {
                continue;
            }
            let Some(conn) = self.registry.lookup_mut(id) else {
                continue;
            };
            if conn.handshake.is_active() && conn.send(message).is_err() {
                broken.push(id);
            }
        }
        for id in broken {
            warn!(peer = %id, "write failed");
            self.close_peer(id, Some(ErrorCode::ConnectionLost), false);
        }
    }

    /// Release `id`, telling it `reason` first when `notify` is set, and
    /// announce the departure if it had been active.
    fn close_peer(&mut self, id: ParticipantId, reason: Option<ErrorCode>, notify: bool) {
        let now = self.sync.tick;
        let Some((info, connection)) = self.registry.release(id) else {
            return;
        };
        let mut was_active = false;
        if let Some(mut conn) = connection {
            was_active = conn.handshake.is_active();
            if let Some(code) = reason.filter(|_| notify) {
                let _ = conn.send(&ServerMessage::Error { code });
            }
            conn.handshake.close(now);
            conn.close_link();
        }

        match reason {
            Some(code) => info!(peer = %id, name = %info.name, reason = %code, "peer closed"),
            None => info!(peer = %id, name = %info.name, "peer left"),
        }

        if was_active {
            self.broadcast(&ServerMessage::ParticipantLeft { id, reason }, None);
            self.events.push(SessionEvent::ParticipantLeft {
                id,
                name: info.name,
                reason,
            });
        }
    }
}
