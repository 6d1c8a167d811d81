// Test-only peer for multiplayer integration tests.
//
// Wraps the real `NetClient` (from `lockstep_relay::client`) driving a real
// `HashChainSimulation` to give a synchronous, test-friendly API for
// exercising the whole pipeline over TCP:
// host → join handshake → snapshot → commands → frames → steps → digests.
//
// The only test-specific code here is the blocking polling wrappers (loops
// around `NetClient::tick()`). Networking, command scheduling and desync
// checks use the same code paths as the `join` subcommand.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use lockstep_core::client::ClientState;
use lockstep_core::config::SessionConfig;
use lockstep_core::endpoint::ConnectionEndpoint;
use lockstep_core::error::SessionError;
use lockstep_core::event::SessionEvent;
use lockstep_core::pause::PauseMode;
use lockstep_core::simulation::HashChainSimulation;
use lockstep_protocol::types::{CallbackId, GroupSelector, Opcode, StateDigest};
use lockstep_relay::client::NetClient;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A test peer wrapping a real NetClient and simulation.
pub struct TestPeer {
    client: NetClient<HashChainSimulation>,
    /// Every event the session raised, in order.
    pub events: Vec<SessionEvent>,
    /// The first error the session reported, if any.
    pub error: Option<SessionError>,
}

impl TestPeer {
    /// Connect to a host and send `Join`. The handshake completes as the
    /// peer is polled.
    pub fn connect(addr: SocketAddr, config: SessionConfig, group: GroupSelector) -> Self {
        let endpoint = ConnectionEndpoint::parse(&addr.to_string(), 0);
        let client = NetClient::connect(
            &endpoint,
            group,
            config,
            HashChainSimulation::new(0),
            POLL_TIMEOUT,
        )
        .expect("TestPeer::connect failed");
        Self {
            client,
            events: Vec::new(),
            error: None,
        }
    }

    /// Connect with `name` into group 0 using `config`.
    pub fn join(addr: SocketAddr, name: &str, config: &SessionConfig) -> Self {
        let config = SessionConfig {
            client_name: name.into(),
            ..config.clone()
        };
        Self::connect(addr, config, GroupSelector::Group(0))
    }

    pub fn state(&self) -> ClientState {
        self.client.state()
    }

    pub fn tick(&self) -> u64 {
        self.client.session().sync_state().tick
    }

    pub fn digest(&self) -> StateDigest {
        self.client.session().sync_state().digest
    }

    pub fn last_sync_tick(&self) -> u64 {
        self.client.session().sync_state().last_sync_tick
    }

    pub fn pause_mode(&self) -> PauseMode {
        self.client.session().pause_mode()
    }

    pub fn commands_executed(&self) -> u64 {
        self.client.session().simulation().commands_executed()
    }

    pub fn roster_names(&self) -> Vec<String> {
        self.client
            .session()
            .roster()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Non-blocking: handle queued messages and run every allowed step.
    /// Errors are recorded rather than returned.
    pub fn pump(&mut self) {
        if let Err(err) = self.client.tick() {
            self.error.get_or_insert(err);
        }
        let events = self.client.session_mut().take_events();
        self.events.extend(events);
    }

    /// Pump until `done` holds, panicking after `POLL_TIMEOUT`.
    pub fn pump_until(&mut self, what: &str, mut done: impl FnMut(&Self) -> bool) {
        let start = Instant::now();
        loop {
            self.pump();
            if done(self) {
                return;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn poll_until_active(&mut self) {
        self.pump_until("active session", |p| p.state() == ClientState::Active);
    }

    pub fn poll_until_closed(&mut self) {
        self.pump_until("closed session", |p| p.state() == ClientState::Closed);
    }

    /// Pump until a `Sync` record at or after `tick` has been checked.
    pub fn poll_until_synced(&mut self, tick: u64) {
        self.pump_until("digest check", |p| p.last_sync_tick() >= tick);
    }

    pub fn poll_until_paused(&mut self, paused: bool) {
        self.pump_until("pause change", |p| p.pause_mode().is_empty() != paused);
    }

    /// Pump until the command with `callback` has executed here.
    pub fn poll_until_completed(&mut self, callback: CallbackId) {
        self.pump_until("command completion", |p| {
            p.events.iter().any(|e| {
                matches!(e, SessionEvent::CommandCompleted { callback: c, .. } if *c == callback)
            })
        });
    }

    pub fn send_command(&mut self, opcode: Opcode, payload: Vec<u8>, callback: Option<CallbackId>) {
        self.client
            .session_mut()
            .send_command(opcode, payload, callback)
            .expect("send_command failed");
    }

    pub fn request_pause(&mut self, active: bool) {
        self.client
            .session_mut()
            .request_pause(active)
            .expect("request_pause failed");
    }

    /// Send `Quit` and close the connection.
    pub fn quit(&mut self) {
        self.client.quit();
    }
}

/// Pump every peer until `done` holds for all of them.
pub fn pump_all_until(peers: &mut [&mut TestPeer], what: &str, done: impl Fn(&TestPeer) -> bool) {
    let start = Instant::now();
    loop {
        for peer in peers.iter_mut() {
            peer.pump();
        }
        if peers.iter().all(|p| done(&**p)) {
            return;
        }
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}
