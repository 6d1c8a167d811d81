// Integration smoke test for the session host.
//
// Starts a host on localhost and exercises the full protocol lifecycle from
// a plain TCP socket: join handshake, snapshot transfer, frame streaming,
// host command distribution, and a clean quit. Further tests cover server
// queries, a password-protected join through `NetClient`, a peer that stops
// reading, and coordinator registration of advertised sessions.
//
// The raw client only uses the protocol crate's framing and message types,
// so these tests drive the host end-to-end without any client session code.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lockstep_core::background::{BackgroundLoop, CoordinatorClient, ServerStatus};
use lockstep_core::client::ClientState;
use lockstep_core::config::{ServerGameType, SessionConfig};
use lockstep_core::endpoint::ConnectionEndpoint;
use lockstep_core::event::SessionEvent;
use lockstep_core::simulation::{HashChainSimulation, Simulation};
use lockstep_protocol::framing::{read_frame, write_frame};
use lockstep_protocol::message::{ClientMessage, ServerInfo, ServerMessage};
use lockstep_protocol::types::{ErrorCode, GroupSelector, Opcode, PROTOCOL_REVISION, ParticipantId};
use lockstep_relay::client::NetClient;
use lockstep_relay::connecter::query_server;
use lockstep_relay::query::run_queries;
use lockstep_relay::server::{HostHandle, start_host, start_host_with};

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config() -> SessionConfig {
    SessionConfig {
        server_name: "smoke".into(),
        server_port: 0,
        tick_millis: 5,
        sync_freq: 10,
        pause_on_join: false,
        ..SessionConfig::default()
    }
}

fn start(config: SessionConfig) -> (HostHandle, SocketAddr) {
    start_host(config, HashChainSimulation::new(7), "127.0.0.1").unwrap()
}

/// Helper: send a ClientMessage over a framed TCP stream.
fn send(writer: &mut BufWriter<TcpStream>, msg: &ClientMessage) {
    write_frame(writer, msg).unwrap();
}

/// Helper: receive a ServerMessage from a framed TCP stream.
fn recv(reader: &mut BufReader<TcpStream>) -> ServerMessage {
    read_frame(reader).unwrap()
}

/// Read messages until `wanted` picks one out, discarding the rest.
fn recv_until<T>(
    reader: &mut BufReader<TcpStream>,
    mut wanted: impl FnMut(&ServerMessage) -> Option<T>,
) -> T {
    let start = Instant::now();
    loop {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for message");
        if let Some(found) = wanted(&recv(reader)) {
            return found;
        }
    }
}

fn poll_host_until(handle: &HostHandle, mut wanted: impl FnMut(&SessionEvent) -> bool) {
    let start = Instant::now();
    loop {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for host event");
        if handle.poll_events().iter().any(&mut wanted) {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn connect(addr: SocketAddr) -> (BufReader<TcpStream>, BufWriter<TcpStream>) {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let reader_stream = stream.try_clone().unwrap();
    (BufReader::new(reader_stream), BufWriter::new(stream))
}

/// Run the join handshake up to an active connection. Returns the assigned
/// id and the tick the snapshot was taken at.
fn join(
    reader: &mut BufReader<TcpStream>,
    writer: &mut BufWriter<TcpStream>,
    name: &str,
) -> (ParticipantId, u64) {
    send(
        writer,
        &ClientMessage::Join {
            protocol_revision: PROTOCOL_REVISION,
            client_name: name.into(),
            group: GroupSelector::Group(0),
        },
    );
    let id = match recv(reader) {
        ServerMessage::Welcome { participant_id, .. } => participant_id,
        other => panic!("expected Welcome, got {other:?}"),
    };

    send(writer, &ClientMessage::RequestSnapshot);
    let tick = match recv(reader) {
        ServerMessage::Snapshot {
            tick,
            pause_mode,
            data,
        } => {
            assert_eq!(pause_mode, 0);
            let mut sim = HashChainSimulation::new(0);
            sim.load_snapshot(&data).unwrap();
            tick
        }
        other => panic!("expected Snapshot, got {other:?}"),
    };

    send(writer, &ClientMessage::SnapshotLoaded);
    (id, tick)
}

#[test]
fn raw_peer_lifecycle() {
    let (handle, addr) = start(test_config());
    let (mut reader, mut writer) = connect(addr);

    let (id, snapshot_tick) = join(&mut reader, &mut writer, "Alice");
    assert!(!id.is_host());

    // The first frame after loading starts at the snapshot tick.
    let first_frame = recv_until(&mut reader, |msg| match msg {
        ServerMessage::Frame { server_tick, .. } => Some(*server_tick),
        _ => None,
    });
    assert!(first_frame >= snapshot_tick);

    poll_host_until(&handle, |event| {
        matches!(event, SessionEvent::ParticipantJoined(info) if info.id == id)
    });

    // A host command reaches the peer tagged with a future tick, and the
    // host then allows the peer to run up to that tick.
    handle.send_command(Opcode::FIRST_SIMULATION, vec![7, 7]);
    let packet = recv_until(&mut reader, |msg| match msg {
        ServerMessage::Command { packet } => Some(packet.clone()),
        _ => None,
    });
    assert_eq!(packet.issuer, ParticipantId::HOST);
    assert_eq!(packet.payload, vec![7, 7]);
    let allowed = recv_until(&mut reader, |msg| match msg {
        ServerMessage::Frame { max_tick, .. } => Some(*max_tick),
        _ => None,
    });
    assert!(allowed >= packet.target_tick);

    // Sync records arrive every sync_freq ticks.
    let sync_tick = recv_until(&mut reader, |msg| match msg {
        ServerMessage::Sync { tick, .. } => Some(*tick),
        _ => None,
    });
    assert_eq!(sync_tick % 10, 0);

    send(&mut writer, &ClientMessage::Ack { tick: sync_tick });
    send(&mut writer, &ClientMessage::Quit);
    poll_host_until(&handle, |event| {
        matches!(event, SessionEvent::ParticipantLeft { id: left, .. } if *left == id)
    });

    handle.stop();
}

#[test]
fn shutdown_reaches_active_peer() {
    let (handle, addr) = start(test_config());
    let (mut reader, mut writer) = connect(addr);
    join(&mut reader, &mut writer, "Bob");
    recv_until(&mut reader, |msg| {
        matches!(msg, ServerMessage::Frame { .. }).then_some(())
    });

    handle.stop();
    recv_until(&mut reader, |msg| {
        matches!(msg, ServerMessage::Shutdown).then_some(())
    });
}

#[test]
fn server_query_reports_status() {
    let config = SessionConfig {
        session_password: Some("secret".into()),
        max_clients: 8,
        ..test_config()
    };
    let (handle, addr) = start(config);

    let endpoint = ConnectionEndpoint::parse(&addr.to_string(), 0);
    let info = query_server(&endpoint, TIMEOUT).unwrap();
    assert_eq!(info.server_name, "smoke");
    assert_eq!(info.max_clients, 8);
    assert_eq!(info.clients_on, 1);
    assert!(info.password_required);

    handle.stop();
}

#[test]
fn run_queries_marks_each_server() {
    let (handle, addr) = start(test_config());

    // Reserve a port and release it so nothing is listening there.
    let closed = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();

    let servers = vec![addr.to_string(), closed.to_string()];
    let list = run_queries(&servers, 0, Duration::from_secs(2));

    let online = list.get(&addr.to_string()).unwrap();
    assert!(matches!(&online.status, ServerStatus::Online(info) if info.server_name == "smoke"));
    assert!(online.manually);
    let offline = list.get(&closed.to_string()).unwrap();
    assert_eq!(offline.status, ServerStatus::Offline);

    handle.stop();
}

#[test]
fn net_client_joins_with_password() {
    let config = SessionConfig {
        session_password: Some("secret".into()),
        ..test_config()
    };
    let (handle, addr) = start(config.clone());

    let endpoint = ConnectionEndpoint::parse(&addr.to_string(), 0);
    let client_config = SessionConfig {
        client_name: "Carol".into(),
        ..config
    };
    let mut client = NetClient::connect(
        &endpoint,
        GroupSelector::Group(0),
        client_config,
        HashChainSimulation::new(0),
        TIMEOUT,
    )
    .unwrap();

    // Run until the client has passed a few digest checks.
    let start = Instant::now();
    while client.session().sync_state().last_sync_tick < 30 {
        assert!(start.elapsed() < TIMEOUT, "timed out following the host");
        client.tick().unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(client.state(), ClientState::Active);
    assert!(client.session().roster().any(|p| p.id.is_host()));

    client.quit();
    handle.stop();
}

#[test]
fn stalled_peer_is_dropped_while_others_continue() {
    let config = SessionConfig {
        lag_grace_ticks: 10,
        ack_interval_ticks: 5,
        max_lag_ticks: 40,
        ..test_config()
    };
    let (handle, addr) = start(config.clone());

    // Joins, then never reads or acks again.
    let (mut stalled_reader, mut stalled_writer) = connect(addr);
    let (stalled, _) = join(&mut stalled_reader, &mut stalled_writer, "Idle");

    let endpoint = ConnectionEndpoint::parse(&addr.to_string(), 0);
    let client_config = SessionConfig {
        client_name: "Dana".into(),
        ..config
    };
    let mut client = NetClient::connect(
        &endpoint,
        GroupSelector::Group(1),
        client_config,
        HashChainSimulation::new(0),
        TIMEOUT,
    )
    .unwrap();

    let start = Instant::now();
    let mut dropped = false;
    while !dropped {
        assert!(start.elapsed() < TIMEOUT, "stalled peer was never dropped");
        client.tick().unwrap();
        dropped = handle.poll_events().iter().any(|event| {
            matches!(
                event,
                SessionEvent::ParticipantLeft { id, reason: Some(ErrorCode::TimeoutComputer), .. }
                    if *id == stalled
            )
        });
        thread::sleep(Duration::from_millis(2));
    }

    let synced = client.session().sync_state().last_sync_tick + 30;
    let start = Instant::now();
    while client.session().sync_state().last_sync_tick < synced {
        assert!(start.elapsed() < TIMEOUT, "remaining peer stopped following the host");
        client.tick().unwrap();
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(client.state(), ClientState::Active);

    client.quit();
    handle.stop();
}

/// Records every coordinator call as a line of text.
struct RecordingCoordinator {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CoordinatorClient for RecordingCoordinator {
    fn register(&mut self, info: &ServerInfo) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("register {}", info.server_name));
    }

    fn close_connection(&mut self) {
        self.calls.lock().unwrap().push("close_connection".into());
    }

    fn close_all_connections(&mut self) {
        self.calls.lock().unwrap().push("close_all_connections".into());
    }

    fn send_receive(&mut self) {}
}

fn start_recorded(config: SessionConfig) -> (HostHandle, Arc<Mutex<Vec<String>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = calls.clone();
    let (handle, _) = start_host_with(config, HashChainSimulation::new(7), "127.0.0.1", move || {
        let mut background = BackgroundLoop::new();
        background.set_coordinator(Box::new(RecordingCoordinator { calls: recorded }));
        background
    })
    .unwrap();
    (handle, calls)
}

fn wait_for_calls(calls: &Mutex<Vec<String>>, count: usize) {
    let start = Instant::now();
    while calls.lock().unwrap().len() < count {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for coordinator calls");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn advertised_host_registers_and_withdraws() {
    let config = SessionConfig {
        server_game_type: ServerGameType::Public,
        ..test_config()
    };
    let (handle, calls) = start_recorded(config);
    wait_for_calls(&calls, 1);

    handle.set_server_game_type(ServerGameType::Local);
    wait_for_calls(&calls, 2);
    handle.set_server_game_type(ServerGameType::InviteOnly);
    wait_for_calls(&calls, 3);
    handle.stop();

    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            "register smoke".to_string(),
            "close_connection".to_string(),
            "register smoke".to_string(),
            "close_connection".to_string(),
        ]
    );
}

#[test]
fn local_host_never_registers() {
    let (handle, calls) = start_recorded(test_config());
    // Unchanged game type: nothing to re-register.
    handle.set_server_game_type(ServerGameType::Local);
    thread::sleep(Duration::from_millis(50));
    handle.stop();

    assert_eq!(*calls.lock().unwrap(), vec!["close_connection".to_string()]);
}
