// TCP server and main loop for a session host.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Reader threads** (one per peer): call `read_frame()` in a loop and send
//   `InternalEvent::MessageFrom` to the main thread. On error/EOF, send
//   `InternalEvent::Disconnected`.
// - **Main thread**: owns the `HostSession` and the `BackgroundLoop`,
//   receives events from the channel, and dispatches them. `recv_timeout`
//   waits at most until the next tick is due, so ticks keep their cadence
//   whether or not peers are talking. After each batch of events the
//   background loop is pumped once.
//
// The main thread is the only producer of peer output; each `TcpLink` hands
// it to its own writer thread, so a peer that stops reading cannot stall the
// loop. Reader threads only read. When the session closes a peer, shutting
// down its socket ends that peer's reader thread; the `Disconnected` it
// sends refers to a released id and is ignored.
//
// Local input (commands, pause, kick, game type) from the embedding process
// arrives on the same channel via `HostHandle`, so it is ordered with
// network input.
//
// An advertised session (`server_game_type` other than `Local`) registers
// with the background loop's coordinator before the first tick, and again
// whenever the game type changes back to an advertised one.
//
// Shutdown: `HostHandle::stop` clears `keep_running`; the main loop sends
// `Shutdown` to every peer, withdraws the coordinator registration, closes
// background services, and exits.

use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use lockstep_core::background::BackgroundLoop;
use lockstep_core::config::{ServerGameType, SessionConfig};
use lockstep_core::credentials::OsEntropy;
use lockstep_core::event::SessionEvent;
use lockstep_core::host::HostSession;
use lockstep_core::pause::PauseMode;
use lockstep_core::simulation::Simulation;
use lockstep_protocol::framing::read_frame;
use lockstep_protocol::message::{ClientMessage, ServerMessage};
use lockstep_protocol::types::{Opcode, ParticipantId};
use tracing::{debug, error, info, warn};

use crate::link::TcpLink;

/// Input from the embedding process.
#[derive(Debug)]
enum LocalRequest {
    Command { opcode: Opcode, payload: Vec<u8> },
    Pause(bool),
    Kick(ParticipantId),
    GameType(ServerGameType),
}

/// Events sent from listener/reader threads and the handle to the main
/// thread.
enum InternalEvent {
    NewConnection {
        stream: TcpStream,
        address: SocketAddr,
    },
    MessageFrom {
        peer: ParticipantId,
        message: ClientMessage,
    },
    Disconnected {
        peer: ParticipantId,
    },
    Local(LocalRequest),
}

/// Handle returned by `start_host` to control the running session.
pub struct HostHandle {
    keep_running: Arc<AtomicBool>,
    requests: Sender<InternalEvent>,
    events: Receiver<SessionEvent>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HostHandle {
    /// Queue a simulation command issued by the host.
    pub fn send_command(&self, opcode: Opcode, payload: Vec<u8>) {
        self.request(LocalRequest::Command { opcode, payload });
    }

    /// Set or clear the manual pause.
    pub fn set_paused(&self, paused: bool) {
        self.request(LocalRequest::Pause(paused));
    }

    pub fn kick(&self, peer: ParticipantId) {
        self.request(LocalRequest::Kick(peer));
    }

    /// Change how the session is advertised.
    pub fn set_server_game_type(&self, game_type: ServerGameType) {
        self.request(LocalRequest::GameType(game_type));
    }

    fn request(&self, request: LocalRequest) {
        if self.requests.send(InternalEvent::Local(request)).is_err() {
            warn!("host loop is gone; request dropped");
        }
    }

    /// Session events raised since the last call (non-blocking).
    pub fn poll_events(&self) -> Vec<SessionEvent> {
        self.events.try_iter().collect()
    }

    /// Signal the host to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Start hosting on a background thread, listening on `bind_ip` and
/// `config.server_port`. Returns a handle and the bound address (useful when
/// port 0 lets the OS pick).
pub fn start_host<S>(
    config: SessionConfig,
    simulation: S,
    bind_ip: &str,
) -> io::Result<(HostHandle, SocketAddr)>
where
    S: Simulation + Send + 'static,
{
    start_host_with(config, simulation, bind_ip, BackgroundLoop::new)
}

/// `start_host`, with background services built on the host thread by
/// `background`.
pub fn start_host_with<S, F>(
    config: SessionConfig,
    simulation: S,
    bind_ip: &str,
    background: F,
) -> io::Result<(HostHandle, SocketAddr)>
where
    S: Simulation + Send + 'static,
    F: FnOnce() -> BackgroundLoop + Send + 'static,
{
    let listener = TcpListener::bind((bind_ip, config.server_port))?;
    let addr = listener.local_addr()?;
    let tick_duration = Duration::from_millis(config.tick_millis.max(1));
    let session =
        HostSession::new(config, simulation, &mut OsEntropy).map_err(io::Error::other)?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();
    let (events_tx, events_rx) = mpsc::channel();

    let loop_state = HostLoop {
        session,
        tx: tx.clone(),
        events: events_tx,
        keep_running: keep_running.clone(),
    };
    let thread = thread::spawn(move || {
        let mut background = background();
        loop_state.run(listener, rx, &mut background, tick_duration);
    });

    info!(%addr, "host listening");
    Ok((
        HostHandle {
            keep_running,
            requests: tx,
            events: events_rx,
            thread: Some(thread),
        },
        addr,
    ))
}

struct HostLoop<S> {
    session: HostSession<S>,
    tx: Sender<InternalEvent>,
    events: Sender<SessionEvent>,
    keep_running: Arc<AtomicBool>,
}

impl<S: Simulation> HostLoop<S> {
    /// Main host loop. Runs until `keep_running` is cleared.
    fn run(
        mut self,
        listener: TcpListener,
        rx: Receiver<InternalEvent>,
        background: &mut BackgroundLoop,
        tick_duration: Duration,
    ) {
        spawn_listener(listener, self.tx.clone(), self.keep_running.clone());

        let game_type = self.session.config().server_game_type;
        if game_type.is_advertised() {
            background.advertise(game_type, &self.session.server_info());
        }

        let mut next_tick = Instant::now() + tick_duration;
        while self.keep_running.load(Ordering::SeqCst) {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(event) => {
                    self.handle_event(event, background);
                    // Drain any additional events that arrived during handling.
                    while let Ok(event) = rx.try_recv() {
                        self.handle_event(event, background);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            while Instant::now() >= next_tick {
                self.session.tick();
                next_tick += tick_duration;
            }
            background.run_once();
            self.forward_events();
        }

        self.session.shutdown();
        background.close_hosted();
        self.forward_events();
        info!("host stopped");
    }

    fn forward_events(&mut self) {
        for event in self.session.take_events() {
            let _ = self.events.send(event);
        }
    }

    fn handle_event(&mut self, event: InternalEvent, background: &mut BackgroundLoop) {
        match event {
            InternalEvent::NewConnection { stream, address } => {
                self.handle_new_connection(stream, address);
            }
            InternalEvent::MessageFrom { peer, message } => {
                if let Err(e) = self.session.handle_message(peer, message) {
                    debug!(%peer, error = %e, "peer dropped");
                }
            }
            InternalEvent::Disconnected { peer } => {
                self.session.handle_disconnect(peer);
            }
            InternalEvent::Local(request) => self.handle_local(request, background),
        }
    }

    fn handle_local(&mut self, request: LocalRequest, background: &mut BackgroundLoop) {
        match request {
            LocalRequest::Command { opcode, payload } => {
                if let Err(e) = self.session.send_command(opcode, payload, None) {
                    warn!(error = %e, "local command refused");
                }
            }
            LocalRequest::Pause(paused) => self.session.set_pause_reason(PauseMode::MANUAL, paused),
            LocalRequest::Kick(peer) => {
                if !self.session.kick(peer) {
                    warn!(%peer, "no such peer to kick");
                }
            }
            LocalRequest::GameType(game_type) => {
                if self.session.set_server_game_type(game_type) {
                    background.advertise(game_type, &self.session.server_info());
                }
            }
        }
    }

    /// Register a new connection with the session and start its reader.
    fn handle_new_connection(&mut self, stream: TcpStream, address: SocketAddr) {
        stream.set_nodelay(true).ok();
        let (reader_stream, link) = match split_stream(stream) {
            Ok(halves) => halves,
            Err(e) => {
                error!(%address, error = %e, "could not set up peer stream");
                return;
            }
        };
        match self.session.accept(Box::new(link), address.to_string()) {
            Ok(peer) => {
                let tx = self.tx.clone();
                let keep_running = self.keep_running.clone();
                thread::spawn(move || {
                    reader_loop(BufReader::new(reader_stream), peer, tx, keep_running);
                });
            }
            Err(e) => debug!(%address, error = %e, "connection not accepted"),
        }
    }
}

/// A read half for the reader thread and a `TcpLink` for the session.
fn split_stream(stream: TcpStream) -> io::Result<(TcpStream, TcpLink<ServerMessage>)> {
    let reader = stream.try_clone()?;
    Ok((reader, TcpLink::new(stream)?))
}

/// Accept connections until `keep_running` is cleared.
fn spawn_listener(listener: TcpListener, tx: Sender<InternalEvent>, keep_running: Arc<AtomicBool>) {
    // Non-blocking so the accept loop can check keep_running periodically.
    listener.set_nonblocking(true).ok();
    thread::spawn(move || {
        while keep_running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, address)) => {
                    stream.set_nonblocking(false).ok();
                    if tx
                        .send(InternalEvent::NewConnection { stream, address })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    error!(error = %e, "listener failed");
                    break;
                }
            }
        }
    });
}

/// Reader loop for a single peer. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    peer: ParticipantId,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_frame::<_, ClientMessage>(&mut reader) {
            Ok(message) => {
                let quitting = message == ClientMessage::Quit;
                if tx.send(InternalEvent::MessageFrom { peer, message }).is_err() || quitting {
                    break;
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "peer stream ended");
                let _ = tx.send(InternalEvent::Disconnected { peer });
                break;
            }
        }
    }
}
