// TCP client driver for joining a session host.
//
// Architecture mirrors the host side:
// - `connect()` opens the TCP connection on the calling thread, wraps the
//   write half in a `TcpLink` owned by a `ClientSession`, sends `Join`, and
//   spawns a reader thread for the read half.
// - The reader thread calls `read_frame()` in a loop and pushes each
//   `ServerMessage` into an `mpsc` channel, followed by `Inbound::Closed`
//   when the stream ends.
// - `poll()` drains the inbox into the session without blocking; `tick()`
//   polls and then runs whatever steps the host allows.
//
// The caller decides the cadence (`SessionConfig::tick_millis` in the
// `join` subcommand, a tight loop in tests).

use std::io::{self, BufReader};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lockstep_core::client::{ClientSession, ClientState};
use lockstep_core::config::SessionConfig;
use lockstep_core::endpoint::ConnectionEndpoint;
use lockstep_core::error::SessionError;
use lockstep_core::simulation::Simulation;
use lockstep_protocol::framing::read_frame;
use lockstep_protocol::message::ServerMessage;
use lockstep_protocol::types::GroupSelector;
use thiserror::Error;
use tracing::debug;

use crate::connecter::connect_stream;
use crate::link::TcpLink;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[from] io::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

enum Inbound {
    Message(ServerMessage),
    Closed,
}

/// A `ClientSession` connected to a host over TCP.
pub struct NetClient<S> {
    session: ClientSession<S>,
    inbox: Receiver<Inbound>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl<S: Simulation> NetClient<S> {
    /// Connect to `endpoint` and send `Join` for `group`. The handshake
    /// continues as messages are polled.
    pub fn connect(
        endpoint: &ConnectionEndpoint,
        group: GroupSelector,
        config: SessionConfig,
        simulation: S,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = connect_stream(endpoint, timeout)?;
        let reader_stream = stream.try_clone()?;

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || {
            reader_loop(BufReader::new(reader_stream), tx);
        });

        let link = TcpLink::new(stream)?;
        let mut session = ClientSession::new(config, Box::new(link), simulation);
        session.join(group)?;

        Ok(NetClient {
            session,
            inbox: rx,
            _reader_thread: Some(reader_thread),
        })
    }

    pub fn session(&self) -> &ClientSession<S> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ClientSession<S> {
        &mut self.session
    }

    pub fn state(&self) -> ClientState {
        self.session.state()
    }

    /// Feed every queued message to the session (non-blocking). Returns how
    /// many were handled.
    pub fn poll(&mut self) -> Result<usize, SessionError> {
        let mut handled = 0;
        while let Ok(inbound) = self.inbox.try_recv() {
            match inbound {
                Inbound::Message(message) => self.session.handle_message(message)?,
                Inbound::Closed => self.session.handle_disconnect(),
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Poll, then run every step the host currently allows.
    pub fn tick(&mut self) -> Result<(), SessionError> {
        self.poll()?;
        self.session.tick()
    }

    pub fn quit(&mut self) {
        self.session.quit();
    }
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: BufReader<TcpStream>, tx: Sender<Inbound>) {
    loop {
        match read_frame::<_, ServerMessage>(&mut reader) {
            Ok(message) => {
                if tx.send(Inbound::Message(message)).is_err() {
                    return; // Session dropped the receiver
                }
            }
            Err(e) => {
                debug!(error = %e, "host stream ended");
                let _ = tx.send(Inbound::Closed);
                return;
            }
        }
    }
}
