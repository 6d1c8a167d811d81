// `Link` over a TCP stream.
//
// Sends never wait on the peer. Each link owns a writer thread that drains a
// queue of encoded frames into the socket, so `send` only encodes and
// enqueues. A peer that stops reading lets the queue grow until
// `queue_limit` bytes are waiting; after that `send` fails with
// `WouldBlock` and the session drops that peer as lost. A single socket
// write that stalls for `WRITE_TIMEOUT` fails the link the same way.
//
// `close` drops the queue's sender. The writer finishes what was already
// queued, so a final `Error` or `Shutdown` still goes out, then shuts the
// socket down in both directions, which also ends the reader thread on the
// other half.

use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use lockstep_core::link::Link;
use lockstep_protocol::framing::encode_frame;
use serde::Serialize;
use tracing::debug;

/// Bytes a link holds for a peer before refusing further messages.
pub const DEFAULT_QUEUE_LIMIT: usize = 32 * 1024 * 1024;

/// Longest one socket write may stall before the link is given up.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared with the writer thread.
#[derive(Default)]
struct WriterState {
    queued_bytes: AtomicUsize,
    failed: AtomicBool,
}

pub struct TcpLink<M> {
    outgoing: Option<Sender<Vec<u8>>>,
    state: Arc<WriterState>,
    queue_limit: usize,
    _message: PhantomData<fn(&M)>,
}

impl<M> TcpLink<M> {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        Self::with_queue_limit(stream, DEFAULT_QUEUE_LIMIT)
    }

    /// A link that refuses messages once `queue_limit` bytes are waiting. A
    /// single larger message is still accepted into an empty queue.
    pub fn with_queue_limit(stream: TcpStream, queue_limit: usize) -> io::Result<Self> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let (tx, rx) = mpsc::channel();
        let state = Arc::new(WriterState::default());
        let writer_state = state.clone();
        thread::Builder::new()
            .name("link-writer".into())
            .spawn(move || writer_loop(BufWriter::new(stream), rx, &writer_state))?;
        Ok(TcpLink {
            outgoing: Some(tx),
            state,
            queue_limit,
            _message: PhantomData,
        })
    }
}

impl<M: Serialize> Link<M> for TcpLink<M> {
    fn send(&mut self, message: &M) -> io::Result<()> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link closed"))?;
        if self.state.failed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link write failed"));
        }

        let frame = encode_frame(message)?;
        let queued = self.state.queued_bytes.load(Ordering::SeqCst);
        if queued > 0 && queued + frame.len() > self.queue_limit {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("peer is not reading ({queued} bytes queued)"),
            ));
        }
        self.state
            .queued_bytes
            .fetch_add(frame.len(), Ordering::SeqCst);
        outgoing
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link writer stopped"))
    }

    /// Stop accepting messages. Already queued ones are still delivered
    /// before the socket is shut down.
    fn close(&mut self) {
        self.outgoing = None;
    }
}

/// Writes queued frames until the link is closed or a write fails, flushing
/// whenever the queue runs dry.
fn writer_loop(mut writer: BufWriter<TcpStream>, rx: Receiver<Vec<u8>>, state: &WriterState) {
    while let Ok(frame) = rx.recv() {
        let mut result = write_queued(&mut writer, &frame, state);
        while result.is_ok() {
            match rx.try_recv() {
                Ok(frame) => result = write_queued(&mut writer, &frame, state),
                Err(_) => break,
            }
        }
        if let Err(e) = result.and_then(|()| writer.flush()) {
            debug!(error = %e, "link write failed");
            state.failed.store(true, Ordering::SeqCst);
            break;
        }
    }
    if let Err(e) = writer.get_ref().shutdown(Shutdown::Both) {
        debug!(error = %e, "socket shutdown");
    }
}

fn write_queued(
    writer: &mut BufWriter<TcpStream>,
    frame: &[u8],
    state: &WriterState,
) -> io::Result<()> {
    writer.write_all(frame)?;
    state.queued_bytes.fetch_sub(frame.len(), Ordering::SeqCst);
    Ok(())
}
