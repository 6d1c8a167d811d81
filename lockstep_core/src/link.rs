// Outbound message links.
//
// A `Link` is the write half of a connection to one peer. The session engine
// only ever pushes messages into links; reading is done elsewhere (reader
// threads in `lockstep_relay`, or the test harness) and fed back into the
// session as method calls.
//
// `ChannelLink` delivers into an `mpsc` channel, which lets the whole
// session engine run in-process without sockets. The TCP implementation
// lives in `lockstep_relay::link`.

use std::io;
use std::sync::mpsc::{self, Receiver, Sender};

/// Write half of a connection.
pub trait Link<M>: Send {
    /// Queue one message for delivery. An error means the link is dead.
    fn send(&mut self, message: &M) -> io::Result<()>;

    /// Release the underlying transport. Further sends fail.
    fn close(&mut self) {}
}

/// In-memory link backed by an `mpsc` channel.
pub struct ChannelLink<M> {
    tx: Option<Sender<M>>,
}

impl<M> ChannelLink<M> {
    /// Create a link and the receiving end that observes everything sent
    /// through it.
    pub fn pair() -> (Self, Receiver<M>) {
        let (tx, rx) = mpsc::channel();
        (ChannelLink { tx: Some(tx) }, rx)
    }
}

impl<M: Clone + Send> Link<M> for ChannelLink<M> {
    fn send(&mut self, message: &M) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link closed"))?;
        tx.send(message.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped"))
    }

    fn close(&mut self) {
        self.tx = None;
    }
}
