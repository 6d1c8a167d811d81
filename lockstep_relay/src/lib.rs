// lockstep_relay: TCP transport and standalone host for lockstep sessions.
//
// `lockstep_core` holds the whole session engine and does no I/O. This crate
// plugs it into `std::net`: a listener thread and one reader thread per peer
// feed a single driving thread that owns the `HostSession`, and a small
// client driver does the same for a joining peer.
//
// Module overview:
// - `server.rs`:    Listener, reader threads, and the host main loop that
//                   paces ticks with `recv_timeout`. `start_host` embeds a
//                   host in any process.
// - `client.rs`:    `NetClient`: TCP connect, reader thread, and an inbox
//                   drained into a `ClientSession`.
// - `link.rs`:      `TcpLink`, the socket-backed `Link`, with a writer
//                   thread per peer.
// - `connecter.rs`: Blocking connects with timeouts, plus threaded server
//                   queries that report through `PendingConnections`.
// - `query.rs`:     `ServerQuery` background service and `run_queries`.
//
// The `lockstep-host` binary (`main.rs`) wraps all of this in a CLI.

pub mod client;
pub mod connecter;
pub mod link;
pub mod query;
pub mod server;

pub use client::NetClient;
pub use server::{HostHandle, start_host, start_host_with};
