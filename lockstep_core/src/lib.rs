// lockstep_core: deterministic lockstep session engine.
//
// Every participant runs the same deterministic simulation. The host decides
// which commands run at which tick and how far everyone may advance; peers
// follow exactly. This crate holds all of that logic and no I/O: messages
// go out through the `Link` trait and come in through `handle_message`
// calls, so the whole engine runs single-threaded and is testable in
// memory. `lockstep_relay` supplies the TCP side.
//
// Module overview:
// - `host.rs`:        `HostSession`, the authoritative side. Admits peers,
//                     distributes commands, sends frames and sync records,
//                     enforces lag and handshake timeouts, runs the pause
//                     policies.
// - `client.rs`:      `ClientSession`, the peer side. Loads the snapshot,
//                     executes distributed commands, acknowledges progress,
//                     checks sync records.
// - `registry.rs`:    Generation-checked participant table.
// - `handshake.rs`:   Per-peer admission state machine and timeouts.
// - `clock.rs`:       Tick counters, boundaries, lag.
// - `commands.rs`:    Pending/execution queues, pause command payloads.
// - `pause.rs`:       Pause reason mask and the automatic pause policies.
// - `desync.rs`:      Digest comparison with bounded history.
// - `simulation.rs`:  The `Simulation` trait and a reference implementation.
// - `credentials.rs`: Password hashing, randomness, sealed secret storage.
// - `endpoint.rs`:    Connection-string parsing.
// - `background.rs`:  Background service multiplexer, pending connection
//                     callbacks, server list.
// - `config.rs`:      `SessionConfig`, loaded from and saved to JSON.
// - `link.rs`, `event.rs`, `error.rs`: seams shared by the above.
//
// Dependencies: `lockstep_protocol` for the wire vocabulary, `tracing` for
// logs (the `desync` target carries the per-tick command trace), `thiserror`
// for errors, and the RustCrypto crates for credentials.

pub mod background;
pub mod client;
pub mod clock;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod desync;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod handshake;
pub mod host;
pub mod link;
pub mod pause;
pub mod registry;
pub mod simulation;

pub use client::{ClientSession, ClientState};
pub use config::SessionConfig;
pub use endpoint::ConnectionEndpoint;
pub use error::SessionError;
pub use event::SessionEvent;
pub use host::HostSession;
pub use link::{ChannelLink, Link};
pub use pause::PauseMode;
pub use simulation::{HashChainSimulation, Simulation};
