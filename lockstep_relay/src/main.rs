// CLI entry point for the lockstep session host.
//
// Subcommands:
//   lockstep-host host  [--config PATH] [--port N] [--name NAME] [--password PASS]
//                       [--dedicated] [--bind IP] [--seed N] [--duration SECS]
//   lockstep-host query [SERVER...] [--config PATH] [--timeout-ms N]
//   lockstep-host join  CONNECTION_STRING [--config PATH] [--name NAME]
//                       [--password PASS] [--group-password PASS] [--duration SECS]
//
// `host` runs a session with the reference `HashChainSimulation` until
// killed (or for `--duration` seconds). `query` prints the server list
// entries for the given servers, or for `known_servers` from the config,
// and records the queried servers in the config file when one is given.
// `join` connects as a peer and follows the session, logging events.
//
// Logging goes through `tracing`; set `RUST_LOG` to adjust (default
// `info`; `RUST_LOG=desync=debug` adds the per-command trace).

use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use lockstep_core::background::ServerStatus;
use lockstep_core::config::SessionConfig;
use lockstep_core::credentials::OsEntropy;
use lockstep_core::endpoint::ConnectionEndpoint;
use lockstep_core::simulation::HashChainSimulation;
use lockstep_protocol::types::GroupSelector;
use lockstep_relay::client::NetClient;
use lockstep_relay::query::run_queries;
use lockstep_relay::server::start_host;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lockstep-host")]
#[command(about = "Host, query, or join deterministic lockstep sessions")]
#[command(version)]
struct Cli {
    /// JSON session config; missing fields take their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session
    Host {
        /// Listen port (overrides the config)
        #[arg(long)]
        port: Option<u16>,

        /// Server name shown in server lists
        #[arg(long)]
        name: Option<String>,

        /// Session password
        #[arg(long)]
        password: Option<String>,

        /// Do not take part as a player
        #[arg(long)]
        dedicated: bool,

        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// Seed for the reference simulation
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Query servers for their status
    Query {
        /// Connection strings (`address[:port]`); defaults to known servers
        servers: Vec<String>,

        /// Per-server timeout in milliseconds
        #[arg(long, default_value = "3000")]
        timeout_ms: u64,
    },

    /// Join a session as a peer
    Join {
        /// `address[:port][#group]`; `#255` spectates
        connection_string: String,

        /// Player name
        #[arg(long)]
        name: Option<String>,

        /// Session password
        #[arg(long)]
        password: Option<String>,

        /// Password of the requested group
        #[arg(long)]
        group_password: Option<String>,

        /// Leave after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig, Box<dyn Error>> {
    match path {
        Some(path) => Ok(SessionConfig::load(path)?),
        None => Ok(SessionConfig::default()),
    }
}

fn deadline(duration: Option<u64>) -> Option<Instant> {
    duration.map(|secs| Instant::now() + Duration::from_secs(secs))
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Host {
            port,
            name,
            password,
            dedicated,
            bind,
            seed,
            duration,
        } => {
            if let Some(port) = port {
                config.server_port = port;
            }
            if let Some(name) = name {
                config.server_name = name;
            }
            if password.is_some() {
                config.session_password = password;
            }
            config.dedicated |= dedicated;
            config.validate()?;

            // Keys generated on first start are saved so sealed secrets stay
            // readable across restarts.
            let generated = config.ensure_storage_keys(&mut OsEntropy);
            if let (true, Some(path)) = (generated, &cli.config) {
                config.save(path)?;
                info!(path = %path.display(), "saved generated storage keys");
            }

            let tick = Duration::from_millis(config.tick_millis.max(1));
            let (handle, addr) = start_host(config, HashChainSimulation::new(seed), &bind)?;
            println!("Hosting on {addr}");

            let stop_at = deadline(duration);
            while !expired(stop_at) {
                for event in handle.poll_events() {
                    info!(?event, "session event");
                }
                thread::sleep(tick);
            }
            handle.stop();
        }

        Commands::Query {
            servers,
            timeout_ms,
        } => {
            let servers = if servers.is_empty() {
                config.known_servers.clone()
            } else {
                servers
            };
            if servers.is_empty() {
                warn!("no servers to query");
                return Ok(());
            }
            let list = run_queries(
                &servers,
                config.server_port,
                Duration::from_millis(timeout_ms),
            );
            for entry in list.entries() {
                match &entry.status {
                    ServerStatus::Online(info) => println!(
                        "{:<30} {:<24} {}/{} players, {} spectators, tick {}{}{}",
                        entry.connection_string,
                        info.server_name,
                        info.clients_on,
                        info.max_clients,
                        info.spectators_on,
                        info.tick,
                        if info.paused { ", paused" } else { "" },
                        if info.password_required { ", password" } else { "" },
                    ),
                    ServerStatus::Offline => println!("{:<30} offline", entry.connection_string),
                    ServerStatus::Unknown => println!("{:<30} no answer", entry.connection_string),
                }
            }

            // Servers named on the command line join the known list.
            if let Some(path) = &cli.config {
                for server in list.rebuild_known_hosts() {
                    if !config.known_servers.contains(&server) {
                        config.known_servers.push(server);
                    }
                }
                config.save(path)?;
            }
        }

        Commands::Join {
            connection_string,
            name,
            password,
            group_password,
            duration,
        } => {
            if let Some(name) = name {
                config.client_name = name;
            }
            if password.is_some() {
                config.session_password = password;
            }
            let endpoint = ConnectionEndpoint::parse(&connection_string, config.server_port);
            let group = endpoint.group.unwrap_or(GroupSelector::Group(0));
            if let (Some(password), Some(index)) = (group_password, group.index()) {
                config.group_passwords.insert(index, password);
            }

            let tick = Duration::from_millis(config.tick_millis.max(1));
            let mut client = NetClient::connect(
                &endpoint,
                group,
                config,
                HashChainSimulation::new(0),
                Duration::from_secs(5),
            )?;
            println!("Connected to {endpoint}");

            let stop_at = deadline(duration);
            while !client.session().is_closed() && !expired(stop_at) {
                client.tick()?;
                for event in client.session_mut().take_events() {
                    info!(?event, "session event");
                }
                thread::sleep(tick);
            }
            client.quit();
            let sync = client.session().sync_state();
            println!("Left at tick {} ({})", sync.tick, sync.digest);
        }
    }

    Ok(())
}
