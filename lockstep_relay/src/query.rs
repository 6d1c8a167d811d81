// Server-list query service.
//
// `ServerQuery` is a `BackgroundService` that refreshes entries of a shared
// `ServerList`. Each `query` marks the entry refreshing and starts a
// `connecter::spawn_query` thread; results land in the list the next time
// the background loop pumps the service. A failing server only goes
// Offline; the other entries are untouched.
//
// `run_queries` is the blocking convenience used by the `query` subcommand:
// it queries every given server through a `BackgroundLoop` and returns the
// list once everything has answered or the deadline passes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use lockstep_core::background::{
    BackgroundLoop, BackgroundService, ConnectHandler, PendingConnections, ServerList,
};
use lockstep_core::endpoint::ConnectionEndpoint;
use lockstep_protocol::message::ServerInfo;
use tracing::{debug, info};

use crate::connecter::spawn_query;

/// A server list shared between a `ServerQuery` and whoever displays it.
pub type SharedServerList = Arc<Mutex<ServerList>>;

fn lock(list: &SharedServerList) -> MutexGuard<'_, ServerList> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

struct QueryHandler {
    key: String,
}

impl ConnectHandler<ServerInfo, ServerList> for QueryHandler {
    fn on_connect(self: Box<Self>, info: ServerInfo, list: &mut ServerList) {
        info!(
            server = %self.key,
            name = %info.server_name,
            clients = info.clients_on,
            "server answered"
        );
        list.on_query_response(&self.key, info);
    }

    fn on_failure(self: Box<Self>, error: &str, list: &mut ServerList) {
        list.on_query_failure(&self.key, error);
    }
}

pub struct ServerQuery {
    list: SharedServerList,
    default_port: u16,
    timeout: Duration,
    pending: PendingConnections<ServerInfo, ServerList>,
}

impl ServerQuery {
    pub fn new(list: SharedServerList, default_port: u16, timeout: Duration) -> Self {
        ServerQuery {
            list,
            default_port,
            timeout,
            pending: PendingConnections::new(),
        }
    }

    /// Start refreshing `connection_string`, adding it to the list if new.
    pub fn query(&mut self, connection_string: &str, manually: bool) {
        let key = {
            let mut list = lock(&self.list);
            let key = list.add(connection_string, manually);
            list.mark_refreshing(&key);
            key
        };
        let endpoint = ConnectionEndpoint::parse(&key, self.default_port);
        debug!(server = %key, "querying");
        let completion = self.pending.begin(Box::new(QueryHandler { key }));
        spawn_query(endpoint, self.timeout, completion);
    }

    pub fn pending(&self) -> usize {
        self.pending.pending()
    }
}

impl BackgroundService for ServerQuery {
    fn name(&self) -> &str {
        "server-query"
    }

    fn send_receive(&mut self) {
        let mut list = lock(&self.list);
        self.pending.check_callbacks(&mut *list);
    }

    fn close(&mut self) {
        self.pending.kill_all();
    }
}

/// Query every server in `servers` and wait for the answers.
pub fn run_queries(servers: &[String], default_port: u16, timeout: Duration) -> ServerList {
    let list: SharedServerList = Arc::new(Mutex::new(ServerList::new(default_port)));
    let mut query = ServerQuery::new(list.clone(), default_port, timeout);
    for server in servers {
        query.query(server, true);
    }

    let mut background = BackgroundLoop::new();
    background.register(Box::new(query));

    // Each query thread gives up after its own timeouts; this bounds the
    // wait in case one is slow to notice.
    let deadline = Instant::now() + timeout * 3;
    loop {
        background.run_once();
        let refreshing = lock(&list).entries().any(|e| e.refreshing);
        if !refreshing || Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    background.close();

    lock(&list).clone()
}
