// Session-independent background services.
//
// Some connections have nothing to do with the running session: server-list
// queries, registration with a rendezvous coordinator, content lookups. They
// are pumped once per iteration of the driving loop by `BackgroundLoop`,
// whether or not a session exists, and a failure in any of them only
// changes that service's own records.
//
// Outbound connects are callback-style. `PendingConnections::begin` hands
// out a `Completion` that a transport thread resolves when the connect (and
// whatever else it does off-thread) succeeds or fails. The handler's
// `on_connect` / `on_failure` then runs on the driving thread the next time
// the owning service calls `check_callbacks`. No handler runs on the
// transport thread, and none may block. `kill_all` cancels every pending
// attempt at once; completions that arrive afterwards are dropped.
//
// A hosting process advertises its session through the coordinator while
// the session's game type asks for it, and withdraws only that registration
// when it stops hosting (`close_hosted`). A process that only queried or
// joined drops every coordinator connection instead (`close`).
//
// `ServerList` is the record a query service keeps: one entry per normalized
// `address:port`, with its last known status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

use lockstep_protocol::message::ServerInfo;
use tracing::{debug, info, warn};

use crate::config::ServerGameType;
use crate::endpoint::normalize_connection_string;

/// A service pumped once per driving-loop iteration.
pub trait BackgroundService {
    fn name(&self) -> &str;

    /// Exchange pending data without blocking and fire due callbacks.
    fn send_receive(&mut self);

    /// Drop every connection the service holds.
    fn close(&mut self) {}
}

/// Client of a rendezvous coordinator that advertises the session.
pub trait CoordinatorClient {
    /// Advertise the hosted session, or refresh its advertisement.
    fn register(&mut self, info: &ServerInfo);
    /// Withdraw the hosted session's registration.
    fn close_connection(&mut self);
    /// Drop every coordinator connection, lookups included.
    fn close_all_connections(&mut self);
    fn send_receive(&mut self);
}

/// Runs the coordinator and every registered service.
#[derive(Default)]
pub struct BackgroundLoop {
    coordinator: Option<Box<dyn CoordinatorClient>>,
    services: Vec<Box<dyn BackgroundService>>,
}

impl BackgroundLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_coordinator(&mut self, coordinator: Box<dyn CoordinatorClient>) {
        self.coordinator = Some(coordinator);
    }

    /// Register the hosted session when `game_type` is advertised, or
    /// withdraw its registration when it is `Local`.
    pub fn advertise(&mut self, game_type: ServerGameType, info: &ServerInfo) {
        let Some(coordinator) = self.coordinator.as_mut() else {
            return;
        };
        if game_type.is_advertised() {
            info!(server = %info.server_name, ?game_type, "registering with coordinator");
            coordinator.register(info);
        } else {
            info!(server = %info.server_name, "withdrawing coordinator registration");
            coordinator.close_connection();
        }
    }

    pub fn register(&mut self, service: Box<dyn BackgroundService>) {
        debug!(service = service.name(), "background service registered");
        self.services.push(service);
    }

    /// One pass over everything. Called every iteration of the driving loop.
    pub fn run_once(&mut self) {
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.send_receive();
        }
        for service in &mut self.services {
            service.send_receive();
        }
    }

    /// Teardown after hosting: withdraw the session's registration and close
    /// all services.
    pub fn close_hosted(&mut self) {
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.close_connection();
        }
        self.close_services();
    }

    /// Full teardown: every coordinator connection and all services.
    pub fn close(&mut self) {
        if let Some(coordinator) = self.coordinator.as_mut() {
            coordinator.close_all_connections();
        }
        self.close_services();
    }

    fn close_services(&mut self) {
        for service in &mut self.services {
            service.close();
        }
    }
}

/// Receives the result of one outbound connect, with access to the owning
/// service's state `X`.
pub trait ConnectHandler<C, X> {
    fn on_connect(self: Box<Self>, connection: C, context: &mut X);
    fn on_failure(self: Box<Self>, error: &str, context: &mut X);
}

type Outcome<C> = (u64, Result<C, String>);

/// Resolves one pending connect. Sendable to a transport thread.
pub struct Completion<C> {
    id: u64,
    tx: Sender<Outcome<C>>,
    cancelled: Arc<AtomicBool>,
}

impl<C> Completion<C> {
    /// Whether the attempt was cancelled; a transport thread may stop early.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn succeed(self, connection: C) {
        self.finish(Ok(connection));
    }

    pub fn fail(self, error: impl Into<String>) {
        self.finish(Err(error.into()));
    }

    fn finish(self, outcome: Result<C, String>) {
        if !self.is_cancelled() {
            let _ = self.tx.send((self.id, outcome));
        }
    }
}

struct PendingAttempt<C, X> {
    handler: Box<dyn ConnectHandler<C, X>>,
    cancelled: Arc<AtomicBool>,
}

/// Outbound connects waiting for their outcome.
pub struct PendingConnections<C, X> {
    next_id: u64,
    attempts: BTreeMap<u64, PendingAttempt<C, X>>,
    tx: Sender<Outcome<C>>,
    rx: Receiver<Outcome<C>>,
}

impl<C, X> Default for PendingConnections<C, X> {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel();
        PendingConnections {
            next_id: 0,
            attempts: BTreeMap::new(),
            tx,
            rx,
        }
    }
}

impl<C, X> PendingConnections<C, X> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an attempt. The caller hands the returned completion to
    /// whatever performs the connect.
    pub fn begin(&mut self, handler: Box<dyn ConnectHandler<C, X>>) -> Completion<C> {
        let id = self.next_id;
        self.next_id += 1;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.attempts.insert(
            id,
            PendingAttempt {
                handler,
                cancelled: cancelled.clone(),
            },
        );
        Completion {
            id,
            tx: self.tx.clone(),
            cancelled,
        }
    }

    pub fn pending(&self) -> usize {
        self.attempts.len()
    }

    /// Fire the handlers of every attempt that finished. Returns how many
    /// fired.
    pub fn check_callbacks(&mut self, context: &mut X) -> usize {
        let mut fired = 0;
        while let Ok((id, outcome)) = self.rx.try_recv() {
            let Some(attempt) = self.attempts.remove(&id) else {
                continue;
            };
            match outcome {
                Ok(connection) => attempt.handler.on_connect(connection, context),
                Err(error) => attempt.handler.on_failure(&error, context),
            }
            fired += 1;
        }
        fired
    }

    /// Cancel every pending attempt without firing handlers.
    pub fn kill_all(&mut self) {
        for attempt in self.attempts.values() {
            attempt.cancelled.store(true, Ordering::SeqCst);
        }
        self.attempts.clear();
        while self.rx.try_recv().is_ok() {}
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Unknown,
    Online(ServerInfo),
    Offline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerEntry {
    pub connection_string: String,
    pub status: ServerStatus,
    pub refreshing: bool,
    /// Added by the user rather than discovered.
    pub manually: bool,
}

/// Known servers and their last query results.
#[derive(Clone, Debug)]
pub struct ServerList {
    default_port: u16,
    entries: BTreeMap<String, ServerEntry>,
}

impl ServerList {
    pub fn new(default_port: u16) -> Self {
        ServerList {
            default_port,
            entries: BTreeMap::new(),
        }
    }

    fn key(&self, connection_string: &str) -> String {
        normalize_connection_string(connection_string, self.default_port)
    }

    /// Add a server, or mark an existing one manual. Returns the entry key.
    pub fn add(&mut self, connection_string: &str, manually: bool) -> String {
        let key = self.key(connection_string);
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| ServerEntry {
                connection_string: key.clone(),
                status: ServerStatus::Unknown,
                refreshing: false,
                manually: false,
            });
        entry.manually |= manually;
        key
    }

    pub fn get(&self, connection_string: &str) -> Option<&ServerEntry> {
        self.entries.get(&self.key(connection_string))
    }

    pub fn remove(&mut self, connection_string: &str) -> Option<ServerEntry> {
        let key = self.key(connection_string);
        self.entries.remove(&key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ServerEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mark_refreshing(&mut self, connection_string: &str) {
        let key = self.key(connection_string);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refreshing = true;
        }
    }

    pub fn on_query_response(&mut self, connection_string: &str, info: ServerInfo) {
        let key = self.add(connection_string, false);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.status = ServerStatus::Online(info);
            entry.refreshing = false;
        }
    }

    /// A query failed. Only this entry changes.
    pub fn on_query_failure(&mut self, connection_string: &str, error: &str) {
        let key = self.key(connection_string);
        if let Some(entry) = self.entries.get_mut(&key) {
            warn!(server = %key, error, "server query failed");
            entry.status = ServerStatus::Offline;
            entry.refreshing = false;
        }
    }

    /// Normalized strings of manually added servers, for persisting.
    pub fn rebuild_known_hosts(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.manually)
            .map(|e| e.connection_string.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct Log {
        connected: Vec<u32>,
        failed: Vec<String>,
    }

    struct Recorder;

    impl ConnectHandler<u32, Log> for Recorder {
        fn on_connect(self: Box<Self>, connection: u32, context: &mut Log) {
            context.connected.push(connection);
        }
        fn on_failure(self: Box<Self>, error: &str, context: &mut Log) {
            context.failed.push(error.to_string());
        }
    }

    #[test]
    fn callbacks_fire_only_on_check() {
        let mut pending = PendingConnections::<u32, Log>::new();
        let mut log = Log::default();
        let ok = pending.begin(Box::new(Recorder));
        let bad = pending.begin(Box::new(Recorder));

        let worker = thread::spawn(move || {
            ok.succeed(7);
            bad.fail("refused");
        });
        worker.join().unwrap();

        assert!(log.connected.is_empty());
        assert_eq!(pending.check_callbacks(&mut log), 2);
        assert_eq!(log.connected, vec![7]);
        assert_eq!(log.failed, vec!["refused".to_string()]);
        assert_eq!(pending.pending(), 0);
    }

    #[test]
    fn killed_attempts_never_fire() {
        let mut pending = PendingConnections::<u32, Log>::new();
        let mut log = Log::default();
        let completion = pending.begin(Box::new(Recorder));
        pending.kill_all();
        assert!(completion.is_cancelled());
        completion.succeed(1);
        assert_eq!(pending.check_callbacks(&mut log), 0);
        assert!(log.connected.is_empty());
    }

    struct Counting {
        runs: Rc<Cell<u32>>,
        closed: Rc<Cell<bool>>,
    }

    impl BackgroundService for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn send_receive(&mut self) {
            self.runs.set(self.runs.get() + 1);
        }
        fn close(&mut self) {
            self.closed.set(true);
        }
    }

    #[derive(Default)]
    struct FakeCoordinator {
        pumps: Rc<Cell<u32>>,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl CoordinatorClient for FakeCoordinator {
        fn register(&mut self, info: &ServerInfo) {
            self.calls
                .borrow_mut()
                .push(format!("register {}", info.server_name));
        }
        fn close_connection(&mut self) {
            self.calls.borrow_mut().push("close_connection".into());
        }
        fn close_all_connections(&mut self) {
            self.calls.borrow_mut().push("close_all_connections".into());
        }
        fn send_receive(&mut self) {
            self.pumps.set(self.pumps.get() + 1);
        }
    }

    #[test]
    fn loop_pumps_everything_each_pass() {
        let runs = Rc::new(Cell::new(0));
        let closed = Rc::new(Cell::new(false));
        let coordinator = FakeCoordinator::default();
        let pumps = coordinator.pumps.clone();
        let calls = coordinator.calls.clone();

        let mut background = BackgroundLoop::new();
        background.set_coordinator(Box::new(coordinator));
        background.register(Box::new(Counting {
            runs: runs.clone(),
            closed: closed.clone(),
        }));
        for _ in 0..3 {
            background.run_once();
        }
        assert_eq!(runs.get(), 3);
        assert_eq!(pumps.get(), 3);

        background.close();
        assert!(closed.get());
        assert_eq!(*calls.borrow(), vec!["close_all_connections".to_string()]);
    }

    fn info(name: &str) -> ServerInfo {
        ServerInfo {
            server_name: name.into(),
            clients_on: 1,
            max_clients: 4,
            spectators_on: 0,
            tick: 10,
            paused: false,
            password_required: false,
        }
    }

    #[test]
    fn hosting_registers_and_withdraws_only_its_registration() {
        let coordinator = FakeCoordinator::default();
        let calls = coordinator.calls.clone();
        let closed = Rc::new(Cell::new(false));
        let mut background = BackgroundLoop::new();
        background.set_coordinator(Box::new(coordinator));
        background.register(Box::new(Counting {
            runs: Rc::new(Cell::new(0)),
            closed: closed.clone(),
        }));

        background.advertise(ServerGameType::Public, &info("Harbor"));
        background.advertise(ServerGameType::Local, &info("Harbor"));
        background.advertise(ServerGameType::InviteOnly, &info("Harbor"));
        background.close_hosted();

        assert_eq!(
            *calls.borrow(),
            vec![
                "register Harbor".to_string(),
                "close_connection".to_string(),
                "register Harbor".to_string(),
                "close_connection".to_string(),
            ]
        );
        assert!(closed.get());
    }

    #[test]
    fn advertising_without_a_coordinator_is_a_no_op() {
        let mut background = BackgroundLoop::new();
        background.advertise(ServerGameType::Public, &info("Harbor"));
        background.close_hosted();
    }

    #[test]
    fn server_list_keys_are_normalized() {
        let mut list = ServerList::new(3979);
        let key = list.add("example.net#3", true);
        assert_eq!(key, "example.net:3979");
        list.add("example.net:3979", false);
        assert_eq!(list.len(), 1);
        assert!(list.get("example.net").unwrap().manually);
    }

    #[test]
    fn failed_query_only_marks_its_entry() {
        let mut list = ServerList::new(3979);
        list.add("a.example", true);
        list.add("b.example", false);
        list.mark_refreshing("a.example");
        list.mark_refreshing("b.example");

        list.on_query_response("b.example", info("B"));
        list.on_query_failure("a.example", "connection refused");

        let a = list.get("a.example").unwrap();
        assert_eq!(a.status, ServerStatus::Offline);
        assert!(!a.refreshing);
        let b = list.get("b.example").unwrap();
        assert_eq!(b.status, ServerStatus::Online(info("B")));
        assert_eq!(list.rebuild_known_hosts(), vec!["a.example:3979".to_string()]);
    }
}
