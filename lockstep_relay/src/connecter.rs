// Outbound TCP connects.
//
// `connect_stream` resolves a `ConnectionEndpoint` and tries each resolved
// address in turn with a bounded timeout. It blocks, so the driving thread
// only calls it directly when blocking is acceptable (the join path, tests).
// Everything else goes through `spawn_query`, which runs on a short-lived
// thread and reports through a `Completion` that the owning service collects
// with `PendingConnections::check_callbacks`.

use std::io::{self, BufReader};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use lockstep_core::background::Completion;
use lockstep_core::endpoint::ConnectionEndpoint;
use lockstep_protocol::framing::{read_frame, write_frame};
use lockstep_protocol::message::{ClientMessage, ServerInfo, ServerMessage};
use tracing::debug;

/// Connect to `endpoint`, trying every address it resolves to.
pub fn connect_stream(endpoint: &ConnectionEndpoint, timeout: Duration) -> io::Result<TcpStream> {
    let target = endpoint.socket_string();
    let mut last_error = None;
    for addr in target.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{target} did not resolve to any address"),
        )
    }))
}

/// Ask a host for its `ServerInfo` and hang up.
pub fn query_server(
    endpoint: &ConnectionEndpoint,
    timeout: Duration,
) -> Result<ServerInfo, String> {
    let stream = connect_stream(endpoint, timeout).map_err(|e| e.to_string())?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| e.to_string())?;
    let mut writer = stream.try_clone().map_err(|e| e.to_string())?;
    write_frame(&mut writer, &ClientMessage::ServerInfoQuery).map_err(|e| e.to_string())?;

    let mut reader = BufReader::new(stream);
    match read_frame::<_, ServerMessage>(&mut reader).map_err(|e| e.to_string())? {
        ServerMessage::ServerInfo { info } => Ok(info),
        ServerMessage::Error { code } => Err(code.description().to_string()),
        other => Err(format!("unexpected reply: {other:?}")),
    }
}

/// Run `query_server` on its own thread and resolve `completion` with the
/// result.
pub fn spawn_query(
    endpoint: ConnectionEndpoint,
    timeout: Duration,
    completion: Completion<ServerInfo>,
) {
    thread::spawn(move || {
        if completion.is_cancelled() {
            return;
        }
        match query_server(&endpoint, timeout) {
            Ok(info) => completion.succeed(info),
            Err(error) => completion.fail(error),
        }
    });
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn refused_connect_is_an_error() {
        // Bind then drop to get a port nothing listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let endpoint = ConnectionEndpoint::parse(&format!("127.0.0.1:{port}"), 1);
        assert!(connect_stream(&endpoint, Duration::from_millis(500)).is_err());
        assert!(query_server(&endpoint, Duration::from_millis(500)).is_err());
    }
}
