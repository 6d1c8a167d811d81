// Session-level error type.
//
// Every fatal condition that can end a peer's participation is a
// `SessionError`, and every variant maps to exactly one wire `ErrorCode`
// (`reason_code()`), which is what the other side is told before the
// connection closes. On the host, an error while handling one peer closes
// only that peer; on a client, any error ends the session.
//
// Module-local failures (`CredentialError`, `ConfigError`, `RegistryError`,
// `HandshakeError`) convert into `SessionError` at the session boundary.

use lockstep_protocol::types::ErrorCode;
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::handshake::HandshakeError;
use crate::registry::RegistryError;

/// Errors that end a peer's participation in a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A message arrived that is malformed or not allowed in the current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer failed an admission check.
    #[error("authorization failed: {0}")]
    AuthFailure(ErrorCode),

    /// The peer broke a session policy after admission (command flood,
    /// issuing commands it may not issue, timeouts, kicks).
    #[error("refused: {0}")]
    Refused(ErrorCode),

    /// The local state digest differs from the host's at `tick`.
    #[error("desync detected at tick {tick}")]
    DesyncDetected { tick: u64 },

    /// The transport to the other side is gone.
    #[error("connection lost")]
    ConnectionLost,

    /// No free slot for another participant.
    #[error("session is full")]
    CapacityExceeded,

    /// A local resource (randomness, storage, socket) could not be obtained.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Session state could not be produced or loaded.
    #[error("snapshot failed: {0}")]
    Snapshot(String),

    /// The other side ended the session with an error of its own.
    #[error("closed by remote: {0}")]
    Remote(ErrorCode),
}

impl SessionError {
    /// Wire reason reported to the other side.
    pub fn reason_code(&self) -> ErrorCode {
        match self {
            SessionError::ProtocolViolation(_) => ErrorCode::IllegalPacket,
            SessionError::AuthFailure(code)
            | SessionError::Refused(code)
            | SessionError::Remote(code) => *code,
            SessionError::DesyncDetected { .. } => ErrorCode::Desync,
            SessionError::ConnectionLost => ErrorCode::ConnectionLost,
            SessionError::CapacityExceeded => ErrorCode::ServerFull,
            SessionError::ResourceUnavailable(_) => ErrorCode::General,
            SessionError::Snapshot(_) => ErrorCode::SnapshotFailed,
        }
    }
}

impl From<HandshakeError> for SessionError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Rejected(code) => SessionError::AuthFailure(code),
            other => SessionError::ProtocolViolation(other.to_string()),
        }
    }
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Full { .. } => SessionError::CapacityExceeded,
            other => SessionError::ResourceUnavailable(other.to_string()),
        }
    }
}

impl From<CredentialError> for SessionError {
    fn from(err: CredentialError) -> Self {
        SessionError::ResourceUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_failure_has_a_wire_reason() {
        assert_eq!(
            SessionError::DesyncDetected { tick: 500 }.reason_code(),
            ErrorCode::Desync
        );
        assert_eq!(
            SessionError::CapacityExceeded.reason_code(),
            ErrorCode::ServerFull
        );
        assert_eq!(
            SessionError::AuthFailure(ErrorCode::WrongPassword).reason_code(),
            ErrorCode::WrongPassword
        );
        assert_eq!(
            SessionError::ProtocolViolation("late command".into()).reason_code(),
            ErrorCode::IllegalPacket
        );
    }

    #[test]
    fn handshake_rejection_keeps_its_code() {
        let err: SessionError = HandshakeError::Rejected(ErrorCode::NameInUse).into();
        assert_eq!(err.reason_code(), ErrorCode::NameInUse);
    }

    #[test]
    fn full_registry_is_capacity_exceeded() {
        let err: SessionError = RegistryError::Full { capacity: 4 }.into();
        assert!(matches!(err, SessionError::CapacityExceeded));
    }
}
