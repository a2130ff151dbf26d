use std::io;

use thiserror::Error;

use crate::message::MessageType;

/// Failures surfaced by the session client.
///
/// Every operation on a closed session reports [`NetworkError::SessionExpired`],
/// so callers can branch on expiry (for example to offer a reconnect) without
/// inspecting I/O errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The socket could not be opened or the server refused the handshake.
    #[error("server {server} is unavailable: {reason}")]
    ServerUnavailable { server: String, reason: String },

    #[error("session expired")]
    SessionExpired,

    /// The payload does not have the shape the message type requires.
    #[error("cannot build {kind} message: {reason}")]
    MessageConstruction {
        kind: MessageType,
        reason: &'static str,
    },

    #[error("failed to transmit message: {0}")]
    Transmission(#[source] io::Error),

    #[error("no lock response for object {id} before the deadline")]
    LockTimeout { id: i64 },

    #[error("sequence numbers exhausted")]
    SequenceExhausted,
}

impl NetworkError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, NetworkError::SessionExpired)
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;
