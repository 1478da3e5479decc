use thiserror::Error;

use crate::state::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("invalid state {current:?}, expected one of {expected:?}")]
    InvalidState {
        current: Option<ConnectionState>,
        expected: Vec<ConnectionState>,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("no transport available")]
    TransportUnavailable,

    #[error("stanza rejected by interceptor")]
    StanzaRejected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("module error: {0}")]
    Module(String),

    #[error("invalid JID {0}")]
    InvalidJid(String),
}

impl ClientError {
    /// Whether retrying the same operation on a fresh connection can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::TransportUnavailable
                | ClientError::Transport(_)
                | ClientError::Timeout
                | ClientError::Cancelled(_)
        )
    }
}

pub(crate) fn map_io_error(error: std::io::Error) -> ClientError {
    match error.kind() {
        std::io::ErrorKind::TimedOut => ClientError::Timeout,
        _ => ClientError::Transport(error.to_string()),
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed XML: {0}")]
    Malformed(String),

    #[error("buffer exceeded {limit} bytes without a complete stanza")]
    BufferOverflow { limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for ClientError {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Io(e) => map_io_error(e),
            other => ClientError::Transport(other.to_string()),
        }
    }
}
