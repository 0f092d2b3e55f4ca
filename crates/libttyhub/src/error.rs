use thiserror::Error;
use ttyhub_protocol::{ErrorCode, SessionId};

#[derive(Error, Debug)]
pub enum HubError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("not attached to session {0}")]
    NotAttached(SessionId),

    #[error("already attached to session {0}")]
    AlreadyAttached(SessionId),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Convert to a protocol error code and a message safe to show a viewer.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            HubError::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
            HubError::CommandRejected(_) => (ErrorCode::CommandRejected, self.to_string()),
            HubError::NotAttached(_) => (ErrorCode::NotAttached, self.to_string()),
            HubError::AlreadyAttached(_) => (ErrorCode::AlreadyAttached, self.to_string()),
            HubError::Spawn(_) => (ErrorCode::SpawnFailed, self.to_string()),
            HubError::Pty(_) => (ErrorCode::ServerError, self.to_string()),
            HubError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
