use thiserror::Error;
use ttyhub_protocol::ErrorCode;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("program not found: {0}")]
    ProgramNotFound(u64),

    #[error("screen error: {0}")]
    Screen(String),

    #[error("persistence error: {0}")]
    Persist(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            SupervisorError::ProgramNotFound(_) => (ErrorCode::ProgramNotFound, self.to_string()),
            SupervisorError::Screen(_) => (ErrorCode::ServerError, self.to_string()),
            SupervisorError::Persist(_) => (ErrorCode::ServerError, self.to_string()),
            SupervisorError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
