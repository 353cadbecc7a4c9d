use std::time::Duration;

use cellrun_runtime::RuntimeError;
use thiserror::Error;

use crate::notebook::DocumentId;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Engine did not signal readiness within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Failed to run `{program}`: {reason}")]
    Process { program: String, reason: String },

    #[error("Session of {0} ended before its engine instance was running")]
    Stopped(DocumentId),
}

impl SessionError {
    /// Short machine-friendly name of the error kind, used as the name of error outputs.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Runtime(e) => e.kind(),
            SessionError::HandshakeTimeout(_) => "HandshakeTimeout",
            SessionError::Process { .. } => "ProcessError",
            SessionError::Stopped(_) => "NotRunningError",
        }
    }
}
