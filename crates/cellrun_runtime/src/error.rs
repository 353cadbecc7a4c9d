use thiserror::Error;

use crate::engine::{InstanceId, Termination};

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the engine runtime.
///
/// Variants carry rendered messages rather than source errors so the error can be
/// cloned into every waiter of a shared instance future.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("Failed to load engine module: {0}")]
    EngineLoad(String),

    #[error("Failed to start engine runtime: {0}")]
    Startup(String),

    #[error("Engine readiness handshake failed: {0}")]
    Handshake(String),

    #[error("Engine instance {instance} crashed: {termination}")]
    Crashed {
        instance: InstanceId,
        termination: Termination,
    },

    #[error("Engine instance {instance} is not running")]
    NotRunning { instance: InstanceId },
}

impl RuntimeError {
    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::EngineLoad(_) => "EngineLoadError",
            RuntimeError::Startup(_) => "StartupError",
            RuntimeError::Handshake(_) => "HandshakeError",
            RuntimeError::Crashed { .. } => "CrashError",
            RuntimeError::NotRunning { .. } => "NotRunningError",
        }
    }
}
