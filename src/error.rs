//! Typed error taxonomy for the engine's component boundaries.
//!
//! Internal logic propagates `anyhow::Error` with `.context(...)`;
//! `EngineError` exists at the seams consumed by `main.rs` (to pick an
//! exit code) and by `run_result.json` (to record a stable, typed
//! `error` field).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("checkpoint at {path} is corrupt: {source}")]
    CorruptCheckpoint {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("experiment lock held at {path}: another process owns this experiment root")]
    ExperimentLockHeld { path: String },

    #[error("workspace setup failed: {0}")]
    WorkspaceSetupFailed(String),

    #[error("agent was rate limited: {0}")]
    AgentRateLimited(String),

    #[error("agent hit a transient failure: {0}")]
    AgentTransient(String),

    #[error("agent authentication failed: {0}")]
    AgentAuth(String),

    #[error("agent target not found: {0}")]
    AgentNotFound(String),

    #[error("agent invocation timed out after {timeout_secs}s")]
    AgentTimeout { timeout_secs: u64 },

    #[error("agent failed permanently: {0}")]
    AgentPermanent(String),

    #[error("judge was rate limited: {0}")]
    JudgeRateLimited(String),

    #[error("judge hit a transient failure: {0}")]
    JudgeTransient(String),

    #[error("judge response could not be parsed: {0}")]
    JudgeParseError(String),

    #[error("judge failed permanently: {0}")]
    JudgePermanent(String),

    #[error("disk full while writing {path}")]
    DiskFull { path: String },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// The taxonomy tag this error should be recorded as in a run's
    /// `error` field, where applicable.
    pub fn error_tag(&self) -> Option<crate::model::ErrorTag> {
        use crate::model::ErrorTag;
        match self {
            EngineError::WorkspaceSetupFailed(_) => Some(ErrorTag::WorkspaceSetupFailed),
            EngineError::AgentRateLimited(_) => Some(ErrorTag::AgentRateLimited),
            EngineError::AgentTransient(_)
            | EngineError::AgentAuth(_)
            | EngineError::AgentNotFound(_)
            | EngineError::AgentPermanent(_) => Some(ErrorTag::AgentFailed),
            EngineError::AgentTimeout { .. } => Some(ErrorTag::AgentTimeout),
            EngineError::JudgeParseError(_) => Some(ErrorTag::JudgeParseError),
            EngineError::JudgeRateLimited(_)
            | EngineError::JudgeTransient(_)
            | EngineError::JudgePermanent(_) => Some(ErrorTag::JudgeFailed),
            EngineError::CorruptCheckpoint { .. }
            | EngineError::ExperimentLockHeld { .. }
            | EngineError::DiskFull { .. }
            | EngineError::Cancelled
            | EngineError::Other(_) => Some(ErrorTag::InternalError),
        }
    }

    /// Process exit code per the CLI surface contract:
    /// 0 complete, 2 unrecoverable setup error, 3 lockfile conflict,
    /// 130 cancelled (SIGINT convention: 128 + SIGINT's signal number 2).
    pub fn exit_code(&self) -> u8 {
        match self {
            EngineError::ExperimentLockHeld { .. } => 3,
            EngineError::Cancelled => 130,
            _ => 2,
        }
    }
}
