use thiserror::Error;

/// Failures that reach the caller of a supervisor, scheduler or control operation.
#[derive(Debug, Error)]
pub enum PmError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The supervisor actor for an instance could not be reached (closed channel, dropped reply).
    #[error("supervisor unavailable: {0}")]
    SupervisorUnavailable(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to spawn {id}: {reason}")]
    SpawnFailed { id: String, reason: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PmError {
    pub fn instance_not_found(id: impl Into<String>) -> Self {
        PmError::NotFound {
            kind: "instance",
            id: id.into(),
        }
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        PmError::NotFound {
            kind: "task",
            id: id.into(),
        }
    }

    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        PmError::Invalid {
            field,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PmError::NotFound { .. })
    }
}

/// Conditions that are logged where they happen and never returned to callers.
#[derive(Debug, Error)]
pub enum Advisory {
    #[error("dependency install failed: {0}")]
    InstallWarning(String),

    #[error("resource limit unavailable: {0}")]
    ResourceLimitUnavailable(String),

    #[error("scheduled action failed: {0}")]
    ActionExecutionError(String),
}

pub type PmResult<T> = Result<T, PmError>;
