//! Control-plane error taxonomy.
//!
//! Every fallible operation in the core surfaces one of these variants so
//! the HTTP layer and the CLI can map failures uniformly: validation → 400,
//! not-found → 404, conflict and precondition → 409, transient → 503,
//! permanent → 502, internal → 500.

/// Result alias used across the control-plane core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Tagged error kinds shared by registries, the outbox, the pipeline, and
/// the DAG runner.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed input. Never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// The addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current state (e.g. duplicate binding).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A required collaborator is unavailable (e.g. active wake turn
    /// requested while the command pipeline is absent).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Retriable failure: network timeout, adapter 5xx, transient file error.
    #[error("transient: {0}")]
    Transient(String),

    /// Terminal failure: adapter 4xx (except 429), dead-lettered delivery.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Unexpected failure; reported as 500 and changes no state.
    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable code for telemetry and API bodies.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status for the JSON API surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::PreconditionFailed(_) => 409,
            Self::Transient(_) => 503,
            Self::Permanent(_) => 502,
            Self::Internal(_) => 500,
        }
    }

    /// CLI process exit code.
    ///
    /// 0 success, 1 generic failure, 2 validation, 3 not found,
    /// 4 precondition failed.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::NotFound(_) => 3,
            Self::Conflict(_) | Self::PreconditionFailed(_) => 4,
            _ => 1,
        }
    }

    /// Whether a delivery-style failure may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(CoreError::Validation("x".into()).exit_code(), 2);
        assert_eq!(CoreError::NotFound("x".into()).exit_code(), 3);
        assert_eq!(CoreError::Conflict("x".into()).exit_code(), 4);
        assert_eq!(CoreError::PreconditionFailed("x".into()).exit_code(), 4);
        assert_eq!(CoreError::Internal("x".into()).exit_code(), 1);
    }

    #[test]
    fn http_statuses() {
        assert_eq!(CoreError::Validation("x".into()).http_status(), 400);
        assert_eq!(CoreError::NotFound("x".into()).http_status(), 404);
        assert_eq!(CoreError::PreconditionFailed("x".into()).http_status(), 409);
    }
}
