#[derive(thiserror::Error, Debug)]
pub enum NotaryError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("substep '{0}' is not reachable yet, an earlier substep is still open")]
    SequenceViolation(String),
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("attachment exceeds the maximum of {max_bytes} bytes")]
    AttachmentTooLarge { max_bytes: u64 },
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("not authorized to complete '{substep_id}': {reason}")]
    AuthorizationDenied { substep_id: String, reason: String },
    #[error("authorization service unavailable: {0}")]
    AuthorizationUnavailable(String),
    #[error("process '{process_id}' belongs to workflow '{expected}', not '{found}'")]
    WorkflowMismatch {
        process_id: String,
        expected: String,
        found: String,
    },
    #[error("product passport cannot be generated: {0}")]
    DppUnavailable(String),
    #[error("store failure: {0}")]
    StoreFailure(#[source] anyhow::Error),
}

impl NotaryError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        Self::StoreFailure(err.into())
    }
}

pub type NotaryResult<T> = Result<T, NotaryError>;
