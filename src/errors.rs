use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("NON_ZERO_EXIT: {message}")]
    NonZeroExit { code: Option<i32>, message: String },
    #[error("CANCELLED: cancelled by user")]
    Cancelled,
    #[error("PERSISTENCE_FAILURE: {0}")]
    Persistence(String),
    #[error("ESCALATION_UNAVAILABLE: {0}")]
    EscalationUnavailable(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
