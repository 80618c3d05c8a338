use thiserror::Error;

/// How the scheduler should treat a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry on the next poll, nothing was changed.
    Transient,
    /// The call may have taken effect; verify before retrying.
    Ambiguous,
    /// Records disagree or required data is missing; hold the payment.
    Structural,
    /// The payment reached a business state automation must not touch.
    Terminal,
    /// Local failure (storage, configuration) unrelated to one payment.
    Fatal,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Concurrent update rejected: {0}")]
    Conflict(String),
    #[error("Step already in flight: {0}")]
    InFlight(String),
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("Rail rate limit reached")]
    RateLimited,
    #[error("Outcome unknown: {0}")]
    OutcomeUnknown(String),
    #[error("Structural mismatch: {0}")]
    Structural(String),
    #[error("Payment is in a terminal state: {0}")]
    Terminal(String),
    #[error("Payout account is not registered with the rail: {0}")]
    UnregisteredAccount(String),
    #[error("Rail rejected request ({status}): {message}")]
    Rail { status: u16, message: String },
    #[error("Transaction reverted: {0}")]
    Reverted(String),
    #[error("Chain RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for EngineError {
    fn from(err: rocksdb::Error) -> Self {
        EngineError::InternalError(Box::new(err))
    }
}

impl EngineError {
    pub fn class(&self) -> FailureClass {
        match self {
            EngineError::Transient(_)
            | EngineError::RateLimited
            | EngineError::InFlight(_)
            | EngineError::Conflict(_)
            | EngineError::UnregisteredAccount(_) => FailureClass::Transient,
            EngineError::Http(err) if err.is_timeout() => FailureClass::Ambiguous,
            EngineError::Http(_) => FailureClass::Transient,
            EngineError::Rpc { .. } => FailureClass::Transient,
            EngineError::OutcomeUnknown(_) => FailureClass::Ambiguous,
            EngineError::Structural(_) | EngineError::NotFound(_) => FailureClass::Structural,
            EngineError::Terminal(_) => FailureClass::Terminal,
            EngineError::Rail { status, .. } if *status >= 500 => FailureClass::Transient,
            EngineError::Rail { .. } | EngineError::Reverted(_) => FailureClass::Structural,
            EngineError::ValidationError(_) => FailureClass::Structural,
            EngineError::Serialization(_)
            | EngineError::IoError(_)
            | EngineError::Config(_)
            | EngineError::InternalError(_) => FailureClass::Fatal,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        EngineError::InternalError(Box::new(std::io::Error::other(message.into())))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
