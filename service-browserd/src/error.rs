use thiserror::Error;
use shared::regtype::RegTypeError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// A resolver backend rejected or could not run an operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("browse for '{reg_type}' in '{domain}' failed: {reason}")]
    BrowseFailed {
        reg_type: String,
        domain: String,
        reason: String,
    },

    #[error("resolve of '{name}' failed: {reason}")]
    ResolveFailed { name: String, reason: String },

    #[error("address query for '{hostname}' failed: {reason}")]
    QueryFailed { hostname: String, reason: String },

    #[error("registration of '{name}' failed: {reason}")]
    RegisterFailed { name: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid reg type: {0}")]
    InvalidRegType(#[from] RegTypeError),
}

impl EngineError {
    /// True when a whole browse was lost, as opposed to one instance failing
    /// to resolve
    pub fn is_browse_failure(&self) -> bool {
        matches!(self, EngineError::Backend(BackendError::BrowseFailed { .. }))
    }
}
