//! Typed error taxonomy for journey operations.
//!
//! Every fallible operation in the crate returns one of these variants.
//! `Storage` is the only class a caller should treat as retryable;
//! `Integrity` indicates tampering or a corrupted record and is logged
//! separately at the call sites that raise it.

#[derive(thiserror::Error, Debug)]
pub enum JourneyError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("storage unavailable: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl JourneyError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Only storage outages are safe to retry blindly; everything else was
    /// rejected before any mutation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, JourneyError>;
