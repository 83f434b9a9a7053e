//! Shared semantic error kind and the crate-boundary error type.
//!
//! Every component-local error enum converts into [`GenieError`] so the
//! Pipeline always branches on the same eight-way shape, regardless of which
//! component raised the underlying failure.

use crate::types::GenieErrorKind;

/// Crate-boundary error, carrying the semantic kind plus a human-readable
/// message.
#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct GenieError {
    /// The semantic error kind.
    pub kind: GenieErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl GenieError {
    /// Build an error of the given kind with a human-readable message.
    pub fn new(kind: GenieErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for [`GenieErrorKind::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(GenieErrorKind::Validation, message)
    }

    /// Shorthand for [`GenieErrorKind::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(GenieErrorKind::NotFound, message)
    }

    /// Shorthand for [`GenieErrorKind::Timeout`].
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(GenieErrorKind::Timeout, message)
    }
}

impl From<crate::store::StoreError> for GenieError {
    fn from(e: crate::store::StoreError) -> Self {
        use crate::store::StoreError as S;
        match e {
            S::NotFound(m) => Self::new(GenieErrorKind::NotFound, m),
            S::Conflict(m) => Self::new(GenieErrorKind::Conflict, m),
            S::Corrupt(m) => Self::new(GenieErrorKind::Corrupt, m),
            S::Io(m) => Self::new(GenieErrorKind::FatalExternal, m),
        }
    }
}

impl From<crate::llm::LlmError> for GenieError {
    fn from(e: crate::llm::LlmError) -> Self {
        use crate::llm::LlmError as L;
        match e {
            L::Transient(m) => Self::new(GenieErrorKind::TransientExternal, m),
            L::InvalidOutput(m) => Self::new(GenieErrorKind::InvalidLlmOutput, m),
            L::Auth(m) => Self::new(GenieErrorKind::FatalExternal, m),
            L::Timeout => Self::timeout("LLM call timed out"),
        }
    }
}
