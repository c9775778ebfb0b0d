//! Error types for Knowledge Horizon.
//!
//! Library crates use [`HorizonError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum HorizonError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to a retrieval source or LLM provider.
    #[error("network error: {0}")]
    Network(String),

    /// Response parsing error (source payloads, LLM output).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// LLM call failed (provider error, empty completion, bad score).
    #[error("llm error: {0}")]
    Llm(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad snapshot, invalid state transition, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A referenced record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HorizonError>;

impl HorizonError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given entity kind.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable error type name, reported in pipeline `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "ConfigError",
            Self::Network(_) => "NetworkError",
            Self::Parse { .. } => "ParseError",
            Self::Storage(_) => "StorageError",
            Self::Llm(_) => "LlmError",
            Self::Io { .. } => "IoError",
            Self::Validation { .. } => "ValidationError",
            Self::NotFound { .. } => "NotFoundError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = HorizonError::config("unsupported retrieval strategy 'x'");
        assert_eq!(
            err.to_string(),
            "config error: unsupported retrieval strategy 'x'"
        );

        let err = HorizonError::not_found("execution", "abc");
        assert_eq!(err.to_string(), "execution not found: abc");
    }

    #[test]
    fn error_kind_names() {
        assert_eq!(HorizonError::Storage("x".into()).kind(), "StorageError");
        assert_eq!(HorizonError::validation("x").kind(), "ValidationError");
    }
}
