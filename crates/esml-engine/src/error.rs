//! Error types for esml-engine

use thiserror::Error;

/// Content cache error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Storage backend failure
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Stored artifact could not be encoded or decoded
    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Create a backend error from anything printable
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    /// Create a serialization error from anything printable
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for content cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Engine error type
///
/// Errors are `Clone` because a single pipeline failure is delivered to
/// every caller queued on that module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A bare name has more than one mapping in the deciding scope
    #[error("Cannot resolve '{specifier}': name collision in scope '{scope}'")]
    ResolutionCollision { specifier: String, scope: String },

    /// Specifier cannot be turned into a URL
    #[error("Invalid specifier '{specifier}' (base '{base}'): {reason}")]
    InvalidSpecifier {
        specifier: String,
        base: String,
        reason: String,
    },

    /// Source uses syntax the transformer does not handle
    #[error("Unsupported syntax: {message}")]
    UnsupportedSyntax { message: String },

    /// Transport failed to deliver the module bytes
    #[error("Failed to fetch '{url}': {reason}")]
    FetchFailure { url: String, reason: String },

    /// Transport delivered something that is not JavaScript
    #[error("Unsupported content type '{content_type}' for '{url}'")]
    UnsupportedContentType { url: String, content_type: String },

    /// The module body threw
    #[error("Execution of '{url}' failed: {message}")]
    ExecutionFailure { url: String, message: String },

    /// Module would wait on itself
    #[error("Circular dependency detected: {}", chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    /// Content cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create an unsupported syntax error
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::UnsupportedSyntax {
            message: msg.into(),
        }
    }

    /// Create a fetch failure
    pub fn fetch(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::FetchFailure {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type using EngineError
pub type EngineResult<T> = Result<T, EngineError>;
