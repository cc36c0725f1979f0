//! Error types for the bundle service
//!
//! All modules use `ServiceResult<T>` as their return type. Errors are
//! `Clone` because a failed build is cached and replayed to every caller
//! that asks for the same key while the error is still fresh.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for bundle service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// All errors that can occur in the bundle service
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Installation errors
    #[error("Package not found: {name}@{range}")]
    PackageNotFound { name: String, range: String },

    #[error("Version conflict for {name}: {reason}")]
    VersionConflict { name: String, reason: String },

    #[error("Installation of {name} failed: {reason}")]
    Install { name: String, reason: String },

    // Compilation errors
    #[error("Compilation failed: {0}")]
    Compile(String),

    // Coordination errors
    #[error("Build did not complete within {waited_secs}s")]
    BuildTimeout { waited_secs: u64 },

    #[error("Build callback for {id} panicked: {message}")]
    Programmer { id: String, message: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Create a compile error
    pub fn compile(reason: impl Into<String>) -> Self {
        Self::Compile(reason.into())
    }

    /// Whether this is the internal "still building" signal
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::BuildTimeout { .. })
    }

    /// Whether this error may be stored in a cache entry
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Self::Programmer { .. } | Self::BuildTimeout { .. })
    }

    /// HTTP status code the error translates to at the request boundary
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::PackageNotFound { .. } => 404,
            Self::VersionConflict { .. } => 409,
            Self::Compile(_) => 422,
            Self::BuildTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::PackageNotFound { .. } => {
                Some("Check the package name and that the registry contains a matching version")
            }
            Self::VersionConflict { .. } => Some("Request a single version range per package"),
            Self::BuildTimeout { .. } => Some("Retry later; the build keeps running in the background"),
            Self::ConfigInvalid { .. } => Some("Run: bundle-service config init --force"),
            _ => None,
        }
    }
}
