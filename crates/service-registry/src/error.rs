//! Error types for the service registry

use thiserror::Error;

/// Service registry error type
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied value was rejected
    #[error("bad parameter: {reason}")]
    BadParameter {
        /// Why the value was rejected
        reason: String,
    },

    /// Unknown service, group or instance
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// The update would not change anything
    #[error("not modified: {what}")]
    NotModified {
        /// What was left unchanged
        what: String,
    },

    /// Name, path or id already taken
    #[error("already exists: {what}")]
    AlreadyExists {
        /// What collided
        what: String,
    },

    /// Identifier space exhausted
    #[error("internal error: {reason}")]
    InternalError {
        /// The reason for the failure
        reason: String,
    },

    /// JSON error while parsing a field value
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kernel-level error (tuples, allocation, process calls)
    #[error(transparent)]
    Kernel(#[from] process_kernel::Error),
}

impl Error {
    /// Create a bad parameter error
    pub fn bad_parameter(reason: impl Into<String>) -> Self {
        Self::BadParameter {
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a not modified error
    pub fn not_modified(what: impl Into<String>) -> Self {
        Self::NotModified { what: what.into() }
    }

    /// Create an already exists error
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError {
            reason: reason.into(),
        }
    }

    /// Returns true for the informational no-op outcome
    pub fn is_not_modified(&self) -> bool {
        match self {
            Self::NotModified { .. } => true,
            Self::Kernel(e) => e.is_not_modified(),
            _ => false,
        }
    }

    /// Returns true for rejected input
    pub fn is_bad_parameter(&self) -> bool {
        match self {
            Self::BadParameter { .. } | Self::Json(_) => true,
            Self::Kernel(e) => e.is_bad_parameter(),
            _ => false,
        }
    }

    /// Returns true for unknown entries
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kernel(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
