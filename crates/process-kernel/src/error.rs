//! Error types for the process kernel

use thiserror::Error;

/// Unified error type for kernel operations
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied value was rejected (path outside the root, unknown
    /// user or group, malformed key, empty argument)
    #[error("bad parameter: {reason}")]
    BadParameter {
        /// Why the parameter was rejected
        reason: String,
    },

    /// No entry with the given identifier
    #[error("not found: {what}")]
    NotFound {
        /// Description of what was looked up
        what: String,
    },

    /// The request would not change anything
    #[error("not modified: {what}")]
    NotModified {
        /// Description of the no-op
        what: String,
    },

    /// Identifier space exhausted or another invariant broke
    #[error("internal error: {reason}")]
    InternalError {
        /// The reason for the failure
        reason: String,
    },

    /// Failed to spawn a process
    #[error("failed to spawn process: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// A bounded call did not complete before its deadline
    #[error("kernel unavailable: {reason}")]
    Unavailable {
        /// What timed out
        reason: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Nix error (identity lookup, signals)
    #[error(transparent)]
    Nix(#[from] nix::Error),
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

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError {
            reason: reason.into(),
        }
    }

    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Prefix an OS error with the operation that produced it, keeping its kind
    pub fn io_context(context: impl AsRef<str>, err: std::io::Error) -> Self {
        Self::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {}", context.as_ref(), err),
        ))
    }

    /// Returns true for the informational no-op outcome
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Error::NotModified { .. })
    }

    /// Returns true if the error was caused by a rejected parameter
    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, Error::BadParameter { .. })
    }

    /// Returns true if the error reports a missing entry
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_context_keeps_kind() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = Error::io_context("stat /srv/bin/tool", err);
        match err {
            Error::Io(inner) => {
                assert_eq!(inner.kind(), std::io::ErrorKind::NotFound);
                assert!(inner.to_string().starts_with("stat /srv/bin/tool"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_classifiers() {
        assert!(Error::not_modified("service 7").is_not_modified());
        assert!(Error::bad_parameter("empty path").is_bad_parameter());
        assert!(Error::not_found("process 3").is_not_found());
        assert!(!Error::internal("exhausted").is_not_modified());
    }
}
