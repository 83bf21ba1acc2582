//! Error types for the secure file layer.
//!
//! Every failure maps to exactly one [`ErrorKind`]. Callers match on the kind;
//! the variant payloads only carry context for logs and diagnostics.

use std::io;
use std::path::Path;

use strum::{AsRefStr, Display};
use thiserror::Error;

/// Result type for secure file operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Closed set of failure kinds surfaced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The path or resource does not exist.
    NotFound,
    /// The host refused access to the path or resource.
    PermissionDenied,
    /// Exclusive creation lost a race: something already occupies the path.
    AlreadyExists,
    /// A non-blocking lock request conflicted with an existing lock.
    Busy,
    /// A blocking wait was interrupted before the lock was granted.
    Timeout,
    /// A path or buffer exceeded its maximum length.
    Overflow,
    /// Reading or seeking failed.
    ReadFailure,
    /// Writing, flushing, truncating or closing failed.
    WriteFailure,
    /// The opened object is not the object that was probed.
    InternalInconsistency,
    /// The object could not be opened or was refused as unsafe.
    Open,
    /// A caller-supplied name or option was malformed.
    InvalidInput,
    /// The host does not provide the requested primitive.
    Unsupported,
}

/// Errors raised by the secure file layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path or resource does not exist.
    #[error("not found: {context}")]
    NotFound {
        /// What was being looked up.
        context: String,
    },

    /// The host refused access.
    #[error("permission denied: {context}")]
    PermissionDenied {
        /// What was being accessed.
        context: String,
    },

    /// Exclusive creation detected an existing object at the target path.
    #[error("already exists: {context}")]
    AlreadyExists {
        /// The contested path.
        context: String,
    },

    /// Lock contention in non-blocking mode.
    #[error("resource busy: {context}")]
    Busy {
        /// The contested resource.
        context: String,
    },

    /// A blocking lock wait was interrupted.
    #[error("timed out: {context}")]
    Timeout {
        /// The resource being waited on.
        context: String,
    },

    /// Length limit exceeded.
    #[error("overflow: length {length} exceeds maximum {max} ({context})")]
    Overflow {
        /// What overflowed.
        context: String,
        /// The offending length.
        length: usize,
        /// The configured maximum.
        max: usize,
    },

    /// Reading or seeking failed.
    #[error("read failure during {context}")]
    Read {
        /// The operation in progress.
        context: String,
        /// Underlying I/O error, when the host produced one.
        #[source]
        source: Option<io::Error>,
    },

    /// Writing, flushing or closing failed.
    #[error("write failure during {context}")]
    Write {
        /// The operation in progress.
        context: String,
        /// Underlying I/O error, when the host produced one.
        #[source]
        source: Option<io::Error>,
    },

    /// Post-open identity check failed. Treated as a security event.
    #[error("identity mismatch: {context}")]
    InternalInconsistency {
        /// What did not match.
        context: String,
    },

    /// Generic open failure or refusal of an unsafe target.
    #[error("open failed: {context}")]
    Open {
        /// Why the open failed.
        context: String,
        /// Underlying I/O error, when the host produced one.
        #[source]
        source: Option<io::Error>,
    },

    /// Malformed caller input.
    #[error("invalid input '{parameter}': {reason}")]
    InvalidInput {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of the issue.
        reason: String,
    },

    /// Primitive not available on this host.
    #[error("operation not supported: {operation}")]
    Unsupported {
        /// The missing primitive.
        operation: String,
    },
}

impl StoreError {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Overflow { .. } => ErrorKind::Overflow,
            Self::Read { .. } => ErrorKind::ReadFailure,
            Self::Write { .. } => ErrorKind::WriteFailure,
            Self::InternalInconsistency { .. } => ErrorKind::InternalInconsistency,
            Self::Open { .. } => ErrorKind::Open,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }

    /// Creates a not-found error.
    pub fn not_found<S: Into<String>>(context: S) -> Self {
        Self::NotFound {
            context: context.into(),
        }
    }

    /// Creates a permission-denied error.
    pub fn permission_denied<S: Into<String>>(context: S) -> Self {
        Self::PermissionDenied {
            context: context.into(),
        }
    }

    /// Creates an already-exists error for `path`.
    pub fn already_exists(path: &Path) -> Self {
        Self::AlreadyExists {
            context: path.display().to_string(),
        }
    }

    /// Creates a busy error.
    pub fn busy<S: Into<String>>(context: S) -> Self {
        Self::Busy {
            context: context.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout<S: Into<String>>(context: S) -> Self {
        Self::Timeout {
            context: context.into(),
        }
    }

    /// Creates an overflow error.
    pub fn overflow<S: Into<String>>(context: S, length: usize, max: usize) -> Self {
        Self::Overflow {
            context: context.into(),
            length,
            max,
        }
    }

    /// Creates a write failure without an I/O source.
    pub fn write<S: Into<String>>(context: S) -> Self {
        Self::Write {
            context: context.into(),
            source: None,
        }
    }

    /// Creates an identity-mismatch error.
    pub fn inconsistency<S: Into<String>>(context: S) -> Self {
        Self::InternalInconsistency {
            context: context.into(),
        }
    }

    /// Creates an open error without an I/O source.
    pub fn open<S: Into<String>>(context: S) -> Self {
        Self::Open {
            context: context.into(),
            source: None,
        }
    }

    /// Creates an invalid-input error.
    pub fn invalid_input<P: Into<String>, R: Into<String>>(parameter: P, reason: R) -> Self {
        Self::InvalidInput {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported<S: Into<String>>(operation: S) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Maps an I/O error raised while reading or seeking.
    pub fn io_read<S: Into<String>>(context: S, source: io::Error) -> Self {
        Self::Read {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Maps an I/O error raised while writing, flushing or closing.
    pub fn io_write<S: Into<String>>(context: S, source: io::Error) -> Self {
        Self::Write {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Maps an I/O error raised while opening `path`.
    ///
    /// `NotFound` and `PermissionDenied` keep their own kinds so callers can
    /// tell them apart; everything else is a generic open failure.
    pub fn io_open(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::not_found(path.display().to_string()),
            io::ErrorKind::PermissionDenied => {
                Self::permission_denied(path.display().to_string())
            }
            _ => Self::Open {
                context: path.display().to_string(),
                source: Some(source),
            },
        }
    }
}
