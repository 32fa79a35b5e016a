//! Error types for nvctl
//!
//! Every control-plane operation reports one of a small set of error
//! kinds. The kinds map onto the negative errno values the RPC layer
//! reports back to clients.

use thiserror::Error;

/// Common result type for nvctl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for nvctl
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or oversized field, unknown transport kind, invalid mode string
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Duplicate name, duplicate path or duplicate discovery session
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Unknown controller, block device or discovery session
    #[error("not found: {0}")]
    NotFound(String),

    /// Allocation failure
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Driver or transport failure, carrying the driver's own code
    #[error("device error ({code}): {message}")]
    Device { code: i32, message: String },

    /// Unexpected invariant violation
    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The completing side went away before reporting a result
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an already exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a device error from a driver return code.
    ///
    /// Positive codes are normalised to their negative form.
    pub fn device(code: i32, msg: impl Into<String>) -> Self {
        Self::Device {
            code: -code.abs(),
            message: msg.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a validation error raised before any state change
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::AlreadyExists(_))
    }

    /// Get the negative errno reported to RPC clients
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => -libc::EINVAL,
            Self::AlreadyExists(_) => -libc::EALREADY,
            Self::NotFound(_) => -libc::ENODEV,
            Self::ResourceExhausted(_) => -libc::ENOMEM,
            Self::Device { code, .. } => *code,
            Self::Internal(_) | Self::Io(_) => -libc::EIO,
            Self::Cancelled => -libc::ECANCELED,
        }
    }

    /// Get the bare message, without the kind prefix used by `Display`
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::InvalidArgument(m)
            | Self::AlreadyExists(m)
            | Self::NotFound(m)
            | Self::ResourceExhausted(m)
            | Self::Internal(m) => m.clone(),
            Self::Device { message, .. } => message.clone(),
            Self::Io(e) => e.to_string(),
            Self::Cancelled => "operation cancelled".to_string(),
        }
    }
}
