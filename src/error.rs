use thiserror::Error;

/// Result type alias for container operations
pub type Result<T> = std::result::Result<T, NestError>;

/// Errors that can occur when working with nested containers
#[derive(Debug, Error)]
pub enum NestError {
    /// I/O error occurred while reading or writing the host file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Extended path string could not be tokenized
    #[error("Malformed path: {0}")]
    MalformedPath(String),

    /// Byte buffer does not match any known container kind
    #[error("Unrecognized format: {0}")]
    UnrecognizedFormat(String),

    /// Invalid or corrupt container structure
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// No child matched a path segment
    #[error("Not found: {0}")]
    NotFound(String),

    /// A name segment matched more than one child
    #[error("Ambiguous match: {0}")]
    AmbiguousMatch(String),

    /// A container cannot hold the new child bytes
    #[error("Out of space: need {needed} blocks, {available} free")]
    OutOfSpace {
        /// Blocks required for the write
        needed: usize,
        /// Blocks currently free
        available: usize,
    },

    /// New bytes do not match a fixed-extent child's size
    #[error("Size mismatch: extent holds {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Extent size in bytes
        expected: usize,
        /// Size of the rejected replacement
        actual: usize,
    },

    /// A save was rejected partway up the chain; nothing was written
    #[error("Save rejected at level {level} ({detail}): {cause}")]
    PropagationFailed {
        /// Chain level (0 = host file) that rejected the write
        level: usize,
        /// Human description of the rejecting node
        detail: String,
        /// The underlying rejection
        #[source]
        cause: Box<NestError>,
    },

    /// Cached bookkeeping disagrees with the backing bytes (a bug, not a user error)
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// Filesystem could not be mounted or is structurally damaged
    #[error("Filesystem error: {0}")]
    FileSystemError(String),

    /// Filename is not valid for the target container
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),
}

impl NestError {
    /// Create a malformed-path error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        NestError::MalformedPath(message.into())
    }

    /// Create an unrecognized-format error
    pub fn unrecognized<S: Into<String>>(message: S) -> Self {
        NestError::UnrecognizedFormat(message.into())
    }

    /// Create an invalid format error
    pub fn invalid_format<S: Into<String>>(message: S) -> Self {
        NestError::InvalidFormat(message.into())
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        NestError::NotFound(message.into())
    }

    /// Create a filesystem error
    pub fn filesystem<S: Into<String>>(message: S) -> Self {
        NestError::FileSystemError(message.into())
    }

    /// Create a health-check failure
    pub fn health<S: Into<String>>(message: S) -> Self {
        NestError::HealthCheckFailed(message.into())
    }
}
