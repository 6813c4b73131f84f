//! Error types and result aliases shared across Sluice components.

/// The result type used throughout `sluice-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the shared protocol and adapter layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input was provided (bad frame, reserved byte sequence, bad id).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A received frame could not be decoded.
    #[error("malformed frame: {message}")]
    MalformedFrame {
        /// Description of what made the frame undecodable.
        message: String,
    },

    /// An unknown wire method was received.
    #[error("unknown method: {method}")]
    UnknownMethod {
        /// The method literal that failed to resolve.
        method: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A bucket (blob store) operation failed.
    #[error("bucket error: {message}")]
    Bucket {
        /// Description of the bucket failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A socket operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new bucket error with the given message.
    #[must_use]
    pub fn bucket(message: impl Into<String>) -> Self {
        Self::Bucket {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new bucket error with a source cause.
    #[must_use]
    pub fn bucket_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Bucket {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new malformed-frame error.
    #[must_use]
    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }
}
