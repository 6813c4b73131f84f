//! Error types for the hub.

/// The result type used throughout `sluice-hub`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hub operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or missing configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A metadata store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
        /// The underlying database error, if any.
        #[source]
        source: Option<rusqlite::Error>,
    },

    /// A durable transaction queue operation failed.
    #[error("transaction queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
        /// The underlying I/O error, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The peer violated the protocol (bad body, missing ack).
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// An error from the shared protocol and adapter layer.
    #[error("core error: {0}")]
    Core(#[from] sluice_core::error::Error),
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new queue error with its I/O cause.
    #[must_use]
    pub fn queue_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Queue {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store {
            message: "query failed".to_string(),
            source: Some(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_carries_source() {
        let err = Error::from(rusqlite::Error::InvalidQuery);
        assert!(err.to_string().contains("store error"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn configuration_error_display() {
        let err = Error::configuration("missing PIPELINE_PORT");
        assert!(err.to_string().contains("PIPELINE_PORT"));
    }
}
