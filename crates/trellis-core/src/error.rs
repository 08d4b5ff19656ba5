//! Error types and result aliases shared across Trellis components.

/// The result type used throughout trellis-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core Trellis operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A serialized partition subset no longer matches the asset's
    /// partitions definition.
    #[error(
        "partition subset incompatible with current partitions definition \
         (stored fingerprint {stored}, current fingerprint {current})"
    )]
    IncompatiblePartitionSubset {
        /// Fingerprint recorded when the subset was serialized.
        stored: String,
        /// Fingerprint of the current partitions definition.
        current: String,
    },

    /// A partition key was not found in the partitions definition.
    #[error("unknown partition key: {key}")]
    UnknownPartitionKey {
        /// The partition key that was not found.
        key: String,
    },
}

impl Error {
    /// Creates a new serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
