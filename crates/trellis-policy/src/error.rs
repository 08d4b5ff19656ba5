//! Error types for the decision engine.

use trellis_core::AssetKey;

/// The result type used throughout trellis-policy.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while evaluating materialization decisions.
///
/// Two classes are deliberately unrecoverable: [`Error::MissingPolicy`] and
/// [`Error::IncomparableCandidate`] signal programming errors and propagate
/// immediately, and [`Error::UnknownLegacyRecord`] signals stored-data
/// corruption. Query failures abort the current tick; the daemon retries
/// the whole tick on its own schedule.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An asset without a materialize policy was submitted for evaluation.
    #[error("no materialize policy configured for asset {asset_key}")]
    MissingPolicy {
        /// The asset that was evaluated.
        asset_key: AssetKey,
    },

    /// A stored evaluation record referenced a legacy class that is not in
    /// the decode table.
    #[error("unknown legacy evaluation class: {class_name}")]
    UnknownLegacyRecord {
        /// The unrecognized class name.
        class_name: String,
    },

    /// A discard-ordering candidate could not be assigned a sort key.
    #[error("candidate has no position in its partitions definition: {partition}")]
    IncomparableCandidate {
        /// The asset partition that could not be ordered.
        partition: String,
    },

    /// An external collaborator query failed. Fatal to the current tick.
    #[error("query error: {message}")]
    Query {
        /// Description of the query failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },

    /// An error from trellis-core.
    #[error("core error: {0}")]
    Core(#[from] trellis_core::Error),
}

impl Error {
    /// Creates a new query error.
    #[must_use]
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new query error with a source cause.
    #[must_use]
    pub fn query_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Query {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
