//! Error types and result aliases for sweep.
//!
//! The taxonomy is closed: callers match on the variant to decide whether to
//! abandon a claim attempt, retreat and retry, or treat the error as a bug.

/// The result type used throughout sweep.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sweep operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An update targeted a row id that is not in the table.
    #[error("row not found: {id}")]
    NotFound {
        /// The row id that was looked up.
        id: String,
    },

    /// A status mutation was rejected by the state machine.
    #[error("invalid transition for row {id}: {from} -> {to} ({reason})")]
    InvalidTransition {
        /// The row id.
        id: String,
        /// The current status.
        from: String,
        /// The attempted status.
        to: String,
        /// Why the transition was rejected.
        reason: String,
    },

    /// The optimistic claim retry budget was exhausted.
    #[error("claim contention: gave up after {attempts} conflicting attempts")]
    Contention {
        /// Number of claim attempts that observed a conflicting write.
        attempts: u32,
    },

    /// Durable storage could not be reached or written.
    #[error("backend I/O error: {message}")]
    BackendIo {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The table does not have the expected shape.
    #[error("malformed table: {message}")]
    Schema {
        /// Description of the problem.
        message: String,
    },

    /// The configuration is invalid.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },
}

impl Error {
    /// Creates a new backend I/O error with the given message.
    #[must_use]
    pub fn backend_io(message: impl Into<String>) -> Self {
        Self::BackendIo {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new backend I/O error with a source cause.
    #[must_use]
    pub fn backend_io_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendIo {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new schema error.
    #[must_use]
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new not-found error for a row id.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Returns true if a worker should pause and retry the claim later.
    ///
    /// Logical errors (`NotFound`, `InvalidTransition`) are caller bugs and
    /// never qualify.
    #[must_use]
    pub const fn is_retreatable(&self) -> bool {
        matches!(self, Self::BackendIo { .. } | Self::Contention { .. })
    }
}
