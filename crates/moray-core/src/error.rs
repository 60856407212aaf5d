//! Error types for the Moray gateway

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for the Moray gateway
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid spec document
    #[error("spec error: {0}")]
    Spec(String),

    /// A filter constructor rejected its spec
    #[error("failed to construct filter '{filter}': {message}")]
    Construct {
        /// Filter name
        filter: String,
        /// Error message
        message: String,
    },

    /// Duplicate filter kind registration
    #[error("filter kind '{0}' already registered")]
    DuplicateKind(String),

    /// Cluster backend error
    #[error("cluster error: {0}")]
    Cluster(String),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen in production)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a construct error for the named filter
    pub fn construct(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Construct {
            filter: filter.into(),
            message: message.into(),
        }
    }

    /// Create a cluster error
    pub fn cluster(message: impl Into<String>) -> Self {
        Error::Cluster(message.into())
    }
}
