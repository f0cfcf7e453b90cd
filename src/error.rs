//! Error type shared by every component of the crate.

/// Errors produced while synchronizing cluster state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store has been closed; the process is shutting down.
    ///
    /// Never retry an operation that failed with this error.
    #[error("store closed")]
    StoreClosed,

    /// The service label selector could not be built from configuration.
    #[error("invalid label selector requirement {key}: {reason}")]
    InvalidSelector {
        /// Label key of the offending requirement.
        key: String,
        /// Why the requirement was rejected.
        reason: String,
    },

    /// A configured label or annotation glob does not compile.
    #[error("invalid metadata glob {glob:?}")]
    InvalidGlob {
        /// The glob as configured.
        glob: String,
        /// Underlying parse error.
        #[source]
        source: globset::Error,
    },

    /// The Kubernetes client could not be created.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// A synchronization task panicked or was aborted.
    #[error("sync task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, Error>;
