//! Error types for stagegraph.

use thiserror::Error;

/// Result type alias using stagegraph's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for stagegraph operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Declared parameters are missing or incompatible (detected at `init()`).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Pool allocation or backend resource acquisition failed.
    #[error("resource error: {0}")]
    Resource(String),

    /// The delegated transform failed.
    ///
    /// Non-fatal errors drop the current frame; fatal ones end the stage worker.
    #[error("backend error: {message}")]
    Backend {
        /// Description reported by the backend.
        message: String,
        /// Whether the stage can continue with the next frame.
        fatal: bool,
    },

    /// A source saw no data for longer than its inactivity limit.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed upstream data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation not allowed in the stage's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A buffer was released to a pool that does not own it.
    #[error("buffer does not belong to pool '{0}'")]
    ForeignBuffer(String),

    /// The pool was closed while waiting for a buffer.
    #[error("buffer pool '{0}' is closed")]
    PoolClosed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// A recoverable backend failure: the frame is dropped, the stage continues.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            fatal: false,
        }
    }

    /// An unrecoverable backend failure: the stage stops.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            fatal: true,
        }
    }

    /// Shorthand for [`Error::Configuration`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether a stage worker must stop after seeing this error.
    ///
    /// Only non-fatal backend errors are frame-local.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Backend { fatal: false, .. })
    }
}
