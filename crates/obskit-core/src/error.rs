#![forbid(unsafe_code)]

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dispatcher closed: the consuming loop has been dropped or shut down")]
    DispatcherClosed,

    #[error("dispatch queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("logging setup failed: {message}")]
    Logging { message: String },
}

impl Error {
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}
