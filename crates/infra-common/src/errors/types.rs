use thiserror::Error;

use super::code::{ErrorCode, LWS_ERR_CONFIG, LWS_ERR_INVALID_STATE, LWS_ERR_NOT_FOUND};

/// Result type for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the infrastructure layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid logging or runtime configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The timer was already fired, stopped, or never armed
    #[error("Timer not found")]
    TimerNotFound,

    /// The timer wheel was shut down
    #[error("Timer wheel is shut down")]
    TimerShutdown,
}

impl Error {
    /// Status code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Config(_) => LWS_ERR_CONFIG,
            Error::TimerNotFound => LWS_ERR_NOT_FOUND,
            Error::TimerShutdown => LWS_ERR_INVALID_STATE,
        }
    }
}
