//! Error types for the agent facade

use lws_infra_common::errors::{
    ErrorCode, LWS_ERR_AGENT_ALREADY_STARTED, LWS_ERR_AGENT_NOT_REGISTERED, LWS_ERR_AGENT_NOT_STARTED,
    LWS_ERR_AGENT_NO_CALL, LWS_ERR_CONFIG, LWS_ERR_INVALID_PARAM, LWS_ERR_INVALID_STATE,
    LWS_ERR_SIP_CANCEL_REJECTED, LWS_ERR_SOCKET_CONNECT, LWS_ERR_TRANSPORT_CLOSED,
};
use thiserror::Error;

use crate::events::{CallHandle, CallState};

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by [`Agent`](crate::Agent) operations
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration failed validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// TOML configuration could not be read
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// `start` has not been called yet
    #[error("Agent not started")]
    NotStarted,

    /// `start` was called twice
    #[error("Agent already started")]
    AlreadyStarted,

    /// The agent was stopped and cannot be used again
    #[error("Agent stopped")]
    Stopped,

    /// A server is configured but the registration is not active
    #[error("Not registered (registration is {0})")]
    NotRegistered(crate::RegistrationState),

    /// No call matches
    #[error("No call for {0}")]
    NoCall(String),

    /// The call exists but the operation does not fit its state
    #[error("Call {call} is {state}: {reason}")]
    InvalidCallState {
        call: CallHandle,
        state: CallState,
        reason: &'static str,
    },

    /// CANCEL after a final response; only `hangup` is valid then
    #[error("Call {call} cannot be cancelled in state {state}")]
    CancelRejected { call: CallHandle, state: CallState },

    /// The target is not a SIP URI
    #[error("Invalid URI '{0}'")]
    InvalidUri(String),

    /// Not a final non-2xx status
    #[error("Status {0} cannot refuse a call")]
    InvalidStatus(u16),

    /// Server or target host lookup failed
    #[error("Cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// A stream transport failed earlier; the agent cannot continue
    #[error("Transport closed")]
    TransportClosed,

    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(#[from] lws_sip_transport::Error),

    /// Transaction or dialog layer error
    #[error("SIP error: {0}")]
    Dialog(#[from] lws_dialog_core::Error),

    /// Message construction error
    #[error("SIP message error: {0}")]
    Sip(#[from] lws_sip_core::Error),

    /// Media session error
    #[error("Media error: {0}")]
    Media(#[from] lws_media_core::Error),
}

impl Error {
    /// Status code reported to applications
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => LWS_ERR_CONFIG,
            Error::NotStarted => LWS_ERR_AGENT_NOT_STARTED,
            Error::AlreadyStarted => LWS_ERR_AGENT_ALREADY_STARTED,
            Error::Stopped | Error::InvalidCallState { .. } => LWS_ERR_INVALID_STATE,
            Error::NotRegistered(_) => LWS_ERR_AGENT_NOT_REGISTERED,
            Error::NoCall(_) => LWS_ERR_AGENT_NO_CALL,
            Error::CancelRejected { .. } => LWS_ERR_SIP_CANCEL_REJECTED,
            Error::InvalidUri(_) | Error::InvalidStatus(_) => LWS_ERR_INVALID_PARAM,
            Error::Resolve { .. } => LWS_ERR_SOCKET_CONNECT,
            Error::TransportClosed => LWS_ERR_TRANSPORT_CLOSED,
            Error::Transport(e) => e.code(),
            Error::Dialog(e) => e.code(),
            Error::Sip(e) => e.code(),
            Error::Media(e) => e.code(),
        }
    }
}
