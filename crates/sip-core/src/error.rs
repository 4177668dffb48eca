use lws_infra_common::errors::{
    ErrorCode, LWS_ERR_INVALID_PARAM, LWS_ERR_SIP_AUTH, LWS_ERR_SIP_BUILD, LWS_ERR_SIP_PARSE,
};
use thiserror::Error;

/// Result type for SIP message operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing, building or authenticating SIP messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed start line, header block or body framing
    #[error("Parse error: {0}")]
    ParseError(String),

    /// URI does not match the sip/sips/tel grammar
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// A header value does not match its grammar
    #[error("Invalid {name} header: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// Mandatory header absent
    #[error("Missing header: {0}")]
    MissingHeader(String),

    /// Status code outside 100..=699
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Method token contains invalid characters
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    /// Unsupported SIP version in the start line
    #[error("Unsupported SIP version: {0}")]
    InvalidVersion(String),

    /// Stream framing exceeded the configured ceiling
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Content-Length announces more bytes than the datagram carries
    #[error("Truncated body: expected {expected} bytes, got {actual}")]
    TruncatedBody { expected: usize, actual: usize },

    /// Malformed session description
    #[error("SDP parsing error: {0}")]
    SdpParsingError(String),

    /// Challenge could not be answered
    #[error("Authentication error: {0}")]
    AuthError(String),

    /// Builder was finished with inconsistent input
    #[error("Build error: {0}")]
    BuildError(String),

    /// Invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Numeric error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::AuthError(_) => LWS_ERR_SIP_AUTH,
            Error::BuildError(_) => LWS_ERR_SIP_BUILD,
            Error::InvalidInput(_) => LWS_ERR_INVALID_PARAM,
            _ => LWS_ERR_SIP_PARSE,
        }
    }

    pub(crate) fn header(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidHeader {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl<I: std::fmt::Debug> From<nom::Err<nom::error::Error<I>>> for Error {
    fn from(err: nom::Err<nom::error::Error<I>>) -> Self {
        Error::ParseError(format!("{:?}", err))
    }
}
