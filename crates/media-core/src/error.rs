use lws_infra_common::errors::{
    ErrorCode, LWS_ERR_CODEC_DEPACKETIZE, LWS_ERR_CODEC_PACKETIZE, LWS_ERR_CODEC_UNSUPPORTED,
    LWS_ERR_MEDIA_ICE, LWS_ERR_MEDIA_NEGOTIATION, LWS_ERR_MEDIA_SDP, LWS_ERR_MEDIA_STATE,
    LWS_ERR_SOCKET_BIND, LWS_ERR_SOCKET_SEND, LWS_ERR_TIMEOUT,
};
use thiserror::Error;

use crate::codec::MediaKind;
use crate::session::SessionState;

/// Result type for media operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by media sessions and payload formats
#[derive(Error, Debug)]
pub enum Error {
    /// Codec not known or not usable here
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// A frame could not be split into payloads
    #[error("Packetization failed: {0}")]
    Packetize(String),

    /// A payload could not be reassembled
    #[error("Depacketization failed: {0}")]
    Depacketize(String),

    /// Malformed or unusable session description
    #[error("SDP error: {0}")]
    Sdp(#[from] lws_sip_core::Error),

    /// Offer and answer have no stream in common
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// No stream of this kind was negotiated
    #[error("No negotiated {0} stream")]
    NoStream(MediaKind),

    /// ICE gathering or connectivity failure
    #[error("ICE error: {0}")]
    Ice(String),

    /// Operation not allowed in the current session state
    #[error("Invalid session state: expected {expected}, found {actual:?}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },

    /// Malformed RTP or RTCP
    #[error("RTP error: {0}")]
    Rtp(#[from] lws_rtp_core::Error),

    /// Socket bind failure
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket send failure
    #[error("Send failed: {0}")]
    Io(#[from] std::io::Error),

    /// A gather or check deadline passed
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Status code reported to applications
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::UnsupportedCodec(_) => LWS_ERR_CODEC_UNSUPPORTED,
            Error::Packetize(_) => LWS_ERR_CODEC_PACKETIZE,
            Error::Depacketize(_) => LWS_ERR_CODEC_DEPACKETIZE,
            Error::Sdp(_) => LWS_ERR_MEDIA_SDP,
            Error::Negotiation(_) | Error::NoStream(_) => LWS_ERR_MEDIA_NEGOTIATION,
            Error::Ice(_) => LWS_ERR_MEDIA_ICE,
            Error::InvalidState { .. } => LWS_ERR_MEDIA_STATE,
            Error::Rtp(e) => e.code(),
            Error::Bind { .. } => LWS_ERR_SOCKET_BIND,
            Error::Io(_) => LWS_ERR_SOCKET_SEND,
            Error::Timeout(_) => LWS_ERR_TIMEOUT,
        }
    }
}
