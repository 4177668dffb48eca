use lws_infra_common::errors::{
    ErrorCode, LWS_ERR_INVALID_PARAM, LWS_ERR_RTCP_PACKET, LWS_ERR_RTP_PACKET,
};
use thiserror::Error;

/// Error type for RTP operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid packet format
    #[error("Invalid RTP packet format: {0}")]
    InvalidPacket(String),

    /// Buffer too small
    #[error("Buffer too small for RTP packet: need {required} but have {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// Invalid parameter for RTP operation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// RTCP error
    #[error("RTCP error: {0}")]
    RtcpError(String),
}

impl Error {
    /// Status code reported to applications
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidPacket(_) | Error::BufferTooSmall { .. } => LWS_ERR_RTP_PACKET,
            Error::RtcpError(_) => LWS_ERR_RTCP_PACKET,
            Error::InvalidParameter(_) => LWS_ERR_INVALID_PARAM,
        }
    }
}
