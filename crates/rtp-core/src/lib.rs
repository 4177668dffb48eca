//! RTP core library for the LWS stack
//!
//! This crate provides RTP packet encoding/decoding, RTCP support and the
//! statistics behind RTCP reports. It does no I/O; the media session owns
//! the sockets.
//!
//! - `packet`: RTP and RTCP packet definitions
//! - `stats`: reception and sender statistics
//! - `session`: sequence numbering, report generation and RTCP timing

mod error;

pub mod packet;
pub mod session;
pub mod stats;

pub use error::Error;

pub use packet::rtcp::{
    NtpTimestamp, RtcpGoodbye, RtcpPacket, RtcpReceiverReport, RtcpReportBlock,
    RtcpSenderReport, RtcpSourceDescription,
};
pub use packet::{is_rtcp, RtpHeader, RtpPacket};
pub use session::{RtcpScheduler, RtpSession, RtpSessionConfig};
pub use stats::{ReceptionStats, RtpSessionStats, SequenceOutcome};

/// The default maximum size for RTP packets in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Typedef for RTP contributing source identifier
pub type RtpCsrc = u32;

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        Error, Result, RtcpPacket, RtpHeader, RtpPacket, RtpSequenceNumber, RtpSession,
        RtpSessionConfig, RtpSessionStats, RtpSsrc, RtpTimestamp,
    };
}
