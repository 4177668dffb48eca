//! Numeric status codes
//!
//! Public operations report failures as a 32-bit value. Bit layout:
//!
//! ```text
//!  31    28 27                16 15                 0
//! ┌────────┬────────────────────┬────────────────────┐
//! │  0x8   │     module tag     │    local code      │
//! └────────┴────────────────────┴────────────────────┘
//! ```
//!
//! Success is always [`LWS_OK`] (zero). Each crate's error enum maps its
//! variants onto one of the constants below through a `code()` method.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Success status
pub const LWS_OK: u32 = 0;

const ERROR_NIBBLE: u32 = 0x8000_0000;

/// Module tags carried in bits 27..16 of an [`ErrorCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Module {
    /// Validation, allocation and other cross-cutting failures
    Common = 0x000,
    /// Socket and connection failures
    Transport = 0x001,
    /// SIP parsing, transactions, dialogs, authentication
    Sip = 0x002,
    /// RTP/RTCP packet handling
    Rtp = 0x003,
    /// Payload packetization
    Codec = 0x004,
    /// SDP negotiation, ICE and media sessions
    Media = 0x005,
    /// Agent facade
    Agent = 0x006,
}

impl Module {
    fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0x000 => Some(Module::Common),
            0x001 => Some(Module::Transport),
            0x002 => Some(Module::Sip),
            0x003 => Some(Module::Rtp),
            0x004 => Some(Module::Codec),
            0x005 => Some(Module::Media),
            0x006 => Some(Module::Agent),
            _ => None,
        }
    }
}

/// 32-bit status code with the `0x8` error nibble set
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(u32);

impl ErrorCode {
    /// Build a code from a module tag and a module-local code
    pub const fn new(module: Module, local: u16) -> Self {
        Self(ERROR_NIBBLE | ((module as u32) << 16) | local as u32)
    }

    /// Raw value as returned to applications
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Module that produced this code, if the tag is known
    pub fn module(&self) -> Option<Module> {
        Module::from_tag(((self.0 >> 16) & 0x0FFF) as u16)
    }

    /// Module-local part of the code
    pub const fn local(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Interpret a raw status value; returns `None` for success or values
    /// without the error nibble.
    pub fn from_u32(value: u32) -> Option<Self> {
        if value & 0xF000_0000 == ERROR_NIBBLE {
            Some(Self(value))
        } else {
            None
        }
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorCode(0x{:08X})", self.0)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

// Common
pub const LWS_ERR_INVALID_PARAM: ErrorCode = ErrorCode::new(Module::Common, 0x0001);
pub const LWS_ERR_NO_MEMORY: ErrorCode = ErrorCode::new(Module::Common, 0x0002);
pub const LWS_ERR_INVALID_STATE: ErrorCode = ErrorCode::new(Module::Common, 0x0003);
pub const LWS_ERR_TIMEOUT: ErrorCode = ErrorCode::new(Module::Common, 0x0004);
pub const LWS_ERR_NOT_FOUND: ErrorCode = ErrorCode::new(Module::Common, 0x0005);
pub const LWS_ERR_NOT_SUPPORTED: ErrorCode = ErrorCode::new(Module::Common, 0x0006);
pub const LWS_ERR_CONFIG: ErrorCode = ErrorCode::new(Module::Common, 0x0007);

// Transport
pub const LWS_ERR_SOCKET_CREATE: ErrorCode = ErrorCode::new(Module::Transport, 0x0001);
pub const LWS_ERR_SOCKET_BIND: ErrorCode = ErrorCode::new(Module::Transport, 0x0002);
pub const LWS_ERR_SOCKET_CONNECT: ErrorCode = ErrorCode::new(Module::Transport, 0x0003);
pub const LWS_ERR_SOCKET_SEND: ErrorCode = ErrorCode::new(Module::Transport, 0x0004);
pub const LWS_ERR_SOCKET_RECV: ErrorCode = ErrorCode::new(Module::Transport, 0x0005);
pub const LWS_ERR_TRANSPORT_CLOSED: ErrorCode = ErrorCode::new(Module::Transport, 0x0006);
pub const LWS_ERR_TLS: ErrorCode = ErrorCode::new(Module::Transport, 0x0007);
pub const LWS_ERR_MQTT: ErrorCode = ErrorCode::new(Module::Transport, 0x0008);

// SIP
pub const LWS_ERR_SIP_PARSE: ErrorCode = ErrorCode::new(Module::Sip, 0x0001);
pub const LWS_ERR_SIP_TRANSACTION: ErrorCode = ErrorCode::new(Module::Sip, 0x0002);
pub const LWS_ERR_SIP_DIALOG: ErrorCode = ErrorCode::new(Module::Sip, 0x0003);
pub const LWS_ERR_SIP_AUTH: ErrorCode = ErrorCode::new(Module::Sip, 0x0004);
pub const LWS_ERR_SIP_TIMEOUT: ErrorCode = ErrorCode::new(Module::Sip, 0x0005);
pub const LWS_ERR_SIP_NO_DIALOG: ErrorCode = ErrorCode::new(Module::Sip, 0x0006);
pub const LWS_ERR_SIP_CANCEL_REJECTED: ErrorCode = ErrorCode::new(Module::Sip, 0x0007);
pub const LWS_ERR_SIP_BUILD: ErrorCode = ErrorCode::new(Module::Sip, 0x0008);

// RTP
pub const LWS_ERR_RTP_PACKET: ErrorCode = ErrorCode::new(Module::Rtp, 0x0001);
pub const LWS_ERR_RTCP_PACKET: ErrorCode = ErrorCode::new(Module::Rtp, 0x0002);

// Codec
pub const LWS_ERR_CODEC_UNSUPPORTED: ErrorCode = ErrorCode::new(Module::Codec, 0x0001);
pub const LWS_ERR_CODEC_PACKETIZE: ErrorCode = ErrorCode::new(Module::Codec, 0x0002);
pub const LWS_ERR_CODEC_DEPACKETIZE: ErrorCode = ErrorCode::new(Module::Codec, 0x0003);

// Media
pub const LWS_ERR_MEDIA_SDP: ErrorCode = ErrorCode::new(Module::Media, 0x0001);
pub const LWS_ERR_MEDIA_NEGOTIATION: ErrorCode = ErrorCode::new(Module::Media, 0x0002);
pub const LWS_ERR_MEDIA_ICE: ErrorCode = ErrorCode::new(Module::Media, 0x0003);
pub const LWS_ERR_MEDIA_STATE: ErrorCode = ErrorCode::new(Module::Media, 0x0004);

// Agent
pub const LWS_ERR_AGENT_NOT_STARTED: ErrorCode = ErrorCode::new(Module::Agent, 0x0001);
pub const LWS_ERR_AGENT_ALREADY_STARTED: ErrorCode = ErrorCode::new(Module::Agent, 0x0002);
pub const LWS_ERR_AGENT_NOT_REGISTERED: ErrorCode = ErrorCode::new(Module::Agent, 0x0003);
pub const LWS_ERR_AGENT_NO_CALL: ErrorCode = ErrorCode::new(Module::Agent, 0x0004);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(LWS_ERR_SOCKET_BIND.as_u32(), 0x8001_0002);
        assert_eq!(LWS_ERR_SIP_AUTH.as_u32(), 0x8002_0004);
        assert_eq!(LWS_ERR_SOCKET_BIND.module(), Some(Module::Transport));
        assert_eq!(LWS_ERR_SOCKET_BIND.local(), 2);
        assert_eq!(LWS_ERR_INVALID_PARAM.module(), Some(Module::Common));
    }

    #[test]
    fn test_from_u32() {
        assert_eq!(ErrorCode::from_u32(LWS_OK), None);
        assert_eq!(ErrorCode::from_u32(0x1234), None);
        assert_eq!(ErrorCode::from_u32(0x8003_0001), Some(LWS_ERR_RTP_PACKET));
    }

    #[test]
    fn test_display() {
        assert_eq!(LWS_ERR_MEDIA_ICE.to_string(), "0x80050003");
    }
}
