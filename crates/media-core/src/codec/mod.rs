//! Codec catalogue
//!
//! Only identification and framing parameters live here. Audio and video
//! coding itself belongs to the application; the exception is G.711,
//! whose companding is simple enough to do inline.

use std::fmt;
use std::str::FromStr;

use lws_sip_core::sdp::RtpMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod g711;

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Media token used in `m=` lines
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn from_sdp(media: &str) -> Option<Self> {
        match media {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codecs the stack can negotiate and packetize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    /// G.711 µ-law
    Pcmu,
    /// G.711 A-law
    Pcma,
    G722,
    Opus,
    H264,
    H265,
    Vp8,
    Vp9,
}

impl CodecId {
    pub const ALL: [CodecId; 8] = [
        CodecId::Pcmu,
        CodecId::Pcma,
        CodecId::G722,
        CodecId::Opus,
        CodecId::H264,
        CodecId::H265,
        CodecId::Vp8,
        CodecId::Vp9,
    ];

    pub fn kind(&self) -> MediaKind {
        match self {
            CodecId::Pcmu | CodecId::Pcma | CodecId::G722 | CodecId::Opus => MediaKind::Audio,
            CodecId::H264 | CodecId::H265 | CodecId::Vp8 | CodecId::Vp9 => MediaKind::Video,
        }
    }

    /// Encoding name as written in `a=rtpmap`
    pub fn encoding_name(&self) -> &'static str {
        match self {
            CodecId::Pcmu => "PCMU",
            CodecId::Pcma => "PCMA",
            CodecId::G722 => "G722",
            CodecId::Opus => "opus",
            CodecId::H264 => "H264",
            CodecId::H265 => "H265",
            CodecId::Vp8 => "VP8",
            CodecId::Vp9 => "VP9",
        }
    }

    /// RTP clock rate. G.722 keeps 8000 for historical reasons (RFC 3551 §4.5.2).
    pub fn clock_rate(&self) -> u32 {
        match self {
            CodecId::Pcmu | CodecId::Pcma | CodecId::G722 => 8000,
            CodecId::Opus => 48_000,
            CodecId::H264 | CodecId::H265 | CodecId::Vp8 | CodecId::Vp9 => 90_000,
        }
    }

    /// Audio sampling rate handed to the application
    pub fn sample_rate(&self) -> u32 {
        match self {
            CodecId::G722 => 16_000,
            other => other.clock_rate(),
        }
    }

    /// Channel count advertised in `a=rtpmap`
    pub fn channels(&self) -> Option<u8> {
        match self {
            CodecId::Opus => Some(2),
            _ => None,
        }
    }

    pub fn default_payload_type(&self) -> u8 {
        match self {
            CodecId::Pcmu => 0,
            CodecId::Pcma => 8,
            CodecId::G722 => 9,
            CodecId::Opus => 111,
            CodecId::H264 => 96,
            CodecId::H265 => 98,
            CodecId::Vp8 => 100,
            CodecId::Vp9 => 101,
        }
    }

    /// Statically assigned in RFC 3551
    pub fn is_static(&self) -> bool {
        self.default_payload_type() < 96
    }

    /// Codec owning a static payload type
    pub fn from_static_payload_type(payload_type: u8) -> Option<Self> {
        match payload_type {
            0 => Some(CodecId::Pcmu),
            8 => Some(CodecId::Pcma),
            9 => Some(CodecId::G722),
            _ => None,
        }
    }

    /// Match an `a=rtpmap` entry; names compare case-insensitively
    pub fn from_encoding(name: &str, clock_rate: u32) -> Option<Self> {
        CodecId::ALL
            .into_iter()
            .find(|c| c.encoding_name().eq_ignore_ascii_case(name) && c.clock_rate() == clock_rate)
    }

    /// `a=rtpmap` entry for this codec under `payload_type`
    pub fn rtpmap(&self, payload_type: u8) -> RtpMap {
        RtpMap {
            payload_type,
            encoding: self.encoding_name().to_string(),
            clock_rate: self.clock_rate(),
            channels: self.channels(),
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

impl FromStr for CodecId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CodecId::ALL
            .into_iter()
            .find(|c| c.encoding_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnsupportedCodec(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_type_table() {
        let table: Vec<(CodecId, u8)> = CodecId::ALL
            .iter()
            .map(|c| (*c, c.default_payload_type()))
            .collect();
        assert_eq!(
            table,
            vec![
                (CodecId::Pcmu, 0),
                (CodecId::Pcma, 8),
                (CodecId::G722, 9),
                (CodecId::Opus, 111),
                (CodecId::H264, 96),
                (CodecId::H265, 98),
                (CodecId::Vp8, 100),
                (CodecId::Vp9, 101),
            ]
        );
    }

    #[test]
    fn test_from_encoding() {
        assert_eq!(CodecId::from_encoding("OPUS", 48000), Some(CodecId::Opus));
        assert_eq!(CodecId::from_encoding("h264", 90000), Some(CodecId::H264));
        assert_eq!(CodecId::from_encoding("PCMU", 16000), None);
        assert_eq!(CodecId::from_encoding("iLBC", 8000), None);
    }

    #[test]
    fn test_rtpmap_rendering() {
        assert_eq!(CodecId::Opus.rtpmap(111).to_string(), "111 opus/48000/2");
        assert_eq!(CodecId::Pcma.rtpmap(8).to_string(), "8 PCMA/8000");
    }

    #[test]
    fn test_parse_and_kind() {
        assert_eq!("vp9".parse::<CodecId>().unwrap(), CodecId::Vp9);
        assert_eq!(CodecId::Vp9.kind(), MediaKind::Video);
        assert!("speex".parse::<CodecId>().is_err());
        assert_eq!(CodecId::G722.sample_rate(), 16000);
        assert_eq!(CodecId::G722.clock_rate(), 8000);
    }
}
