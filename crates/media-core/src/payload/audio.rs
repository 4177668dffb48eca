//! Audio payload formats (RFC 3551, RFC 7587)
//!
//! Audio frames always fit one packet. G.711 frames are exchanged with the
//! application as little-endian 16-bit PCM and companded here; G.722 and
//! Opus frames are already encoded and pass through untouched.

use bytes::Bytes;
use lws_rtp_core::RtpPacket;

use super::{Depacketizer, Packetizer, RtpPayload};
use crate::codec::g711;
use crate::error::{Error, Result};

/// Frames that are already encoded
#[derive(Debug, Default)]
pub struct PassthroughPacketizer;

impl PassthroughPacketizer {
    pub fn new() -> Self {
        Self
    }
}

impl Packetizer for PassthroughPacketizer {
    fn packetize(&mut self, frame: &[u8]) -> Result<Vec<RtpPayload>> {
        if frame.is_empty() {
            return Err(Error::Packetize("empty audio frame".into()));
        }
        Ok(vec![RtpPayload::new(Bytes::copy_from_slice(frame), false)])
    }
}

#[derive(Debug, Default)]
pub struct PassthroughDepacketizer;

impl Depacketizer for PassthroughDepacketizer {
    fn depacketize(&mut self, packet: &RtpPacket) -> Result<Option<Bytes>> {
        if packet.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(packet.payload.clone()))
    }
}

/// PCM in, G.711 out
pub struct G711Packetizer {
    compress: fn(i16) -> u8,
}

impl G711Packetizer {
    pub fn ulaw() -> Self {
        Self {
            compress: g711::ulaw_compress,
        }
    }

    pub fn alaw() -> Self {
        Self {
            compress: g711::alaw_compress,
        }
    }
}

impl Packetizer for G711Packetizer {
    fn packetize(&mut self, frame: &[u8]) -> Result<Vec<RtpPayload>> {
        if frame.is_empty() || frame.len() % 2 != 0 {
            return Err(Error::Packetize(format!(
                "G.711 expects 16-bit PCM, got {} bytes",
                frame.len()
            )));
        }
        let encoded = g711::encode_pcm_le(frame, self.compress);
        Ok(vec![RtpPayload::new(encoded, false)])
    }
}

/// G.711 in, PCM out
pub struct G711Depacketizer {
    expand: fn(u8) -> i16,
}

impl G711Depacketizer {
    pub fn ulaw() -> Self {
        Self {
            expand: g711::ulaw_expand,
        }
    }

    pub fn alaw() -> Self {
        Self {
            expand: g711::alaw_expand,
        }
    }
}

impl Depacketizer for G711Depacketizer {
    fn depacketize(&mut self, packet: &RtpPacket) -> Result<Option<Bytes>> {
        if packet.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(g711::decode_pcm_le(&packet.payload, self.expand))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::test_util::packet;

    #[test]
    fn test_g711_halves_the_frame() {
        // 20 ms at 8 kHz
        let pcm = vec![0u8; 320];
        let payloads = G711Packetizer::ulaw().packetize(&pcm).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].data.len(), 160);
        assert!(payloads[0].data.iter().all(|&b| b == 0xFF));
        assert!(!payloads[0].marker);

        let alaw = G711Packetizer::alaw().packetize(&pcm).unwrap();
        assert!(alaw[0].data.iter().all(|&b| b == 0xD5));
    }

    #[test]
    fn test_g711_rejects_odd_length() {
        assert!(G711Packetizer::alaw().packetize(&[1, 2, 3]).is_err());
        assert!(G711Packetizer::alaw().packetize(&[]).is_err());
    }

    #[test]
    fn test_g711_depacketize_to_pcm() {
        let frame = G711Depacketizer::ulaw()
            .depacketize(&packet(1, 0, false, &[0xFF, 0x00]))
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..2], &0i16.to_le_bytes());
        assert_eq!(&frame[2..], &(-32124i16).to_le_bytes());
    }

    #[test]
    fn test_passthrough() {
        let opus = [0x78, 0x01, 0x02];
        let payloads = PassthroughPacketizer::new().packetize(&opus).unwrap();
        assert_eq!(&payloads[0].data[..], &opus);
        let frame = PassthroughDepacketizer
            .depacketize(&packet(7, 960, false, &opus))
            .unwrap();
        assert_eq!(frame.as_deref(), Some(&opus[..]));
        assert!(PassthroughDepacketizer
            .depacketize(&packet(8, 960, false, &[]))
            .unwrap()
            .is_none());
    }
}
