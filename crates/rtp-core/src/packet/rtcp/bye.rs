use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// RTCP Goodbye (BYE) packet
/// Defined in RFC 3550 Section 6.6
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpGoodbye {
    /// SSRC/CSRC identifiers
    pub sources: Vec<RtpSsrc>,

    /// Reason for leaving (optional)
    pub reason: Option<String>,
}

impl RtcpGoodbye {
    /// Create a new BYE packet for a single source
    pub fn new_for_source(ssrc: RtpSsrc) -> Self {
        Self {
            sources: vec![ssrc],
            reason: None,
        }
    }

    /// Create a new BYE packet for a single source with a reason
    pub fn new_with_reason(ssrc: RtpSsrc, reason: impl Into<String>) -> Self {
        Self {
            sources: vec![ssrc],
            reason: Some(reason.into()),
        }
    }

    fn reason_bytes(&self) -> Option<&[u8]> {
        // The length octet caps the reason at 255 bytes
        self.reason
            .as_deref()
            .map(|r| &r.as_bytes()[..r.len().min(255)])
    }

    pub(crate) fn body_size(&self) -> usize {
        let mut size = self.sources.len() * 4;
        if let Some(reason) = self.reason_bytes() {
            size += (1 + reason.len() + 3) / 4 * 4;
        }
        size
    }

    pub(crate) fn serialize_body(&self, buf: &mut BytesMut) {
        for ssrc in &self.sources {
            buf.put_u32(*ssrc);
        }
        if let Some(reason) = self.reason_bytes() {
            buf.put_u8(reason.len() as u8);
            buf.put_slice(reason);
            buf.put_bytes(0, (4 - (1 + reason.len()) % 4) % 4);
        }
    }
}

/// Parse BYE packet from bytes
pub fn parse_bye(buf: &mut impl Buf, source_count: u8) -> Result<RtcpGoodbye> {
    let needed = source_count as usize * 4;
    if buf.remaining() < needed {
        return Err(Error::BufferTooSmall {
            required: needed,
            available: buf.remaining(),
        });
    }
    let sources = (0..source_count).map(|_| buf.get_u32()).collect();

    let reason = if buf.has_remaining() {
        let reason_len = buf.get_u8() as usize;
        if buf.remaining() < reason_len {
            return Err(Error::BufferTooSmall {
                required: reason_len,
                available: buf.remaining(),
            });
        }
        let bytes = buf.copy_to_bytes(reason_len);
        // Skip padding
        let padding = ((4 - (1 + reason_len) % 4) % 4).min(buf.remaining());
        buf.advance(padding);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        None
    };

    Ok(RtcpGoodbye { sources, reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_calculation() {
        assert_eq!(RtcpGoodbye::default().body_size(), 0);
        assert_eq!(RtcpGoodbye::new_for_source(1).body_size(), 4);
        // 4 + (1 + 3 -> 4)
        assert_eq!(RtcpGoodbye::new_with_reason(1, "bye").body_size(), 8);
        // 4 + (1 + 4 -> 8)
        assert_eq!(RtcpGoodbye::new_with_reason(1, "done").body_size(), 12);
    }

    #[test]
    fn test_reason_padding() {
        let bye = RtcpGoodbye::new_with_reason(0x12345678, "done");
        let mut buf = BytesMut::new();
        bye.serialize_body(&mut buf);
        assert_eq!(buf.len(), bye.body_size());
        assert_eq!(&buf[4..], &[4, b'd', b'o', b'n', b'e', 0, 0, 0]);

        let parsed = parse_bye(&mut buf.freeze(), 1).unwrap();
        assert_eq!(parsed, bye);
    }

    #[test]
    fn test_truncated_sources() {
        let mut data = &[0u8; 6][..];
        assert!(parse_bye(&mut data, 2).is_err());
    }
}
