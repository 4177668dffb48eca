use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// SDES item types, RFC 3550 §6.5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpSdesItemType {
    Cname,
    Name,
    Email,
    Phone,
    Location,
    Tool,
    Note,
    Private,
    Other(u8),
}

impl RtcpSdesItemType {
    pub fn as_u8(&self) -> u8 {
        match self {
            RtcpSdesItemType::Cname => 1,
            RtcpSdesItemType::Name => 2,
            RtcpSdesItemType::Email => 3,
            RtcpSdesItemType::Phone => 4,
            RtcpSdesItemType::Location => 5,
            RtcpSdesItemType::Tool => 6,
            RtcpSdesItemType::Note => 7,
            RtcpSdesItemType::Private => 8,
            RtcpSdesItemType::Other(value) => *value,
        }
    }
}

impl From<u8> for RtcpSdesItemType {
    fn from(value: u8) -> Self {
        match value {
            1 => RtcpSdesItemType::Cname,
            2 => RtcpSdesItemType::Name,
            3 => RtcpSdesItemType::Email,
            4 => RtcpSdesItemType::Phone,
            5 => RtcpSdesItemType::Location,
            6 => RtcpSdesItemType::Tool,
            7 => RtcpSdesItemType::Note,
            8 => RtcpSdesItemType::Private,
            other => RtcpSdesItemType::Other(other),
        }
    }
}

/// One SDES item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSdesItem {
    pub item_type: RtcpSdesItemType,
    pub value: String,
}

impl RtcpSdesItem {
    pub fn cname(value: impl Into<String>) -> Self {
        Self {
            item_type: RtcpSdesItemType::Cname,
            value: value.into(),
        }
    }

    fn value_bytes(&self) -> &[u8] {
        &self.value.as_bytes()[..self.value.len().min(255)]
    }
}

/// Items describing one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSdesChunk {
    pub ssrc: RtpSsrc,
    pub items: Vec<RtcpSdesItem>,
}

impl RtcpSdesChunk {
    fn size(&self) -> usize {
        let items: usize = self.items.iter().map(|i| 2 + i.value_bytes().len()).sum();
        // At least one null octet ends the item list, then pad to 32 bits
        4 + (items + 4) / 4 * 4
    }
}

/// Source Description (SDES)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpSourceDescription {
    pub chunks: Vec<RtcpSdesChunk>,
}

impl RtcpSourceDescription {
    /// SDES carrying just a CNAME, the one item every compound packet needs
    pub fn with_cname(ssrc: RtpSsrc, cname: impl Into<String>) -> Self {
        Self {
            chunks: vec![RtcpSdesChunk {
                ssrc,
                items: vec![RtcpSdesItem::cname(cname)],
            }],
        }
    }

    /// CNAME of `ssrc`, if described
    pub fn cname(&self, ssrc: RtpSsrc) -> Option<&str> {
        self.chunks
            .iter()
            .filter(|c| c.ssrc == ssrc)
            .flat_map(|c| c.items.iter())
            .find(|i| i.item_type == RtcpSdesItemType::Cname)
            .map(|i| i.value.as_str())
    }

    pub(crate) fn body_size(&self) -> usize {
        self.chunks.iter().map(RtcpSdesChunk::size).sum()
    }

    pub(crate) fn serialize_body(&self, buf: &mut BytesMut) {
        for chunk in &self.chunks {
            buf.put_u32(chunk.ssrc);
            let mut written = 0;
            for item in &chunk.items {
                let value = item.value_bytes();
                buf.put_u8(item.item_type.as_u8());
                buf.put_u8(value.len() as u8);
                buf.put_slice(value);
                written += 2 + value.len();
            }
            buf.put_bytes(0, 4 - written % 4);
        }
    }
}

/// Parse an SDES body holding `chunk_count` chunks
pub fn parse_sdes(buf: &mut impl Buf, chunk_count: u8) -> Result<RtcpSourceDescription> {
    let mut chunks = Vec::with_capacity(chunk_count as usize);
    for _ in 0..chunk_count {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall {
                required: 4,
                available: buf.remaining(),
            });
        }
        let ssrc = buf.get_u32();
        let mut items = Vec::new();
        let mut consumed = 0;
        loop {
            if !buf.has_remaining() {
                return Err(Error::RtcpError("SDES chunk not terminated".into()));
            }
            let item_type = buf.get_u8();
            consumed += 1;
            if item_type == 0 {
                break;
            }
            if !buf.has_remaining() {
                return Err(Error::RtcpError("SDES item without length".into()));
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(Error::BufferTooSmall {
                    required: len,
                    available: buf.remaining(),
                });
            }
            let value = buf.copy_to_bytes(len);
            consumed += 1 + len;
            items.push(RtcpSdesItem {
                item_type: item_type.into(),
                value: String::from_utf8_lossy(&value).into_owned(),
            });
        }
        let padding = ((4 - consumed % 4) % 4).min(buf.remaining());
        buf.advance(padding);
        chunks.push(RtcpSdesChunk { ssrc, items });
    }
    Ok(RtcpSourceDescription { chunks })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cname_chunk_layout() {
        let sdes = RtcpSourceDescription::with_cname(0x01020304, "alice@host");
        let mut buf = BytesMut::new();
        sdes.serialize_body(&mut buf);
        // 4 SSRC + 2 + 10 item + 4 null/padding
        assert_eq!(buf.len(), 20);
        assert_eq!(sdes.body_size(), 20);
        assert_eq!(&buf[4..6], &[1, 10]);
        assert_eq!(&buf[16..], &[0, 0, 0, 0]);

        let parsed = parse_sdes(&mut buf.freeze(), 1).unwrap();
        assert_eq!(parsed.cname(0x01020304), Some("alice@host"));
        assert_eq!(parsed.cname(7), None);
    }

    #[test]
    fn test_unterminated_chunk() {
        let mut data = &[0, 0, 0, 1, 1, 2, b'a', b'b'][..];
        assert!(parse_sdes(&mut data, 1).is_err());
    }
}
