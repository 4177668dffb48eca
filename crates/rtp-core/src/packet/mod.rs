//! RTP and RTCP packets (RFC 3550 §5 and §6)

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpCsrc, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

pub mod rtcp;

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// At most 15 contributing sources fit the 4-bit CC field
pub const RTP_MAX_CSRC: usize = 15;

/// RTP header implementation according to RFC 3550
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (should be 2)
    pub version: u8,

    /// Padding flag
    pub padding: bool,

    /// Marker bit
    pub marker: bool,

    /// Payload type
    pub payload_type: u8,

    /// Sequence number
    pub sequence_number: RtpSequenceNumber,

    /// Timestamp
    pub timestamp: RtpTimestamp,

    /// Synchronization source identifier
    pub ssrc: RtpSsrc,

    /// Contributing source identifiers
    pub csrc: Vec<RtpCsrc>,

    /// Header extension: profile-defined id and data (a multiple of 4 bytes)
    pub extension: Option<(u16, Bytes)>,
}

impl RtpHeader {
    /// Create a new RTP header with default values
    pub fn new(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
        }
    }

    /// Get the size of the header in bytes
    pub fn size(&self) -> usize {
        let mut size = RTP_MIN_HEADER_SIZE + self.csrc.len() * 4;
        if let Some((_, data)) = &self.extension {
            size += 4 + (data.len() + 3) / 4 * 4;
        }
        size
    }

    /// Parse an RTP header from bytes
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_MIN_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        // V(2) P(1) X(1) CC(4)
        let first_byte = buf.get_u8();
        let version = first_byte >> 6;
        if version != RTP_VERSION {
            return Err(Error::InvalidPacket(format!(
                "Invalid RTP version: {}",
                version
            )));
        }
        let padding = first_byte & 0x20 != 0;
        let has_extension = first_byte & 0x10 != 0;
        let cc = first_byte & 0x0F;

        // M(1) PT(7)
        let second_byte = buf.get_u8();
        let marker = second_byte & 0x80 != 0;
        let payload_type = second_byte & 0x7F;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let csrc_len = cc as usize * 4;
        if buf.remaining() < csrc_len {
            return Err(Error::BufferTooSmall {
                required: csrc_len,
                available: buf.remaining(),
            });
        }
        let csrc = (0..cc).map(|_| buf.get_u32()).collect();

        let extension = if has_extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall {
                    required: 4,
                    available: buf.remaining(),
                });
            }
            let id = buf.get_u16();
            // Length in 32-bit words
            let len = buf.get_u16() as usize * 4;
            if buf.remaining() < len {
                return Err(Error::BufferTooSmall {
                    required: len,
                    available: buf.remaining(),
                });
            }
            Some((id, buf.copy_to_bytes(len)))
        } else {
            None
        };

        Ok(Self {
            version,
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
        })
    }

    /// Serialize the header to bytes
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.csrc.len() > RTP_MAX_CSRC {
            return Err(Error::InvalidParameter(format!(
                "{} CSRCs exceed the limit of {}",
                self.csrc.len(),
                RTP_MAX_CSRC
            )));
        }
        if self.payload_type > 0x7F {
            return Err(Error::InvalidParameter(format!(
                "Payload type {} does not fit 7 bits",
                self.payload_type
            )));
        }
        buf.reserve(self.size());

        let mut first_byte = (self.version & 0x03) << 6;
        if self.padding {
            first_byte |= 0x20;
        }
        if self.extension.is_some() {
            first_byte |= 0x10;
        }
        first_byte |= self.csrc.len() as u8;
        buf.put_u8(first_byte);

        let mut second_byte = self.payload_type;
        if self.marker {
            second_byte |= 0x80;
        }
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if let Some((id, data)) = &self.extension {
            let words = (data.len() + 3) / 4;
            buf.put_u16(*id);
            buf.put_u16(words as u16);
            buf.put_slice(data);
            buf.put_bytes(0, words * 4 - data.len());
        }

        Ok(())
    }
}

/// RTP packet implementation
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// RTP header
    pub header: RtpHeader,

    /// Payload data, without padding
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a new RTP packet
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Create a new RTP packet with basic parameters
    pub fn new_with_payload(
        payload_type: u8,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        payload: Bytes,
    ) -> Self {
        let header = RtpHeader::new(payload_type, sequence_number, timestamp, ssrc);
        Self { header, payload }
    }

    fn padding_len(&self) -> usize {
        if self.header.padding {
            // Always at least one byte, holding the count
            4 - (self.header.size() + self.payload.len()) % 4
        } else {
            0
        }
    }

    /// Get the total size of the packet in bytes
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len() + self.padding_len()
    }

    /// Parse an RTP packet from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        let header = RtpHeader::parse(&mut buf)?;

        let padding_bytes = if header.padding {
            let padding = buf.last().copied().unwrap_or(0) as usize;
            if padding == 0 || padding > buf.len() {
                return Err(Error::InvalidPacket(format!(
                    "Invalid padding value: {} with {} bytes remaining",
                    padding,
                    buf.len()
                )));
            }
            padding
        } else {
            0
        };

        let payload = buf.slice(0..buf.len() - padding_bytes);
        Ok(Self { header, payload })
    }

    /// Serialize the packet to bytes
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.serialize(&mut buf)?;
        buf.put_slice(&self.payload);

        let padding = self.padding_len();
        if padding > 0 {
            buf.put_bytes(0, padding - 1);
            buf.put_u8(padding as u8);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Tell RTCP from RTP on a muxed port (RFC 5761 §4): RTCP packet types
/// 200..=207 sit where RTP carries the marker and payload type.
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] >> 6 == RTP_VERSION && (200..=207).contains(&data[1])
}
