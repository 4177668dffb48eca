//! RTCP packets
//!
//! Sender and receiver reports, source descriptions and BYE as defined in
//! RFC 3550 §6.4–6.6. Packets travel in compound datagrams; see
//! [`RtcpPacket::parse_compound`] and [`RtcpPacket::serialize_compound`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::Error;
use crate::Result;

mod bye;
mod ntp;
mod receiver_report;
mod report_block;
mod sdes;
mod sender_report;

pub use bye::{parse_bye, RtcpGoodbye};
pub use ntp::{to_dlsr_units, NtpTimestamp};
pub use receiver_report::{parse_receiver_report, RtcpReceiverReport};
pub use report_block::RtcpReportBlock;
pub use sdes::{parse_sdes, RtcpSdesChunk, RtcpSdesItem, RtcpSdesItemType, RtcpSourceDescription};
pub use sender_report::{parse_sender_report, RtcpSenderReport};

/// RTCP version (same as RTP, always 2)
pub const RTCP_VERSION: u8 = 2;

/// Common header: V/P/count, packet type, length
pub const RTCP_HEADER_SIZE: usize = 4;

/// Reports, chunks and sources are counted in 5 bits
const MAX_COUNT: usize = 31;

/// RTCP packet types as defined in RFC 3550
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Sender Report (SR)
    SenderReport = 200,

    /// Receiver Report (RR)
    ReceiverReport = 201,

    /// Source Description (SDES)
    SourceDescription = 202,

    /// Goodbye (BYE)
    Goodbye = 203,
}

impl TryFrom<u8> for RtcpPacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            200 => Ok(RtcpPacketType::SenderReport),
            201 => Ok(RtcpPacketType::ReceiverReport),
            202 => Ok(RtcpPacketType::SourceDescription),
            203 => Ok(RtcpPacketType::Goodbye),
            _ => Err(Error::RtcpError(format!("Unknown RTCP packet type: {}", value))),
        }
    }
}

/// RTCP packet variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(RtcpSenderReport),
    ReceiverReport(RtcpReceiverReport),
    SourceDescription(RtcpSourceDescription),
    Goodbye(RtcpGoodbye),
}

impl RtcpPacket {
    pub fn packet_type(&self) -> RtcpPacketType {
        match self {
            RtcpPacket::SenderReport(_) => RtcpPacketType::SenderReport,
            RtcpPacket::ReceiverReport(_) => RtcpPacketType::ReceiverReport,
            RtcpPacket::SourceDescription(_) => RtcpPacketType::SourceDescription,
            RtcpPacket::Goodbye(_) => RtcpPacketType::Goodbye,
        }
    }

    fn count(&self) -> usize {
        match self {
            RtcpPacket::SenderReport(sr) => sr.report_blocks.len(),
            RtcpPacket::ReceiverReport(rr) => rr.report_blocks.len(),
            RtcpPacket::SourceDescription(sdes) => sdes.chunks.len(),
            RtcpPacket::Goodbye(bye) => bye.sources.len(),
        }
    }

    fn body_size(&self) -> usize {
        match self {
            RtcpPacket::SenderReport(sr) => sr.body_size(),
            RtcpPacket::ReceiverReport(rr) => rr.body_size(),
            RtcpPacket::SourceDescription(sdes) => sdes.body_size(),
            RtcpPacket::Goodbye(bye) => bye.body_size(),
        }
    }

    /// Size on the wire, header included
    pub fn size(&self) -> usize {
        RTCP_HEADER_SIZE + self.body_size()
    }

    /// Parse the first RTCP packet in `data`
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        match Self::parse_one(&mut buf)? {
            Some(packet) => Ok(packet),
            None => Err(Error::RtcpError("Unsupported RTCP packet type".into())),
        }
    }

    /// Parse every packet of a compound datagram. Packet types this crate
    /// does not model (APP, XR, feedback) are skipped.
    pub fn parse_compound(data: &[u8]) -> Result<Vec<Self>> {
        let mut buf = Bytes::copy_from_slice(data);
        let mut packets = Vec::new();
        while buf.has_remaining() {
            if let Some(packet) = Self::parse_one(&mut buf)? {
                packets.push(packet);
            }
        }
        if packets.is_empty() {
            return Err(Error::RtcpError("No usable RTCP packet".into()));
        }
        Ok(packets)
    }

    /// Consume one packet from `buf`; `None` for a skipped type
    fn parse_one(buf: &mut Bytes) -> Result<Option<Self>> {
        if buf.remaining() < RTCP_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTCP_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let first_byte = buf.get_u8();
        let version = first_byte >> 6;
        if version != RTCP_VERSION {
            return Err(Error::RtcpError(format!("Invalid RTCP version: {}", version)));
        }
        let padding = first_byte & 0x20 != 0;
        let count = first_byte & 0x1F;
        let packet_type = buf.get_u8();
        // Length in 32-bit words minus one
        let length = buf.get_u16() as usize * 4;

        if buf.remaining() < length {
            return Err(Error::BufferTooSmall {
                required: length,
                available: buf.remaining(),
            });
        }
        let mut body = buf.split_to(length);
        if padding {
            let pad = body.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > body.len() {
                return Err(Error::RtcpError(format!("Invalid RTCP padding: {}", pad)));
            }
            body.truncate(body.len() - pad);
        }

        let packet = match RtcpPacketType::try_from(packet_type) {
            Ok(RtcpPacketType::SenderReport) => {
                RtcpPacket::SenderReport(parse_sender_report(&mut body, count)?)
            }
            Ok(RtcpPacketType::ReceiverReport) => {
                RtcpPacket::ReceiverReport(parse_receiver_report(&mut body, count)?)
            }
            Ok(RtcpPacketType::SourceDescription) => {
                RtcpPacket::SourceDescription(parse_sdes(&mut body, count)?)
            }
            Ok(RtcpPacketType::Goodbye) => RtcpPacket::Goodbye(parse_bye(&mut body, count)?),
            Err(_) => {
                debug!(packet_type, length, "Skipping RTCP packet");
                return Ok(None);
            }
        };
        Ok(Some(packet))
    }

    /// Append this packet, header included, to `buf`
    pub fn serialize_into(&self, buf: &mut BytesMut) -> Result<()> {
        let count = self.count();
        if count > MAX_COUNT {
            return Err(Error::InvalidParameter(format!(
                "{} items exceed the RTCP count field",
                count
            )));
        }
        let body_size = self.body_size();
        buf.reserve(RTCP_HEADER_SIZE + body_size);
        buf.put_u8((RTCP_VERSION << 6) | count as u8);
        buf.put_u8(self.packet_type() as u8);
        buf.put_u16((body_size / 4) as u16);

        match self {
            RtcpPacket::SenderReport(sr) => sr.serialize_body(buf),
            RtcpPacket::ReceiverReport(rr) => rr.serialize_body(buf),
            RtcpPacket::SourceDescription(sdes) => sdes.serialize_body(buf),
            RtcpPacket::Goodbye(bye) => bye.serialize_body(buf),
        }
        Ok(())
    }

    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.serialize_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Build a compound datagram. RFC 3550 §6.1 requires it to start with
    /// an SR or RR.
    pub fn serialize_compound(packets: &[RtcpPacket]) -> Result<Bytes> {
        match packets.first() {
            Some(RtcpPacket::SenderReport(_)) | Some(RtcpPacket::ReceiverReport(_)) => {}
            _ => {
                return Err(Error::InvalidParameter(
                    "Compound RTCP must start with SR or RR".into(),
                ))
            }
        }
        let mut buf = BytesMut::with_capacity(packets.iter().map(RtcpPacket::size).sum());
        for packet in packets {
            packet.serialize_into(&mut buf)?;
        }
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtcp_packet_type_conversion() {
        assert_eq!(
            RtcpPacketType::try_from(200).unwrap(),
            RtcpPacketType::SenderReport
        );
        assert_eq!(
            RtcpPacketType::try_from(203).unwrap(),
            RtcpPacketType::Goodbye
        );
        assert!(RtcpPacketType::try_from(100).is_err());
    }

    fn sample_sr() -> RtcpSenderReport {
        let mut sr = RtcpSenderReport::new(0xAABBCCDD);
        sr.ntp_timestamp = NtpTimestamp {
            seconds: 3_900_000_000,
            fraction: 0x4000_0000,
        };
        sr.rtp_timestamp = 160_000;
        sr.sender_packet_count = 1000;
        sr.sender_octet_count = 160_000;
        let mut block = RtcpReportBlock::new(0x11223344);
        block.fraction_lost = 12;
        block.highest_seq = 0x0001_0005;
        sr.report_blocks.push(block);
        sr
    }

    #[test]
    fn test_sender_report_wire_format() {
        let packet = RtcpPacket::SenderReport(sample_sr());
        let data = packet.serialize().unwrap();
        assert_eq!(data.len(), 4 + 24 + 24);
        assert_eq!(data[0], 0x81);
        assert_eq!(data[1], 200);
        // 52 bytes = 13 words, minus one
        assert_eq!(u16::from_be_bytes([data[2], data[3]]), 12);
        assert_eq!(RtcpPacket::parse(&data).unwrap(), packet);
    }

    #[test]
    fn test_compound_sr_sdes_bye() {
        let packets = vec![
            RtcpPacket::SenderReport(sample_sr()),
            RtcpPacket::SourceDescription(RtcpSourceDescription::with_cname(
                0xAABBCCDD,
                "lws@10.0.0.1",
            )),
            RtcpPacket::Goodbye(RtcpGoodbye::new_with_reason(0xAABBCCDD, "hangup")),
        ];
        let data = RtcpPacket::serialize_compound(&packets).unwrap();
        assert_eq!(data.len() % 4, 0);
        assert_eq!(RtcpPacket::parse_compound(&data).unwrap(), packets);
    }

    #[test]
    fn test_compound_must_start_with_report() {
        let bye = RtcpPacket::Goodbye(RtcpGoodbye::new_for_source(1));
        assert!(RtcpPacket::serialize_compound(&[bye]).is_err());
    }

    #[test]
    fn test_unknown_types_are_skipped() {
        let rr = RtcpPacket::ReceiverReport(RtcpReceiverReport::new(5))
            .serialize()
            .unwrap();
        // APP packet: header plus 8 bytes
        let mut data = BytesMut::from(&rr[..]);
        data.extend_from_slice(&[0x80, 204, 0, 2, 0, 0, 0, 5, b'n', b'a', b'm', b'e']);
        let packets = RtcpPacket::parse_compound(&data).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(matches!(packets[0], RtcpPacket::ReceiverReport(ref rr) if rr.ssrc == 5));
    }

    #[test]
    fn test_truncated_length() {
        let data = [0x80, 201, 0, 6, 0, 0, 0, 1];
        assert!(matches!(
            RtcpPacket::parse(&data),
            Err(Error::BufferTooSmall { required: 24, .. })
        ));
    }
}
