use bytes::{Buf, BufMut, BytesMut};

use super::{NtpTimestamp, RtcpReportBlock};
use crate::error::Error;
use crate::{Result, RtpSsrc, RtpTimestamp};

/// Sender Report (SR), RFC 3550 §6.4.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSenderReport {
    /// SSRC of the sender
    pub ssrc: RtpSsrc,

    /// Wallclock time the report was sent
    pub ntp_timestamp: NtpTimestamp,

    /// RTP time corresponding to `ntp_timestamp`
    pub rtp_timestamp: RtpTimestamp,

    /// Packets sent since the start of transmission
    pub sender_packet_count: u32,

    /// Payload octets sent since the start of transmission
    pub sender_octet_count: u32,

    /// Reception reports about other sources
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpSenderReport {
    /// Sender info that precedes the report blocks
    const SENDER_INFO_SIZE: usize = 24;

    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            ntp_timestamp: NtpTimestamp::default(),
            rtp_timestamp: 0,
            sender_packet_count: 0,
            sender_octet_count: 0,
            report_blocks: Vec::new(),
        }
    }

    pub(crate) fn body_size(&self) -> usize {
        Self::SENDER_INFO_SIZE + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    pub(crate) fn serialize_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_timestamp.to_u64());
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.sender_packet_count);
        buf.put_u32(self.sender_octet_count);
        for block in &self.report_blocks {
            block.serialize(buf);
        }
    }
}

/// Parse the body of an SR carrying `report_count` blocks
pub fn parse_sender_report(buf: &mut impl Buf, report_count: u8) -> Result<RtcpSenderReport> {
    if buf.remaining() < RtcpSenderReport::SENDER_INFO_SIZE {
        return Err(Error::BufferTooSmall {
            required: RtcpSenderReport::SENDER_INFO_SIZE,
            available: buf.remaining(),
        });
    }

    let ssrc = buf.get_u32();
    let ntp_timestamp = NtpTimestamp::from_u64(buf.get_u64());
    let rtp_timestamp = buf.get_u32();
    let sender_packet_count = buf.get_u32();
    let sender_octet_count = buf.get_u32();

    let report_blocks = (0..report_count)
        .map(|_| RtcpReportBlock::parse(buf))
        .collect::<Result<Vec<_>>>()?;

    Ok(RtcpSenderReport {
        ssrc,
        ntp_timestamp,
        rtp_timestamp,
        sender_packet_count,
        sender_octet_count,
        report_blocks,
    })
}
