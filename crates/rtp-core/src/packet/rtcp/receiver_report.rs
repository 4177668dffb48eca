use bytes::{Buf, BufMut, BytesMut};

use super::RtcpReportBlock;
use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Receiver Report (RR), RFC 3550 §6.4.2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReceiverReport {
    /// SSRC of the receiver sending this report
    pub ssrc: RtpSsrc,

    /// Report blocks
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpReceiverReport {
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            report_blocks: Vec::new(),
        }
    }

    pub fn add_report_block(&mut self, block: RtcpReportBlock) {
        self.report_blocks.push(block);
    }

    pub(crate) fn body_size(&self) -> usize {
        4 + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    pub(crate) fn serialize_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        for block in &self.report_blocks {
            block.serialize(buf);
        }
    }
}

/// Parse the body of an RR carrying `report_count` blocks
pub fn parse_receiver_report(buf: &mut impl Buf, report_count: u8) -> Result<RtcpReceiverReport> {
    if buf.remaining() < 4 {
        return Err(Error::BufferTooSmall {
            required: 4,
            available: buf.remaining(),
        });
    }

    let ssrc = buf.get_u32();
    let report_blocks = (0..report_count)
        .map(|_| RtcpReportBlock::parse(buf))
        .collect::<Result<Vec<_>>>()?;

    Ok(RtcpReceiverReport {
        ssrc,
        report_blocks,
    })
}
