//! H.265 payload format (RFC 7798), without DONL
//!
//! NAL unit headers are two bytes; the type sits in bits 1..=6 of the
//! first byte. Aggregation packets (48) are accepted on receive,
//! fragmentation units (49) are used both ways.

use bytes::{BufMut, Bytes, BytesMut};
use lws_rtp_core::RtpPacket;
use tracing::{debug, trace};

use super::{split_annex_b, Depacketizer, FrameTracker, Packetizer, RtpPayload, START_CODE};
use crate::error::{Error, Result};

const AGGREGATION: u8 = 48;
const FRAGMENTATION: u8 = 49;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;
const FU_TYPE_MASK: u8 = 0x3F;

fn nal_type(first_byte: u8) -> u8 {
    (first_byte >> 1) & 0x3F
}

/// First header byte with its type field replaced
fn with_type(first_byte: u8, nal_type: u8) -> u8 {
    (first_byte & 0x81) | (nal_type << 1)
}

pub struct H265Packetizer {
    max_payload: usize,
}

impl H265Packetizer {
    pub fn new(max_payload: usize) -> Self {
        // Payload header, FU header and one byte
        Self {
            max_payload: max_payload.max(4),
        }
    }
}

impl Packetizer for H265Packetizer {
    fn packetize(&mut self, frame: &[u8]) -> Result<Vec<RtpPayload>> {
        let mut payloads = Vec::new();
        for nal in split_annex_b(frame) {
            if nal.len() < 3 {
                return Err(Error::Packetize(format!("H.265 NAL unit of {} bytes", nal.len())));
            }
            if nal.len() <= self.max_payload {
                payloads.push(RtpPayload::new(Bytes::copy_from_slice(nal), false));
                continue;
            }

            let header = [with_type(nal[0], FRAGMENTATION), nal[1]];
            let original_type = nal_type(nal[0]);
            let chunks: Vec<&[u8]> = nal[2..].chunks(self.max_payload - 3).collect();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let mut fu_header = original_type;
                if i == 0 {
                    fu_header |= FU_START;
                }
                if i == last {
                    fu_header |= FU_END;
                }
                let mut data = BytesMut::with_capacity(chunk.len() + 3);
                data.put_slice(&header);
                data.put_u8(fu_header);
                data.put_slice(chunk);
                payloads.push(RtpPayload::new(data.freeze(), false));
            }
        }
        match payloads.last_mut() {
            Some(last) => last.marker = true,
            None => return Err(Error::Packetize("no NAL unit in H.265 frame".into())),
        }
        Ok(payloads)
    }
}

#[derive(Default)]
pub struct H265Depacketizer {
    tracker: FrameTracker,
    frame: BytesMut,
    fragment: Option<BytesMut>,
}

impl H265Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_nal(&mut self, nal: &[u8]) {
        self.frame.put_slice(&START_CODE);
        self.frame.put_slice(nal);
    }

    fn aggregate(&mut self, payload: &[u8]) -> Result<()> {
        let mut rest = &payload[2..];
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(Error::Depacketize("truncated aggregation unit size".into()));
            }
            let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if size < 2 || size > rest.len() {
                return Err(Error::Depacketize(format!(
                    "aggregation unit of {} bytes exceeds packet",
                    size
                )));
            }
            self.push_nal(&rest[..size]);
            rest = &rest[size..];
        }
        Ok(())
    }

    fn fragment_unit(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 4 {
            return Err(Error::Depacketize("short H.265 FU".into()));
        }
        let fu_header = payload[2];
        if fu_header & FU_START != 0 {
            let mut nal = BytesMut::with_capacity(payload.len() * 4);
            nal.put_u8(with_type(payload[0], fu_header & FU_TYPE_MASK));
            nal.put_u8(payload[1]);
            self.fragment = Some(nal);
        }
        let Some(nal) = self.fragment.as_mut() else {
            trace!("H.265 FU continuation without start, dropped");
            return Ok(());
        };
        nal.put_slice(&payload[3..]);
        if fu_header & FU_END != 0 {
            if let Some(nal) = self.fragment.take() {
                self.push_nal(&nal);
            }
        }
        Ok(())
    }
}

impl Depacketizer for H265Depacketizer {
    fn depacketize(&mut self, packet: &RtpPacket) -> Result<Option<Bytes>> {
        let continuity = self.tracker.observe(packet);
        if continuity.gap && self.fragment.take().is_some() {
            debug!(seq = packet.header.sequence_number, "Packet loss inside H.265 FU, fragment dropped");
        }
        if continuity.new_timestamp && !self.frame.is_empty() {
            debug!("H.265 access unit ended without marker, discarded");
            self.frame.clear();
            self.fragment = None;
        }

        let payload = &packet.payload[..];
        if payload.len() < 3 {
            return Err(Error::Depacketize("short H.265 payload".into()));
        }
        match nal_type(payload[0]) {
            AGGREGATION => self.aggregate(payload)?,
            FRAGMENTATION => self.fragment_unit(payload)?,
            // PACI (50) and reserved types
            t if t > FRAGMENTATION => {
                return Err(Error::Depacketize(format!("unsupported H.265 packet type {}", t)))
            }
            _ => self.push_nal(payload),
        }

        if packet.header.marker {
            self.fragment = None;
            if !self.frame.is_empty() {
                return Ok(Some(self.frame.split().freeze()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::test_util::{packet, to_packets};

    /// IDR_W_RADL (19): header 0x26 0x01
    fn idr(len: usize) -> Vec<u8> {
        let mut nal = vec![0x26, 0x01];
        nal.extend((0..len).map(|i| (i % 200) as u8 + 1));
        nal
    }

    #[test]
    fn test_fu_header_layout() {
        let payloads = H265Packetizer::new(200).packetize(&idr(500)).unwrap();
        assert_eq!(payloads.len(), 3);
        assert_eq!(nal_type(payloads[0].data[0]), FRAGMENTATION);
        assert_eq!(payloads[0].data[1], 0x01);
        assert_eq!(payloads[0].data[2], FU_START | 19);
        assert_eq!(payloads[1].data[2], 19);
        assert_eq!(payloads[2].data[2], FU_END | 19);
        assert!(payloads[2].marker && !payloads[0].marker);
    }

    #[test]
    fn test_reassembly() {
        let mut au = vec![0, 0, 0, 1, 0x40, 0x01, 0x0C, 0x01];
        au.extend_from_slice(&[0, 0, 0, 1]);
        au.extend(idr(4000));
        let payloads = H265Packetizer::new(1200).packetize(&au).unwrap();

        let mut depacketizer = H265Depacketizer::new();
        let frames: Vec<Bytes> = to_packets(&payloads, 65530, 1)
            .iter()
            .filter_map(|p| depacketizer.depacketize(p).unwrap())
            .collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &au[..]);
    }

    #[test]
    fn test_aggregation_packet() {
        let ap = [
            with_type(0, AGGREGATION), 0x01,
            0, 3, 0x40, 0x01, 0xAA,
            0, 3, 0x42, 0x01, 0xBB,
        ];
        let frame = H265Depacketizer::new()
            .depacketize(&packet(1, 0, true, &ap))
            .unwrap()
            .unwrap();
        assert_eq!(
            &frame[..],
            &[0, 0, 0, 1, 0x40, 0x01, 0xAA, 0, 0, 0, 1, 0x42, 0x01, 0xBB]
        );
    }

    #[test]
    fn test_rejects_paci() {
        let paci = [with_type(0, 50), 0x01, 0x00];
        assert!(H265Depacketizer::new()
            .depacketize(&packet(1, 0, true, &paci))
            .is_err());
    }
}
