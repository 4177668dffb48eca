//! H.264 payload format (RFC 6184, non-interleaved mode)
//!
//! Sending uses single NAL unit packets and FU-A fragments. Receiving also
//! accepts STAP-A aggregates. Frames cross the API as Annex-B byte streams.

use bytes::{BufMut, Bytes, BytesMut};
use lws_rtp_core::RtpPacket;
use tracing::{debug, trace};

use super::{split_annex_b, Depacketizer, FrameTracker, Packetizer, RtpPayload, START_CODE};
use crate::error::{Error, Result};

const NAL_TYPE_MASK: u8 = 0x1F;
const STAP_A: u8 = 24;
const FU_A: u8 = 28;

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

pub struct H264Packetizer {
    max_payload: usize,
}

impl H264Packetizer {
    pub fn new(max_payload: usize) -> Self {
        // FU indicator and header plus at least one byte
        Self {
            max_payload: max_payload.max(3),
        }
    }

    fn fragment(&self, nal: &[u8], out: &mut Vec<RtpPayload>) {
        let indicator = (nal[0] & 0xE0) | FU_A;
        let nal_type = nal[0] & NAL_TYPE_MASK;
        let chunks: Vec<&[u8]> = nal[1..].chunks(self.max_payload - 2).collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut header = nal_type;
            if i == 0 {
                header |= FU_START;
            }
            if i == last {
                header |= FU_END;
            }
            let mut data = BytesMut::with_capacity(chunk.len() + 2);
            data.put_u8(indicator);
            data.put_u8(header);
            data.put_slice(chunk);
            out.push(RtpPayload::new(data.freeze(), false));
        }
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, frame: &[u8]) -> Result<Vec<RtpPayload>> {
        let units = split_annex_b(frame);
        if units.is_empty() {
            return Err(Error::Packetize("no NAL unit in H.264 frame".into()));
        }

        let mut payloads = Vec::new();
        for nal in units {
            if nal.len() <= self.max_payload {
                payloads.push(RtpPayload::new(Bytes::copy_from_slice(nal), false));
            } else {
                self.fragment(nal, &mut payloads);
            }
        }
        // Marker on the last packet of the access unit
        if let Some(last) = payloads.last_mut() {
            last.marker = true;
        }
        Ok(payloads)
    }
}

/// Reassembles access units into Annex-B
#[derive(Default)]
pub struct H264Depacketizer {
    tracker: FrameTracker,
    frame: BytesMut,
    /// NAL unit being rebuilt from FU-A fragments
    fragment: Option<BytesMut>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_nal(&mut self, nal: &[u8]) {
        self.frame.put_slice(&START_CODE);
        self.frame.put_slice(nal);
    }

    fn aggregate(&mut self, payload: &[u8]) -> Result<()> {
        let mut rest = &payload[1..];
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(Error::Depacketize("truncated STAP-A size".into()));
            }
            let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if size == 0 || size > rest.len() {
                return Err(Error::Depacketize(format!(
                    "STAP-A unit of {} bytes exceeds packet",
                    size
                )));
            }
            self.push_nal(&rest[..size]);
            rest = &rest[size..];
        }
        Ok(())
    }

    fn fragment_unit(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 3 {
            return Err(Error::Depacketize("short FU-A".into()));
        }
        let (indicator, header) = (payload[0], payload[1]);
        if header & FU_START != 0 {
            let mut nal = BytesMut::with_capacity(payload.len() * 4);
            nal.put_u8((indicator & 0xE0) | (header & NAL_TYPE_MASK));
            self.fragment = Some(nal);
        }
        match self.fragment.as_mut() {
            Some(nal) => nal.put_slice(&payload[2..]),
            None => {
                trace!("FU-A continuation without start, dropped");
                return Ok(());
            }
        }
        if header & FU_END != 0 {
            if let Some(nal) = self.fragment.take() {
                self.push_nal(&nal);
            }
        }
        Ok(())
    }
}

impl Depacketizer for H264Depacketizer {
    fn depacketize(&mut self, packet: &RtpPacket) -> Result<Option<Bytes>> {
        let continuity = self.tracker.observe(packet);
        if continuity.gap && self.fragment.take().is_some() {
            debug!(seq = packet.header.sequence_number, "Packet loss inside FU-A, fragment dropped");
        }
        if continuity.new_timestamp && !self.frame.is_empty() {
            debug!("Access unit ended without marker, discarded");
            self.frame.clear();
            self.fragment = None;
        }

        let payload = &packet.payload[..];
        if payload.is_empty() {
            return Err(Error::Depacketize("empty H.264 payload".into()));
        }
        match payload[0] & NAL_TYPE_MASK {
            1..=23 => self.push_nal(payload),
            STAP_A => self.aggregate(payload)?,
            FU_A => self.fragment_unit(payload)?,
            other => {
                return Err(Error::Depacketize(format!(
                    "unsupported H.264 packet type {}",
                    other
                )))
            }
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
