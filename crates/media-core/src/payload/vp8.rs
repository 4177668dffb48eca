//! VP8 payload format (RFC 7741)
//!
//! ```text
//!       0 1 2 3 4 5 6 7
//!      +-+-+-+-+-+-+-+-+
//!      |X|R|N|S|R| PID | (REQUIRED)
//!      +-+-+-+-+-+-+-+-+
//! X:   |I|L|T|K| RSV   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! I:   |M| PictureID   | (OPTIONAL, M selects 15 bits)
//!      +-+-+-+-+-+-+-+-+
//! L:   |   TL0PICIDX   | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! T/K: |TID|Y| KEYIDX  | (OPTIONAL)
//!      +-+-+-+-+-+-+-+-+
//! ```
//!
//! Outgoing packets carry a 15-bit picture ID that increments per frame.

use bytes::{BufMut, Bytes, BytesMut};
use lws_rtp_core::RtpPacket;
use tracing::debug;

use super::{Depacketizer, FrameTracker, Packetizer, RtpPayload};
use crate::error::{Error, Result};

const X_BIT: u8 = 0x80;
const N_BIT: u8 = 0x20;
const S_BIT: u8 = 0x10;
const PID_MASK: u8 = 0x07;

const I_BIT: u8 = 0x80;
const L_BIT: u8 = 0x40;
const T_BIT: u8 = 0x20;
const K_BIT: u8 = 0x10;
const M_BIT: u8 = 0x80;

/// Required byte, extension byte and two picture ID bytes
const DESCRIPTOR_LEN: usize = 4;

/// Parsed payload descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vp8Descriptor {
    pub non_reference: bool,
    pub start_of_partition: bool,
    pub partition_id: u8,
    pub picture_id: Option<u16>,
    pub tl0_pic_idx: Option<u8>,
    /// Size of the descriptor in bytes
    pub len: usize,
}

impl Vp8Descriptor {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let truncated = || Error::Depacketize("truncated VP8 payload descriptor".into());
        let first = *payload.first().ok_or_else(truncated)?;
        let mut descriptor = Vp8Descriptor {
            non_reference: first & N_BIT != 0,
            start_of_partition: first & S_BIT != 0,
            partition_id: first & PID_MASK,
            ..Default::default()
        };
        let mut pos = 1;
        if first & X_BIT != 0 {
            let ext = *payload.get(pos).ok_or_else(truncated)?;
            pos += 1;
            if ext & I_BIT != 0 {
                let b = *payload.get(pos).ok_or_else(truncated)?;
                if b & M_BIT != 0 {
                    let low = *payload.get(pos + 1).ok_or_else(truncated)?;
                    descriptor.picture_id = Some((u16::from(b & 0x7F) << 8) | u16::from(low));
                    pos += 2;
                } else {
                    descriptor.picture_id = Some(u16::from(b));
                    pos += 1;
                }
            }
            if ext & L_BIT != 0 {
                descriptor.tl0_pic_idx = Some(*payload.get(pos).ok_or_else(truncated)?);
                pos += 1;
            }
            if ext & (T_BIT | K_BIT) != 0 {
                payload.get(pos).ok_or_else(truncated)?;
                pos += 1;
            }
        }
        descriptor.len = pos;
        Ok(descriptor)
    }

    /// First packet of a frame
    pub fn starts_frame(&self) -> bool {
        self.start_of_partition && self.partition_id == 0
    }
}

pub struct Vp8Packetizer {
    max_payload: usize,
    picture_id: u16,
}

impl Vp8Packetizer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.max(DESCRIPTOR_LEN + 1),
            picture_id: rand::random::<u16>() & 0x7FFF,
        }
    }
}

impl Packetizer for Vp8Packetizer {
    fn packetize(&mut self, frame: &[u8]) -> Result<Vec<RtpPayload>> {
        if frame.is_empty() {
            return Err(Error::Packetize("empty VP8 frame".into()));
        }
        let picture_id = self.picture_id;
        self.picture_id = (self.picture_id + 1) & 0x7FFF;

        let chunks: Vec<&[u8]> = frame.chunks(self.max_payload - DESCRIPTOR_LEN).collect();
        let last = chunks.len() - 1;
        let payloads = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut data = BytesMut::with_capacity(DESCRIPTOR_LEN + chunk.len());
                data.put_u8(if i == 0 { X_BIT | S_BIT } else { X_BIT });
                data.put_u8(I_BIT);
                data.put_u16(u16::from(M_BIT) << 8 | picture_id);
                data.put_slice(chunk);
                RtpPayload::new(data.freeze(), i == last)
            })
            .collect();
        Ok(payloads)
    }
}

#[derive(Default)]
pub struct Vp8Depacketizer {
    tracker: FrameTracker,
    frame: BytesMut,
    /// Start of the current frame was seen and nothing was lost since
    in_frame: bool,
}

impl Vp8Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Depacketizer for Vp8Depacketizer {
    fn depacketize(&mut self, packet: &RtpPacket) -> Result<Option<Bytes>> {
        let continuity = self.tracker.observe(packet);
        let descriptor = Vp8Descriptor::parse(&packet.payload)?;

        if descriptor.starts_frame() {
            if self.in_frame && !self.frame.is_empty() {
                debug!("VP8 frame ended without marker, discarded");
            }
            self.frame.clear();
            self.in_frame = true;
        } else if continuity.gap || continuity.new_timestamp {
            if self.in_frame {
                debug!(seq = packet.header.sequence_number, "VP8 frame incomplete, dropped");
            }
            self.frame.clear();
            self.in_frame = false;
        }

        if self.in_frame {
            self.frame.put_slice(&packet.payload[descriptor.len..]);
        }

        if packet.header.marker {
            let complete = self.in_frame && !self.frame.is_empty();
            self.in_frame = false;
            if complete {
                return Ok(Some(self.frame.split().freeze()));
            }
            self.frame.clear();
        }
        Ok(None)
    }
}
