//! VP9 payload format (RFC 9628)
//!
//! ```text
//!       0 1 2 3 4 5 6 7
//!      +-+-+-+-+-+-+-+-+
//!      |I|P|L|F|B|E|V|Z| (REQUIRED)
//!      +-+-+-+-+-+-+-+-+
//! I:   |M| PICTURE ID  | (RECOMMENDED, M selects 15 bits)
//!      +-+-+-+-+-+-+-+-+
//! L:   |  TID  |U| SID |D| (+ TL0PICIDX when F = 0)
//!      +-+-+-+-+-+-+-+-+
//! P,F: | P_DIFF      |N| (up to 3 times)
//!      +-+-+-+-+-+-+-+-+
//! V:   | SS            |
//!      +-+-+-+-+-+-+-+-+
//! ```
//!
//! Outgoing packets use non-flexible mode without layer indices; B and E
//! delimit the frame. Incoming descriptors in either mode are skipped
//! correctly, scalability structure included.

use bytes::{BufMut, Bytes, BytesMut};
use lws_rtp_core::RtpPacket;
use tracing::debug;

use super::{Depacketizer, FrameTracker, Packetizer, RtpPayload};
use crate::error::{Error, Result};

const I_BIT: u8 = 0x80;
const P_BIT: u8 = 0x40;
const L_BIT: u8 = 0x20;
const F_BIT: u8 = 0x10;
const B_BIT: u8 = 0x08;
const E_BIT: u8 = 0x04;
const V_BIT: u8 = 0x02;

const M_BIT: u8 = 0x80;
const N_BIT: u8 = 0x01;
const MAX_P_DIFF: usize = 3;

/// Flags byte plus two picture ID bytes
const DESCRIPTOR_LEN: usize = 3;

/// Parsed payload descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vp9Descriptor {
    pub inter_picture: bool,
    pub begins_frame: bool,
    pub ends_frame: bool,
    pub picture_id: Option<u16>,
    /// Size of the descriptor in bytes
    pub len: usize,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::Depacketize("truncated VP9 payload descriptor".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            return Err(Error::Depacketize("truncated VP9 scalability structure".into()));
        }
        self.pos += n;
        Ok(())
    }
}

impl Vp9Descriptor {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data: payload, pos: 0 };
        let flags = cursor.byte()?;
        let mut descriptor = Vp9Descriptor {
            inter_picture: flags & P_BIT != 0,
            begins_frame: flags & B_BIT != 0,
            ends_frame: flags & E_BIT != 0,
            ..Default::default()
        };
        let flexible = flags & F_BIT != 0;

        if flags & I_BIT != 0 {
            let b = cursor.byte()?;
            descriptor.picture_id = Some(if b & M_BIT != 0 {
                (u16::from(b & 0x7F) << 8) | u16::from(cursor.byte()?)
            } else {
                u16::from(b)
            });
        }
        if flags & L_BIT != 0 {
            cursor.byte()?;
            if !flexible {
                // TL0PICIDX
                cursor.byte()?;
            }
        }
        if flexible && descriptor.inter_picture {
            for _ in 0..MAX_P_DIFF {
                if cursor.byte()? & N_BIT == 0 {
                    break;
                }
            }
        }
        if flags & V_BIT != 0 {
            Self::skip_scalability_structure(&mut cursor)?;
        }
        descriptor.len = cursor.pos;
        Ok(descriptor)
    }

    /// `N_S|Y|G|-|-|-` then optional resolutions and picture group
    fn skip_scalability_structure(cursor: &mut Cursor<'_>) -> Result<()> {
        let header = cursor.byte()?;
        let spatial_layers = usize::from(header >> 5) + 1;
        if header & 0x10 != 0 {
            // Width and height per layer
            cursor.skip(spatial_layers * 4)?;
        }
        if header & 0x08 != 0 {
            let pictures = cursor.byte()?;
            for _ in 0..pictures {
                let picture = cursor.byte()?;
                let references = usize::from((picture >> 2) & 0x03);
                cursor.skip(references)?;
            }
        }
        Ok(())
    }
}

/// Key frames have frame_type 0 in the uncompressed header
fn is_key_frame(frame: &[u8]) -> bool {
    let Some(&b) = frame.first() else {
        return false;
    };
    let bit = |i: u32| (b >> (7 - i)) & 1;
    // frame_marker (2), profile_low_bit, profile_high_bit
    let profile = bit(2) | (bit(3) << 1);
    let mut i = 4;
    if profile == 3 {
        i += 1;
    }
    if i > 6 {
        return false;
    }
    let show_existing_frame = bit(i);
    show_existing_frame == 0 && bit(i + 1) == 0
}

pub struct Vp9Packetizer {
    max_payload: usize,
    picture_id: u16,
}

impl Vp9Packetizer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.max(DESCRIPTOR_LEN + 1),
            picture_id: rand::random::<u16>() & 0x7FFF,
        }
    }
}

impl Packetizer for Vp9Packetizer {
    fn packetize(&mut self, frame: &[u8]) -> Result<Vec<RtpPayload>> {
        if frame.is_empty() {
            return Err(Error::Packetize("empty VP9 frame".into()));
        }
        let picture_id = self.picture_id;
        self.picture_id = (self.picture_id + 1) & 0x7FFF;
        let inter = if is_key_frame(frame) { 0 } else { P_BIT };

        let chunks: Vec<&[u8]> = frame.chunks(self.max_payload - DESCRIPTOR_LEN).collect();
        let last = chunks.len() - 1;
        let payloads = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut flags = I_BIT | inter;
                if i == 0 {
                    flags |= B_BIT;
                }
                if i == last {
                    flags |= E_BIT;
                }
                let mut data = BytesMut::with_capacity(DESCRIPTOR_LEN + chunk.len());
                data.put_u8(flags);
                data.put_u16(u16::from(M_BIT) << 8 | picture_id);
                data.put_slice(chunk);
                RtpPayload::new(data.freeze(), i == last)
            })
            .collect();
        Ok(payloads)
    }
}

#[derive(Default)]
pub struct Vp9Depacketizer {
    tracker: FrameTracker,
    frame: BytesMut,
    in_frame: bool,
}

impl Vp9Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Depacketizer for Vp9Depacketizer {
    fn depacketize(&mut self, packet: &RtpPacket) -> Result<Option<Bytes>> {
        let continuity = self.tracker.observe(packet);
        let descriptor = Vp9Descriptor::parse(&packet.payload)?;

        if descriptor.begins_frame {
            self.frame.clear();
            self.in_frame = true;
        } else if continuity.gap || continuity.new_timestamp {
            if self.in_frame {
                debug!(seq = packet.header.sequence_number, "VP9 frame incomplete, dropped");
            }
            self.frame.clear();
            self.in_frame = false;
        }

        if self.in_frame {
            self.frame.put_slice(&packet.payload[descriptor.len..]);
            if descriptor.ends_frame {
                self.in_frame = false;
                return Ok(Some(self.frame.split().freeze()));
            }
        }
        if packet.header.marker {
            self.in_frame = false;
            self.frame.clear();
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::test_util::{packet, to_packets};

    #[test]
    fn test_key_frame_detection() {
        // frame_marker 10, profile 0, show_existing 0, frame_type 0
        assert!(is_key_frame(&[0x80, 0x49]));
        // frame_type 1
        assert!(!is_key_frame(&[0x84]));
        // show_existing_frame
        assert!(!is_key_frame(&[0x88]));
        assert!(!is_key_frame(&[]));
    }

    #[test]
    fn test_begin_end_bits() {
        let mut frame = vec![0x80];
        frame.extend_from_slice(&[0x11; 400]);
        let payloads = Vp9Packetizer::new(203).packetize(&frame).unwrap();
        assert_eq!(payloads.len(), 3);
        let first = Vp9Descriptor::parse(&payloads[0].data).unwrap();
        assert!(first.begins_frame && !first.ends_frame && !first.inter_picture);
        let last = Vp9Descriptor::parse(&payloads[2].data).unwrap();
        assert!(!last.begins_frame && last.ends_frame);
        assert_eq!(first.picture_id, last.picture_id);
        assert!(payloads[2].marker);
    }

    #[test]
    fn test_flexible_mode_with_references() {
        // I P L F B E, 7-bit picture id, layer byte, two P_DIFFs
        let payload = [0xFC, 0x05, 0x00, 0x03, 0x02, 0xAB];
        let d = Vp9Descriptor::parse(&payload).unwrap();
        assert_eq!(d.picture_id, Some(5));
        assert_eq!(d.len, 5);
    }

    #[test]
    fn test_scalability_structure_skipped() {
        // B E V; SS: one layer with resolution, one picture with one reference
        let payload = [
            0x0E, 0x18, 0x01, 0x40, 0x00, 0xF0, 0x01, 0x04, 0x01, 0xEE,
        ];
        let d = Vp9Descriptor::parse(&payload).unwrap();
        assert_eq!(d.len, 9);
        assert!(Vp9Descriptor::parse(&payload[..6]).is_err());
    }

    #[test]
    fn test_round_trip_and_loss() {
        let frame: Vec<u8> = (0..3000).map(|i| (i % 256) as u8).collect();
        let payloads = Vp9Packetizer::new(1000).packetize(&frame).unwrap();
        let mut depacketizer = Vp9Depacketizer::new();
        let out: Vec<Bytes> = to_packets(&payloads, 9, 0)
            .iter()
            .filter_map(|p| depacketizer.depacketize(p).unwrap())
            .collect();
        assert_eq!(out, vec![Bytes::from(frame.clone())]);

        let mut packets = to_packets(&payloads, 100, 3000);
        packets.remove(1);
        for p in &packets {
            assert!(depacketizer.depacketize(p).unwrap().is_none());
        }
        let single = depacketizer
            .depacketize(&packet(200, 6000, true, &[B_BIT | E_BIT, 1, 2]))
            .unwrap();
        assert_eq!(single.as_deref(), Some(&[1, 2][..]));
    }
}
