//! RTP payload formats
//!
//! A [`Packetizer`] turns one application frame into the payloads of one or
//! more RTP packets; a [`Depacketizer`] reassembles complete frames from
//! received packets. Both are stateful per stream.

use bytes::Bytes;
use lws_rtp_core::RtpPacket;

use crate::codec::CodecId;
use crate::error::Result;

pub mod audio;
pub mod h264;
pub mod h265;
pub mod vp8;
pub mod vp9;

pub use audio::{G711Depacketizer, G711Packetizer, PassthroughDepacketizer, PassthroughPacketizer};
pub use h264::{H264Depacketizer, H264Packetizer};
pub use h265::{H265Depacketizer, H265Packetizer};
pub use vp8::{Vp8Depacketizer, Vp8Packetizer};
pub use vp9::{Vp9Depacketizer, Vp9Packetizer};

/// Payload budget per packet: 1500 MTU minus IP, UDP, RTP and some headroom
pub const DEFAULT_MAX_PAYLOAD: usize = 1200;

/// Payload of one outgoing RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPayload {
    pub data: Bytes,
    /// Marker bit; set on the last packet of a video frame
    pub marker: bool,
}

impl RtpPayload {
    pub fn new(data: impl Into<Bytes>, marker: bool) -> Self {
        Self {
            data: data.into(),
            marker,
        }
    }
}

/// Splits frames into RTP payloads
pub trait Packetizer: Send {
    /// Payloads for one frame, in sending order
    fn packetize(&mut self, frame: &[u8]) -> Result<Vec<RtpPayload>>;
}

/// Reassembles frames from RTP packets
pub trait Depacketizer: Send {
    /// Feed one packet; returns a frame once it is complete
    fn depacketize(&mut self, packet: &RtpPacket) -> Result<Option<Bytes>>;
}

/// Packetizer for `codec` with payloads of at most `max_payload` bytes
pub fn packetizer_for(codec: CodecId, max_payload: usize) -> Box<dyn Packetizer> {
    match codec {
        CodecId::Pcmu => Box::new(G711Packetizer::ulaw()),
        CodecId::Pcma => Box::new(G711Packetizer::alaw()),
        CodecId::G722 | CodecId::Opus => Box::new(PassthroughPacketizer::new()),
        CodecId::H264 => Box::new(H264Packetizer::new(max_payload)),
        CodecId::H265 => Box::new(H265Packetizer::new(max_payload)),
        CodecId::Vp8 => Box::new(Vp8Packetizer::new(max_payload)),
        CodecId::Vp9 => Box::new(Vp9Packetizer::new(max_payload)),
    }
}

pub fn depacketizer_for(codec: CodecId) -> Box<dyn Depacketizer> {
    match codec {
        CodecId::Pcmu => Box::new(G711Depacketizer::ulaw()),
        CodecId::Pcma => Box::new(G711Depacketizer::alaw()),
        CodecId::G722 | CodecId::Opus => Box::new(PassthroughDepacketizer),
        CodecId::H264 => Box::new(H264Depacketizer::new()),
        CodecId::H265 => Box::new(H265Depacketizer::new()),
        CodecId::Vp8 => Box::new(Vp8Depacketizer::new()),
        CodecId::Vp9 => Box::new(Vp9Depacketizer::new()),
    }
}

/// Tracks sequence continuity and the timestamp of the frame being
/// reassembled. Shared by the video depacketizers.
#[derive(Debug, Default)]
pub(crate) struct FrameTracker {
    last_seq: Option<u16>,
    timestamp: Option<u32>,
}

/// What changed since the previous packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Continuity {
    /// At least one packet is missing
    pub gap: bool,
    /// The packet belongs to a different frame than the previous one
    pub new_timestamp: bool,
}

impl FrameTracker {
    pub(crate) fn observe(&mut self, packet: &RtpPacket) -> Continuity {
        let seq = packet.header.sequence_number;
        let ts = packet.header.timestamp;
        let gap = matches!(self.last_seq, Some(last) if last.wrapping_add(1) != seq);
        let new_timestamp = matches!(self.timestamp, Some(current) if current != ts);
        self.last_seq = Some(seq);
        self.timestamp = Some(ts);
        Continuity { gap, new_timestamp }
    }
}

/// Split an Annex-B byte stream on `00 00 01` / `00 00 00 01` start codes.
/// Input without any start code is a single NAL unit.
pub(crate) fn split_annex_b(stream: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= stream.len() {
        if stream[i] == 0 && stream[i + 1] == 0 && stream[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    if starts.is_empty() {
        return if stream.is_empty() { Vec::new() } else { vec![stream] };
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &(_, begin)) in starts.iter().enumerate() {
        let mut end = starts.get(n + 1).map(|&(code, _)| code).unwrap_or(stream.len());
        // The zero of a four-byte start code belongs to the next code
        while end > begin && stream[end - 1] == 0 {
            end -= 1;
        }
        if end > begin {
            units.push(&stream[begin..end]);
        }
    }
    units
}

/// Four-byte Annex-B start code used for reassembled frames
pub(crate) const START_CODE: [u8; 4] = [0, 0, 0, 1];
