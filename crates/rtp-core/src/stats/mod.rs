//! Per-source statistics
//!
//! [`ReceptionStats`] follows the sequence tracking of RFC 3550 A.1, the
//! loss computation of A.3 and the jitter estimator of A.8. It produces the
//! report block we send about that source.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::packet::rtcp::{to_dlsr_units, NtpTimestamp, RtcpReportBlock};
use crate::packet::RtpHeader;
use crate::{RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Jumps up to this far ahead are treated as loss
const MAX_DROPOUT: u16 = 3000;
/// Packets up to this far behind are treated as reordering
const MAX_MISORDER: u16 = 100;
const SEQ_MOD: u32 = 1 << 16;

/// What became of a received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Counted in the statistics
    Accepted,
    /// Arrived late or duplicated; still counted
    Reordered,
    /// Too far from the expected sequence; held until the next one confirms it
    Probation,
    /// Two consecutive large jumps: the source restarted its sequence
    Restarted,
}

/// Reception statistics for one remote source
#[derive(Debug, Clone)]
pub struct ReceptionStats {
    ssrc: RtpSsrc,
    max_seq: RtpSequenceNumber,
    /// Shifted count of sequence wraps
    cycles: u32,
    base_seq: u32,
    bad_seq: u32,
    received: u64,
    octets: u64,
    expected_prior: u64,
    received_prior: u64,
    /// Relative transit time of the previous packet
    transit: Option<i64>,
    /// Interarrival jitter in timestamp units
    jitter: f64,
    /// Middle bits of the last SR and when it arrived
    last_sr: Option<(u32, Instant)>,
}

impl ReceptionStats {
    pub fn new(ssrc: RtpSsrc, first_seq: RtpSequenceNumber) -> Self {
        let mut stats = Self {
            ssrc,
            max_seq: 0,
            cycles: 0,
            base_seq: 0,
            bad_seq: SEQ_MOD + 1,
            received: 0,
            octets: 0,
            expected_prior: 0,
            received_prior: 0,
            transit: None,
            jitter: 0.0,
            last_sr: None,
        };
        stats.init_seq(first_seq);
        stats
    }

    fn init_seq(&mut self, seq: RtpSequenceNumber) {
        self.base_seq = u32::from(seq);
        self.max_seq = seq;
        self.bad_seq = SEQ_MOD + 1;
        self.cycles = 0;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    /// Account for a packet. `arrival` is the arrival time expressed in the
    /// same clock as the RTP timestamp.
    pub fn on_packet(
        &mut self,
        header: &RtpHeader,
        payload_len: usize,
        arrival: RtpTimestamp,
    ) -> SequenceOutcome {
        let seq = header.sequence_number;
        let udelta = seq.wrapping_sub(self.max_seq);

        let outcome = if self.received == 0 && u32::from(seq) == self.base_seq {
            SequenceOutcome::Accepted
        } else if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles += SEQ_MOD;
            }
            self.max_seq = seq;
            SequenceOutcome::Accepted
        } else if udelta <= u16::MAX - MAX_MISORDER {
            if u32::from(seq) == self.bad_seq {
                debug!(ssrc = self.ssrc, seq, "RTP sequence restarted");
                self.init_seq(seq);
                self.transit = None;
                SequenceOutcome::Restarted
            } else {
                trace!(ssrc = self.ssrc, seq, max = self.max_seq, "RTP sequence jump");
                self.bad_seq = (u32::from(seq) + 1) & (SEQ_MOD - 1);
                return SequenceOutcome::Probation;
            }
        } else {
            SequenceOutcome::Reordered
        };

        self.received += 1;
        self.octets += payload_len as u64;
        self.update_jitter(header.timestamp, arrival);
        outcome
    }

    fn update_jitter(&mut self, timestamp: RtpTimestamp, arrival: RtpTimestamp) {
        let transit = i64::from(arrival.wrapping_sub(timestamp) as i32);
        if let Some(previous) = self.transit {
            let d = (transit - previous).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit = Some(transit);
    }

    /// Remember an SR from this source for the LSR/DLSR fields
    pub fn on_sender_report(&mut self, ntp: NtpTimestamp, arrived: Instant) {
        self.last_sr = Some((ntp.to_u32(), arrived));
    }

    /// Highest sequence number seen, extended with the wrap count
    pub fn extended_max_seq(&self) -> u32 {
        self.cycles + u32::from(self.max_seq)
    }

    pub fn expected(&self) -> u64 {
        u64::from(self.extended_max_seq()) + 1 - u64::from(self.base_seq)
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn octets(&self) -> u64 {
        self.octets
    }

    /// Expected minus received; negative when duplicates arrived
    pub fn cumulative_lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }

    /// Current jitter estimate in timestamp units
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    /// Report block for the next RR/SR. Resets the interval counters
    /// behind `fraction_lost`.
    pub fn report_block(&mut self, now: Instant) -> RtcpReportBlock {
        let expected = self.expected();
        let expected_interval = expected - self.expected_prior;
        self.expected_prior = expected;
        let received_interval = self.received - self.received_prior;
        self.received_prior = self.received;

        let lost_interval = expected_interval as i64 - received_interval as i64;
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval as i64).min(255) as u8
        };

        let (last_sr, delay_since_last_sr) = match self.last_sr {
            Some((lsr, at)) => (lsr, to_dlsr_units(now.saturating_duration_since(at))),
            None => (0, 0),
        };

        RtcpReportBlock {
            ssrc: self.ssrc,
            fraction_lost,
            cumulative_lost: self.cumulative_lost().clamp(-0x80_0000, 0x7F_FFFF) as i32,
            highest_seq: self.extended_max_seq(),
            jitter: self.jitter(),
            last_sr,
            delay_since_last_sr,
        }
    }
}

/// Counters for what we send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderStats {
    pub packets: u32,
    pub octets: u32,
    /// Timestamp of the last packet sent
    pub last_timestamp: RtpTimestamp,
}

impl SenderStats {
    pub fn on_packet(&mut self, payload_len: usize, timestamp: RtpTimestamp) {
        // Both counters wrap, as the SR fields do
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add(payload_len as u32);
        self.last_timestamp = timestamp;
    }
}

/// Snapshot of one RTP session's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtpSessionStats {
    pub packets_sent: u64,
    pub octets_sent: u64,
    pub packets_received: u64,
    pub octets_received: u64,
    /// Packets lost across all remote sources
    pub packets_lost: i64,
    /// Largest jitter among remote sources, in timestamp units
    pub jitter: u32,
    pub rtcp_sent: u64,
    pub rtcp_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn header(seq: u16, ts: u32) -> RtpHeader {
        RtpHeader::new(0, seq, ts, 0x1234)
    }

    #[test]
    fn test_in_order_no_loss() {
        let mut stats = ReceptionStats::new(0x1234, 100);
        for i in 0..10u16 {
            let ts = u32::from(i) * 160;
            assert_eq!(
                stats.on_packet(&header(100 + i, ts), 160, ts),
                SequenceOutcome::Accepted
            );
        }
        assert_eq!(stats.expected(), 10);
        assert_eq!(stats.received(), 10);
        assert_eq!(stats.octets(), 1600);
        assert_eq!(stats.cumulative_lost(), 0);
        assert_eq!(stats.jitter(), 0);
    }

    #[test]
    fn test_wraparound_extends_sequence() {
        let mut stats = ReceptionStats::new(1, 65534);
        stats.on_packet(&header(65534, 0), 10, 0);
        stats.on_packet(&header(65535, 160), 10, 160);
        stats.on_packet(&header(0, 320), 10, 320);
        stats.on_packet(&header(1, 480), 10, 480);
        assert_eq!(stats.extended_max_seq(), 65536 + 1);
        assert_eq!(stats.expected(), 4);
        assert_eq!(stats.cumulative_lost(), 0);
    }

    #[test]
    fn test_loss_and_fraction() {
        let now = Instant::now();
        let mut stats = ReceptionStats::new(1, 0);
        // 0..8 with 2 and 5 missing
        for seq in [0u16, 1, 3, 4, 6, 7] {
            stats.on_packet(&header(seq, u32::from(seq) * 160), 160, u32::from(seq) * 160);
        }
        assert_eq!(stats.expected(), 8);
        assert_eq!(stats.cumulative_lost(), 2);

        let block = stats.report_block(now);
        assert_eq!(block.cumulative_lost, 2);
        assert_eq!(block.highest_seq, 7);
        // 2 of 8 lost = 64/256
        assert_eq!(block.fraction_lost, 64);

        // Next interval loses nothing
        stats.on_packet(&header(8, 1280), 160, 1280);
        let block = stats.report_block(now);
        assert_eq!(block.fraction_lost, 0);
        assert_eq!(block.cumulative_lost, 2);
    }

    #[test]
    fn test_duplicates_make_loss_negative() {
        let mut stats = ReceptionStats::new(1, 10);
        stats.on_packet(&header(10, 0), 1, 0);
        stats.on_packet(&header(11, 0), 1, 0);
        assert_eq!(stats.on_packet(&header(11, 0), 1, 0), SequenceOutcome::Accepted);
        assert_eq!(stats.on_packet(&header(10, 0), 1, 0), SequenceOutcome::Reordered);
        assert_eq!(stats.cumulative_lost(), -2);
        assert_eq!(stats.report_block(Instant::now()).fraction_lost, 0);
    }

    #[test]
    fn test_jitter_follows_a8() {
        let mut stats = ReceptionStats::new(1, 0);
        // 160 samples per packet, every other packet 32 units late
        stats.on_packet(&header(0, 0), 1, 1000);
        stats.on_packet(&header(1, 160), 1, 1160 + 32);
        // |D| = 32 -> J = 2
        assert_eq!(stats.jitter(), 2);
        stats.on_packet(&header(2, 320), 1, 1320);
        // |D| = 32 -> J = 2 + 30/16 = 3.875
        assert_eq!(stats.jitter(), 3);
    }

    #[test]
    fn test_large_jump_needs_confirmation() {
        let mut stats = ReceptionStats::new(1, 100);
        stats.on_packet(&header(100, 0), 1, 0);
        assert_eq!(
            stats.on_packet(&header(20_000, 0), 1, 0),
            SequenceOutcome::Probation
        );
        assert_eq!(stats.received(), 1);
        assert_eq!(
            stats.on_packet(&header(20_001, 0), 1, 0),
            SequenceOutcome::Restarted
        );
        assert_eq!(stats.received(), 1);
        assert_eq!(stats.expected(), 1);
    }

    #[test]
    fn test_last_sr_and_delay() {
        let start = Instant::now();
        let mut stats = ReceptionStats::new(1, 0);
        stats.on_packet(&header(0, 0), 1, 0);
        let ntp = NtpTimestamp {
            seconds: 0x0001_0002,
            fraction: 0x8000_0000,
        };
        stats.on_sender_report(ntp, start);
        let block = stats.report_block(start + Duration::from_secs(2));
        assert_eq!(block.last_sr, 0x0002_8000);
        assert_eq!(block.delay_since_last_sr, 2 * 65536);
    }

    #[test]
    fn test_sender_counters_wrap() {
        let mut stats = SenderStats {
            packets: u32::MAX,
            octets: u32::MAX - 1,
            last_timestamp: 0,
        };
        stats.on_packet(4, 160);
        assert_eq!(stats.packets, 0);
        assert_eq!(stats.octets, 2);
        assert_eq!(stats.last_timestamp, 160);
    }
}
