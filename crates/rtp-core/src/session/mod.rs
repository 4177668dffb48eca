//! Sans-IO RTP session: one local source, any number of remote ones
//!
//! The session numbers outgoing packets, keeps reception statistics per
//! remote SSRC and produces compound RTCP. Sockets live with the owner.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::packet::rtcp::{
    NtpTimestamp, RtcpGoodbye, RtcpPacket, RtcpReceiverReport, RtcpReportBlock,
    RtcpSenderReport, RtcpSourceDescription,
};
use crate::packet::{RtpHeader, RtpPacket};
use crate::stats::{ReceptionStats, RtpSessionStats, SenderStats, SequenceOutcome};
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

pub mod scheduling;

pub use scheduling::{RtcpScheduler, RTCP_MIN_INTERVAL};

/// A report carries at most 31 blocks
const MAX_REPORT_BLOCKS: usize = 31;

/// Parameters of one RTP stream
#[derive(Debug, Clone)]
pub struct RtpSessionConfig {
    /// Fixed SSRC; random when `None`
    pub ssrc: Option<RtpSsrc>,
    /// Media clock in Hz
    pub clock_rate: u32,
    /// Canonical name sent in SDES
    pub cname: String,
    /// Session bandwidth in bits per second, for the RTCP interval
    pub session_bandwidth: u32,
}

impl RtpSessionConfig {
    pub fn new(clock_rate: u32, cname: impl Into<String>) -> Self {
        Self {
            ssrc: None,
            clock_rate,
            cname: cname.into(),
            session_bandwidth: 64_000,
        }
    }

    pub fn with_ssrc(mut self, ssrc: RtpSsrc) -> Self {
        self.ssrc = Some(ssrc);
        self
    }

    pub fn with_session_bandwidth(mut self, bits_per_second: u32) -> Self {
        self.session_bandwidth = bits_per_second;
        self
    }
}

/// State of one RTP session
#[derive(Debug)]
pub struct RtpSession {
    config: RtpSessionConfig,
    ssrc: RtpSsrc,
    next_seq: RtpSequenceNumber,
    timestamp_base: RtpTimestamp,
    /// Reference point for arrival times and SR timestamps
    epoch: Instant,
    sender: SenderStats,
    packets_sent: u64,
    octets_sent: u64,
    /// A packet went out since the last report
    sent_since_report: bool,
    sources: HashMap<RtpSsrc, ReceptionStats>,
    scheduler: RtcpScheduler,
    rtcp_sent: u64,
    rtcp_received: u64,
    rng: SmallRng,
}

impl RtpSession {
    pub fn new(config: RtpSessionConfig, now: Instant) -> Self {
        let mut rng = SmallRng::from_entropy();
        let ssrc = config.ssrc.unwrap_or_else(|| rng.gen());
        let next_seq = rng.gen();
        let timestamp_base = rng.gen();
        debug!(ssrc, clock_rate = config.clock_rate, "RTP session created");
        Self {
            scheduler: RtcpScheduler::new(config.session_bandwidth),
            config,
            ssrc,
            next_seq,
            timestamp_base,
            epoch: now,
            sender: SenderStats::default(),
            packets_sent: 0,
            octets_sent: 0,
            sent_since_report: false,
            sources: HashMap::new(),
            rtcp_sent: 0,
            rtcp_received: 0,
            rng,
        }
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    pub fn clock_rate(&self) -> u32 {
        self.config.clock_rate
    }

    pub fn cname(&self) -> &str {
        &self.config.cname
    }

    /// Elapsed time since the session started, in clock units
    fn media_time(&self, now: Instant) -> RtpTimestamp {
        let elapsed = now.saturating_duration_since(self.epoch).as_secs_f64();
        (elapsed * f64::from(self.config.clock_rate)) as u64 as RtpTimestamp
    }

    /// Next outgoing packet. `media_timestamp` counts clock units from the
    /// start of the stream; the random base is added here.
    pub fn next_packet(
        &mut self,
        payload_type: u8,
        media_timestamp: RtpTimestamp,
        marker: bool,
        payload: Bytes,
    ) -> RtpPacket {
        let timestamp = self.timestamp_base.wrapping_add(media_timestamp);
        let mut header = RtpHeader::new(payload_type, self.next_seq, timestamp, self.ssrc);
        header.marker = marker;
        self.next_seq = self.next_seq.wrapping_add(1);

        self.sender.on_packet(payload.len(), timestamp);
        self.packets_sent += 1;
        self.octets_sent += payload.len() as u64;
        self.sent_since_report = true;
        RtpPacket::new(header, payload)
    }

    /// Account for a received packet. Our own SSRC coming back is ignored.
    pub fn on_rtp(&mut self, packet: &RtpPacket, now: Instant) -> Option<SequenceOutcome> {
        let ssrc = packet.header.ssrc;
        if ssrc == self.ssrc {
            trace!(ssrc, "Ignoring looped RTP packet");
            return None;
        }
        let arrival = self.media_time(now);
        let stats = self.sources.entry(ssrc).or_insert_with(|| {
            debug!(ssrc, "New remote RTP source");
            ReceptionStats::new(ssrc, packet.header.sequence_number)
        });
        Some(stats.on_packet(&packet.header, packet.payload.len(), arrival))
    }

    /// Process a compound RTCP datagram. SRs feed the LSR/DLSR fields,
    /// BYE forgets the source.
    pub fn on_rtcp(&mut self, data: &[u8], now: Instant) -> Result<Vec<RtcpPacket>> {
        let packets = RtcpPacket::parse_compound(data)?;
        self.rtcp_received += 1;
        self.scheduler.on_rtcp_packet(data.len());
        for packet in &packets {
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    if let Some(stats) = self.sources.get_mut(&sr.ssrc) {
                        stats.on_sender_report(sr.ntp_timestamp, now);
                    }
                }
                RtcpPacket::Goodbye(bye) => {
                    for ssrc in &bye.sources {
                        if self.sources.remove(ssrc).is_some() {
                            debug!(ssrc, reason = ?bye.reason, "Remote RTP source left");
                        }
                    }
                }
                RtcpPacket::ReceiverReport(_) | RtcpPacket::SourceDescription(_) => {}
            }
        }
        self.update_members();
        Ok(packets)
    }

    fn update_members(&mut self) {
        let members = self.sources.len() as u32 + 1;
        let senders = self.sources.len() as u32 + u32::from(self.sent_since_report);
        self.scheduler.set_members(members, senders);
    }

    fn report_blocks(&mut self, now: Instant) -> Vec<RtcpReportBlock> {
        self.sources
            .values_mut()
            .take(MAX_REPORT_BLOCKS)
            .map(|stats| stats.report_block(now))
            .collect()
    }

    /// SR when we sent since the last report, otherwise RR
    fn report(&mut self, now: Instant) -> RtcpPacket {
        let report_blocks = self.report_blocks(now);
        if self.sent_since_report {
            RtcpPacket::SenderReport(RtcpSenderReport {
                ssrc: self.ssrc,
                ntp_timestamp: NtpTimestamp::now(),
                rtp_timestamp: self.timestamp_base.wrapping_add(self.media_time(now)),
                sender_packet_count: self.sender.packets,
                sender_octet_count: self.sender.octets,
                report_blocks,
            })
        } else {
            RtcpPacket::ReceiverReport(RtcpReceiverReport {
                ssrc: self.ssrc,
                report_blocks,
            })
        }
    }

    fn finish_compound(&mut self, packets: &[RtcpPacket]) -> Result<Bytes> {
        let data = RtcpPacket::serialize_compound(packets)?;
        self.scheduler.on_rtcp_packet(data.len());
        self.rtcp_sent += 1;
        self.sent_since_report = false;
        Ok(data)
    }

    /// Compound report: SR or RR followed by SDES CNAME
    pub fn build_report(&mut self, now: Instant) -> Result<Bytes> {
        let packets = [
            self.report(now),
            RtcpPacket::SourceDescription(RtcpSourceDescription::with_cname(
                self.ssrc,
                self.config.cname.clone(),
            )),
        ];
        self.finish_compound(&packets)
    }

    /// Final compound report ending in BYE
    pub fn build_bye(&mut self, now: Instant, reason: Option<&str>) -> Result<Bytes> {
        let bye = match reason {
            Some(reason) => RtcpGoodbye::new_with_reason(self.ssrc, reason),
            None => RtcpGoodbye::new_for_source(self.ssrc),
        };
        let packets = [
            self.report(now),
            RtcpPacket::SourceDescription(RtcpSourceDescription::with_cname(
                self.ssrc,
                self.config.cname.clone(),
            )),
            RtcpPacket::Goodbye(bye),
        ];
        debug!(ssrc = self.ssrc, "Sending RTCP BYE");
        self.finish_compound(&packets)
    }

    /// Delay until the next report is due
    pub fn next_report_interval(&mut self) -> Duration {
        self.update_members();
        let we_sent = self.sent_since_report;
        self.scheduler.next_interval(we_sent, &mut self.rng)
    }

    pub fn remote_sources(&self) -> impl Iterator<Item = &ReceptionStats> {
        self.sources.values()
    }

    pub fn stats(&self) -> RtpSessionStats {
        let mut stats = RtpSessionStats {
            packets_sent: self.packets_sent,
            octets_sent: self.octets_sent,
            rtcp_sent: self.rtcp_sent,
            rtcp_received: self.rtcp_received,
            ..Default::default()
        };
        for source in self.sources.values() {
            stats.packets_received += source.received();
            stats.octets_received += source.octets();
            stats.packets_lost += source.cumulative_lost();
            stats.jitter = stats.jitter.max(source.jitter());
        }
        stats
    }
}
