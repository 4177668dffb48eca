//! RTCP transmission interval, RFC 3550 §6.3 and A.7

use std::time::Duration;

use rand::Rng;

/// Minimum interval between reports
pub const RTCP_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Share of the session bandwidth given to RTCP
pub const RTCP_BANDWIDTH_FRACTION: f64 = 0.05;

/// e - 3/2, compensates for the timer reconsideration bias (RFC 3550 §6.3.1)
const COMPENSATION: f64 = std::f64::consts::E - 1.5;

/// Senders get a quarter of the RTCP bandwidth when they are a minority
const SENDER_BANDWIDTH_FRACTION: f64 = 0.25;
const RECEIVER_BANDWIDTH_FRACTION: f64 = 1.0 - SENDER_BANDWIDTH_FRACTION;

/// Inputs of the interval computation
#[derive(Debug, Clone)]
pub struct RtcpScheduler {
    /// RTCP bandwidth in octets per second
    rtcp_bandwidth: f64,
    /// Running average of compound RTCP packet size, UDP/IP headers included
    avg_rtcp_size: f64,
    members: u32,
    senders: u32,
    /// No report has been sent yet
    initial: bool,
}

impl RtcpScheduler {
    /// IPv4 plus UDP
    const LOWER_LAYER_OVERHEAD: usize = 28;

    /// `session_bandwidth` in bits per second
    pub fn new(session_bandwidth: u32) -> Self {
        let octets_per_second = f64::from(session_bandwidth) / 8.0;
        Self {
            rtcp_bandwidth: octets_per_second * RTCP_BANDWIDTH_FRACTION,
            avg_rtcp_size: 128.0,
            members: 2,
            senders: 0,
            initial: true,
        }
    }

    /// Current view of the session: `members` includes us
    pub fn set_members(&mut self, members: u32, senders: u32) {
        self.members = members.max(1);
        self.senders = senders.min(self.members);
    }

    /// Fold a sent or received compound packet into the average size
    pub fn on_rtcp_packet(&mut self, size: usize) {
        let size = (size + Self::LOWER_LAYER_OVERHEAD) as f64;
        self.avg_rtcp_size = size / 16.0 + self.avg_rtcp_size * 15.0 / 16.0;
    }

    /// Deterministic interval Td
    pub fn deterministic_interval(&self, we_sent: bool) -> Duration {
        let minimum = if self.initial {
            RTCP_MIN_INTERVAL.as_secs_f64() / 2.0
        } else {
            RTCP_MIN_INTERVAL.as_secs_f64()
        };

        let mut n = f64::from(self.members);
        let mut bandwidth = self.rtcp_bandwidth;
        if f64::from(self.senders) <= f64::from(self.members) * SENDER_BANDWIDTH_FRACTION {
            if we_sent {
                bandwidth *= SENDER_BANDWIDTH_FRACTION;
                n = f64::from(self.senders.max(1));
            } else {
                bandwidth *= RECEIVER_BANDWIDTH_FRACTION;
                n = f64::from((self.members - self.senders).max(1));
            }
        }

        let interval = if bandwidth > 0.0 {
            (self.avg_rtcp_size * n / bandwidth).max(minimum)
        } else {
            minimum
        };
        Duration::from_secs_f64(interval)
    }

    /// Randomized interval until the next report: Td scaled by a factor in
    /// [0.5, 1.5], divided by the reconsideration compensation. Marks the
    /// initial report as done.
    pub fn next_interval<R: Rng>(&mut self, we_sent: bool, rng: &mut R) -> Duration {
        let td = self.deterministic_interval(we_sent);
        self.initial = false;
        td.mul_f64(rng.gen_range(0.5..=1.5) / COMPENSATION)
    }

    pub fn is_initial(&self) -> bool {
        self.initial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_minimum_applies_at_voice_rates() {
        let scheduler = RtcpScheduler::new(64_000);
        assert_eq!(
            scheduler.deterministic_interval(false),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_five_seconds_after_first_report() {
        let mut scheduler = RtcpScheduler::new(64_000);
        let mut rng = SmallRng::seed_from_u64(7);
        scheduler.next_interval(true, &mut rng);
        assert!(!scheduler.is_initial());
        assert_eq!(
            scheduler.deterministic_interval(true),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_randomized_bounds() {
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..200 {
            let mut scheduler = RtcpScheduler::new(64_000);
            scheduler.next_interval(false, &mut rng);
            let t = scheduler.next_interval(false, &mut rng).as_secs_f64();
            assert!(t >= 5.0 * 0.5 / COMPENSATION - 1e-9, "{}", t);
            assert!(t <= 5.0 * 1.5 / COMPENSATION + 1e-9, "{}", t);
        }
    }

    #[test]
    fn test_large_session_exceeds_minimum() {
        let mut scheduler = RtcpScheduler::new(64_000);
        scheduler.set_members(200, 100);
        // 128 * 200 / 400 = 64 s
        assert_eq!(
            scheduler.deterministic_interval(false),
            Duration::from_secs(64)
        );
    }

    #[test]
    fn test_average_size_moves_toward_samples() {
        let mut scheduler = RtcpScheduler::new(64_000);
        for _ in 0..100 {
            scheduler.on_rtcp_packet(372);
        }
        assert!((scheduler.avg_rtcp_size - 400.0).abs() < 1.0);
    }
}
