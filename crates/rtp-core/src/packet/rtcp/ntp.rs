use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the UNIX epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64-bit NTP timestamp as carried in sender reports (RFC 3550 §4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    /// Seconds since January 1, 1900
    pub seconds: u32,

    /// Fraction of a second in units of 2^-32 s
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Wallclock time now
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_unix(since_epoch)
    }

    /// Convert from a duration since the UNIX epoch
    pub fn from_unix(duration: Duration) -> Self {
        let seconds = duration.as_secs() + NTP_UNIX_OFFSET;
        let fraction = (u64::from(duration.subsec_nanos()) << 32) / 1_000_000_000;
        Self {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }

    pub fn to_u64(&self) -> u64 {
        (u64::from(self.seconds) << 32) | u64::from(self.fraction)
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            fraction: value as u32,
        }
    }

    /// Middle 32 bits, the form used for LSR in report blocks (RFC 3550 §6.4.1)
    pub fn to_u32(&self) -> u32 {
        ((self.seconds & 0x0000_FFFF) << 16) | (self.fraction >> 16)
    }
}

/// Express a duration in units of 1/65536 s, as DLSR requires
pub fn to_dlsr_units(duration: Duration) -> u32 {
    let units = duration.as_secs_f64() * 65536.0;
    units.min(f64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_timestamp_now() {
        // After Jan 1, 2020
        assert!(NtpTimestamp::now().seconds > 3_786_825_600);
    }

    #[test]
    fn test_from_unix() {
        let ts = NtpTimestamp::from_unix(Duration::new(1_577_836_800, 500_000_000));
        assert_eq!(ts.seconds, 3_786_825_600);
        assert_eq!(ts.fraction, 0x8000_0000);
        assert_eq!(NtpTimestamp::from_u64(ts.to_u64()), ts);
    }

    #[test]
    fn test_middle_bits() {
        let ts = NtpTimestamp {
            seconds: 0x1234_5678,
            fraction: 0x9ABC_DEF0,
        };
        assert_eq!(ts.to_u32(), 0x5678_9ABC);
    }

    #[test]
    fn test_dlsr_units() {
        assert_eq!(to_dlsr_units(Duration::from_secs(1)), 65536);
        assert_eq!(to_dlsr_units(Duration::from_millis(500)), 32768);
    }
}
