//! RFC 3261 transaction timers
//!
//! ## Client Transaction Timers
//! - **Timer A** (INVITE): request retransmission, unreliable transports only
//! - **Timer B** (INVITE): transaction timeout
//! - **Timer D** (INVITE): wait time for response retransmissions
//! - **Timer E** (non-INVITE): request retransmission, unreliable transports only
//! - **Timer F** (non-INVITE): transaction timeout
//! - **Timer K** (non-INVITE): wait time for response retransmissions
//!
//! ## Server Transaction Timers
//! - **Timer G** (INVITE): final response retransmission
//! - **Timer H** (INVITE): wait time for ACK
//! - **Timer I** (INVITE): wait time in Confirmed
//! - **Timer J** (non-INVITE): wait time for request retransmissions
//!
//! The core also retransmits a 2xx to INVITE until the ACK arrives
//! ([`TimerType::OkRetransmit`]) and gives up after 64·T1
//! ([`TimerType::OkTimeout`]). Timers the transaction user arms on the
//! engine carry [`TimerType::User`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timer durations. Defaults follow RFC 3261 §17 and Appendix A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    /// RTT estimate, 500 ms
    pub t1: Duration,
    /// Maximum retransmit interval for non-INVITE requests and INVITE
    /// responses, 4 s
    pub t2: Duration,
    /// Maximum duration a message remains in the network, 5 s
    pub t4: Duration,
    /// Wait for response retransmissions after a non-2xx final (Timer D),
    /// at least 32 s on unreliable transports
    pub timer_d: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            timer_d: Duration::from_secs(32),
        }
    }
}

impl TimerSettings {
    /// 64·T1: Timers B, F, H, J and the 2xx give-up
    pub fn transaction_timeout(&self) -> Duration {
        self.t1 * 64
    }

    /// Next retransmission interval: doubled, capped at T2
    pub fn backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.t2)
    }
}

/// Named protocol timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerType {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    /// 2xx-to-INVITE retransmission at the UAS core
    OkRetransmit,
    /// 2xx-to-INVITE never acknowledged
    OkTimeout,
    User,
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerType::A => "A",
            TimerType::B => "B",
            TimerType::D => "D",
            TimerType::E => "E",
            TimerType::F => "F",
            TimerType::G => "G",
            TimerType::H => "H",
            TimerType::I => "I",
            TimerType::J => "J",
            TimerType::K => "K",
            TimerType::OkRetransmit => "2xx-retransmit",
            TimerType::OkTimeout => "2xx-timeout",
            TimerType::User => "user",
        };
        f.write_str(name)
    }
}
