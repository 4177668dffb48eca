//! Shared timer wheel
//!
//! One [`TimerWheel`] fires every protocol timer of an agent: SIP transaction
//! retransmissions and timeouts (RFC 3261 timers A–K), the user timers the
//! agent arms through the SIP engine (registration refresh, no-answer) and
//! the media session's ICE gathering and connectivity-check deadlines.
//!
//! # Design
//!
//! Pending timers live in a single ordered map keyed by absolute expiry, so the
//! next timers to fire are always at the front. A worker task wakes every
//! [`TICK`] (10 ms), removes every entry whose expiry is at or before "now",
//! releases the lock and only then runs the callbacks. A callback may therefore
//! arm or stop other timers on the same wheel without deadlocking.
//!
//! Handles are plain identifiers. Stopping a handle whose timer already fired
//! (or was already stopped) reports [`Error::TimerNotFound`] and has no other
//! effect.
//!
//! The wheel measures time with `tokio::time::Instant`, so tests running on a
//! paused runtime (`#[tokio::test(start_paused = true)]`) drive it with
//! virtual time.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use lws_infra_common::timer::TimerWheel;
//!
//! # async fn example() {
//! let wheel = TimerWheel::init();
//! let handle = wheel.start(Duration::from_millis(500), || {
//!     tracing::info!("Timer A fired");
//! }).unwrap();
//! assert!(wheel.stop(handle).is_ok());
//! wheel.shutdown().await;
//! # }
//! ```

mod wheel;

pub use wheel::{TimerCallback, TimerHandle, TimerWheel, TICK};

#[cfg(test)]
mod tests;
