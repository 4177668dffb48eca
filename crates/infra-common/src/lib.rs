//! # Infra-Common - shared infrastructure for the LWS stack
//!
//! This crate holds the pieces every other LWS crate leans on:
//!
//! - [`errors`]: the 32-bit status-code taxonomy returned by public operations
//!   (`0` on success, high nibble `0x8` plus module tag and local code otherwise)
//! - [`logging`]: `tracing-subscriber` setup used by applications and tests
//! - [`timer`]: the timer wheel that fires every protocol timer for SIP
//!   transactions and ICE checks
//!
//! ```text
//! ┌──────────────┐   arms/stops    ┌──────────────┐
//! │ SIP engine   │────────────────▶│              │
//! └──────────────┘                 │  TimerWheel  │── 10 ms tick ──▶ callbacks
//! ┌──────────────┐   arms/stops    │              │
//! │ ICE / media  │────────────────▶│              │
//! └──────────────┘                 └──────────────┘
//! ```

pub mod errors;
pub mod logging;
pub mod timer;

pub use errors::{Error, ErrorCode, Module, Result, LWS_OK};
pub use logging::{setup_logging, LoggingConfig};
pub use timer::{TimerHandle, TimerWheel, TICK};
