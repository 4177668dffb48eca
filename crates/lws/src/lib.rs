//! # lws - a lightweight SIP endpoint stack
//!
//! `lws` bundles the crates of the stack under one name. Most applications
//! only need the [`prelude`]: it brings in [`Agent`](client_core::Agent),
//! its configuration and the callback traits.
//!
//! ## Components
//!
//! - **Infra Common**: error codes, logging setup, timer wheel
//! - **SIP Core**: messages, parser, builders, SDP, digest auth
//! - **SIP Transport**: UDP, TCP, TLS and MQTT carriers
//! - **Dialog Core**: transactions, dialogs and the SIP engine
//! - **RTP Core**: RTP/RTCP packets, sessions and jitter buffering
//! - **Media Core**: codecs, SDP offer/answer, media sessions, ICE
//! - **Client Core**: the agent tying it all together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use lws::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let config = AgentConfig::new()
//!     .with_server("sip.example.com", None)
//!     .with_credentials("1001", "secret");
//! let mut agent = Agent::create(config, Arc::new(NoopHandler), Arc::new(NoopHandler)).await?;
//! agent.start().await?;
//! loop {
//!     agent.run_once(Duration::from_millis(100)).await?;
//! }
//! # }
//! ```
//!
//! ## Module Structure
//!
//! - [`infra_common`]: error codes and logging
//! - [`sip_core`]: SIP messages and SDP
//! - [`sip_transport`]: SIP transports
//! - [`dialog_core`]: transactions and dialogs
//! - [`rtp_core`]: RTP and RTCP
//! - [`media_core`]: media sessions
//! - [`client_core`]: the agent API

#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

pub use lws_client_core as client_core;
pub use lws_dialog_core as dialog_core;
pub use lws_infra_common as infra_common;
pub use lws_media_core as media_core;
pub use lws_rtp_core as rtp_core;
pub use lws_sip_core as sip_core;
pub use lws_sip_transport as sip_transport;

pub mod prelude {
    //! Common imports for lws applications

    pub use crate::client_core::prelude::*;
    pub use crate::client_core::{
        CallDirection, IceConfig, MediaConfig, TlsConfig, TransportConfig, TransportProtocol,
    };
    pub use crate::infra_common::{setup_logging, ErrorCode, LoggingConfig};
    pub use crate::media_core::{CodecId, MediaEvent, MediaInfo};
}

/// Version of the stack
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// One-line description of the stack
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
