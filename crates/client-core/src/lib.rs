//! SIP endpoint facade of the LWS stack
//!
//! This crate turns the lower layers into a user agent an application can
//! drive: [`Agent`] registers with a server, places and answers calls, runs
//! their media and exchanges MESSAGE requests. Progress is reported through
//! the [`AgentHandler`] and [`SessionHandler`] callbacks.
//!
//! # Layers
//!
//! ```text
//! lws-client-core   Agent, AgentConfig, callbacks        ◄── this crate
//! lws-dialog-core   transactions, dialogs, digest auth
//! lws-media-core    SDP offer/answer, RTP sessions, ICE
//! lws-sip-transport UDP / TCP / TLS / MQTT
//! lws-sip-core      messages, parser, builders
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use lws_client_core::prelude::*;
//!
//! # async fn example() -> lws_client_core::Result<()> {
//! let config = AgentConfig::from_toml_str(
//!     r#"
//!     server_host = "sip.example.com"
//!     username = "1001"
//!     password = "secret"
//!     "#,
//! )?;
//!
//! let mut agent = Agent::create(config, Arc::new(NoopHandler), Arc::new(NoopHandler)).await?;
//! agent.start().await?;
//! while agent.registration_state() == RegistrationState::Registering {
//!     agent.run_once(Duration::from_millis(100)).await?;
//! }
//!
//! let call = agent.call("1002", false).await?;
//! agent.run_once(Duration::from_secs(1)).await?;
//! agent.hangup(call).await?;
//! agent.stop().await?;
//! # Ok(())
//! # }
//! ```

mod agent;
mod error;

pub mod config;
pub mod events;
pub mod registration;

pub use agent::{Agent, IceFactory};
pub use config::{
    AgentConfig, IceConfig, MediaConfig, MqttConfig, TlsConfig, TransportConfig, TransportProtocol,
};
pub use error::{Error, Result};
pub use events::{
    AgentHandler, CallAction, CallDirection, CallHandle, CallState, CallStatusInfo,
    IncomingCallInfo, NoopHandler, RegistrationState, SessionHandler,
};
pub use registration::{refresh_delay, Registration, RegistrationOutcome};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        Agent, AgentConfig, AgentHandler, CallAction, CallHandle, CallState, CallStatusInfo,
        Error, IncomingCallInfo, NoopHandler, RegistrationState, Result, SessionHandler,
    };
}
