//! SIP transport layer for the LWS stack
//!
//! A [`Transport`] moves raw bytes between the agent and one SIP peer. It
//! never parses SIP: datagram transports (UDP, MQTT, the in-memory channel)
//! deliver one message per event, stream transports (TCP, TLS) deliver
//! whatever the socket produced and leave framing to
//! `lws_sip_core::StreamFramer`.
//!
//! Every transport follows the same state machine:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──▶ Connected ──disconnect──▶ Disconnected
//!                               │              │
//!                               └────failure───┴──────▶ Error (terminal)
//! ```
//!
//! Sending while not connected fails immediately with
//! [`Error::NotConnected`].

pub mod error;
pub mod transport;

pub use error::{Error, Result};
pub use transport::{
    ChannelTransport, Transport, TransportEvent, TransportKind, TransportState,
    MAX_DATAGRAM_SIZE,
};
#[cfg(feature = "mqtt")]
pub use transport::{MqttConfig, MqttTransport};
#[cfg(feature = "tcp")]
pub use transport::TcpTransport;
#[cfg(feature = "tls")]
pub use transport::{TlsConfig, TlsTransport};
#[cfg(feature = "udp")]
pub use transport::UdpTransport;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        ChannelTransport, Error, Result, Transport, TransportEvent, TransportKind, TransportState,
    };
    #[cfg(feature = "mqtt")]
    pub use crate::{MqttConfig, MqttTransport};
    #[cfg(feature = "tcp")]
    pub use crate::TcpTransport;
    #[cfg(feature = "tls")]
    pub use crate::{TlsConfig, TlsTransport};
    #[cfg(feature = "udp")]
    pub use crate::UdpTransport;
}
