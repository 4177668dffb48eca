use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::Result;

pub mod channel;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;
#[cfg(feature = "udp")]
pub mod udp;

pub use channel::ChannelTransport;
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConfig, MqttTransport};
#[cfg(feature = "tcp")]
pub use tcp::TcpTransport;
#[cfg(feature = "tls")]
pub use tls::{TlsConfig, TlsTransport};
#[cfg(feature = "udp")]
pub use udp::UdpTransport;

/// Largest payload accepted by a datagram transport
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

// Default event channel capacity
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Represents the transport type/protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Mqtt,
    /// In-memory datagram pipe
    Channel,
}

impl TransportKind {
    /// Whether the transport guarantees delivery (no SIP retransmissions)
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls | TransportKind::Mqtt)
    }

    /// Whether inbound data arrives as a byte stream that needs framing
    pub fn is_stream(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }

    /// Token used in the Via header
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportKind::Udp | TransportKind::Channel => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Mqtt => "MQTT",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "UDP"),
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Tls => write!(f, "TLS"),
            TransportKind::Mqtt => write!(f, "MQTT"),
            TransportKind::Channel => write!(f, "CHANNEL"),
        }
    }
}

/// Connection state of a transport.
///
/// `Disconnected -> Connecting -> Connected -> (Disconnected | Error)`.
/// `Error` is terminal: the transport must be recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransportState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            3 => TransportState::Error,
            _ => TransportState::Disconnected,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportState::Disconnected => "Disconnected",
            TransportState::Connecting => "Connecting",
            TransportState::Connected => "Connected",
            TransportState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Events emitted by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes arrived. One datagram or publish per event; stream transports
    /// deliver whatever the socket read returned.
    Received {
        /// The raw payload
        data: Bytes,
        /// The remote address that sent it
        source: SocketAddr,
    },

    /// The transport changed state
    StateChanged(TransportState),
}

/// Represents a transport layer for SIP messages.
///
/// This trait defines the common interface for all transport types. A
/// transport carries bytes only; SIP framing happens above it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// The transport protocol
    fn kind(&self) -> TransportKind;

    /// Current connection state
    fn state(&self) -> TransportState;

    /// Open the transport. Datagram transports become `Connected`
    /// immediately; stream transports pass through `Connecting`.
    async fn connect(&mut self) -> Result<()>;

    /// Send to the connected peer. Returns the number of bytes queued.
    async fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Send to a specific destination. Connection-oriented transports ignore
    /// `destination` and use their single connection.
    async fn send_to(&mut self, data: &[u8], destination: SocketAddr) -> Result<usize> {
        let _ = destination;
        self.send(data).await
    }

    /// Wait up to `max_wait` for inbound data or state changes and return
    /// everything available
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<TransportEvent>>;

    /// The address bound after connect
    fn local_addr(&self) -> Result<SocketAddr>;

    /// The peer this transport talks to
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Graceful close; the transport ends in `Disconnected`
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether the transport guarantees delivery
    fn is_reliable(&self) -> bool {
        self.kind().is_reliable()
    }
}

/// State cell shared between a transport and its receive task
#[derive(Debug)]
pub(crate) struct SharedState {
    state: AtomicU8,
    events_tx: mpsc::Sender<TransportEvent>,
    kind: TransportKind,
}

impl SharedState {
    pub(crate) fn new(kind: TransportKind, events_tx: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            state: AtomicU8::new(TransportState::Disconnected as u8),
            events_tx,
            kind,
        }
    }

    pub(crate) fn get(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` and queue a `StateChanged` event. `Error` is sticky.
    pub(crate) fn set(&self, next: TransportState) {
        let prev = TransportState::from_u8(self.state.load(Ordering::Acquire));
        if prev == next || prev == TransportState::Error {
            return;
        }
        self.state.store(next as u8, Ordering::Release);
        debug!(transport = %self.kind, from = %prev, to = %next, "Transport state changed");
        let _ = self.events_tx.try_send(TransportEvent::StateChanged(next));
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<TransportEvent> {
        &self.events_tx
    }
}

/// Wait up to `max_wait` for the first event, then drain whatever else is
/// already queued
pub(crate) async fn drain_events(
    rx: &mut mpsc::Receiver<TransportEvent>,
    max_wait: Duration,
) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    match tokio::time::timeout(max_wait, rx.recv()).await {
        Ok(Some(event)) => events.push(event),
        Ok(None) | Err(_) => return events,
    }
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    trace!(count = events.len(), "Transport events drained");
    events
}
