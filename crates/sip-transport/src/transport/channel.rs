use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use super::{
    drain_events, SharedState, Transport, TransportEvent, TransportKind, TransportState,
    DEFAULT_CHANNEL_CAPACITY, MAX_DATAGRAM_SIZE,
};
use crate::error::{Error, Result};

/// In-memory datagram transport.
///
/// [`ChannelTransport::pair`] returns two connected ends; whatever one end
/// sends arrives as a single `Received` event on the other. It behaves like
/// UDP (unreliable, so SIP retransmission timers run) without touching the
/// network, which makes it the stub peer of choice in tests.
pub struct ChannelTransport {
    local: SocketAddr,
    peer: SocketAddr,
    peer_tx: mpsc::Sender<TransportEvent>,
    shared: Arc<SharedState>,
    events_rx: mpsc::Receiver<TransportEvent>,
}

impl ChannelTransport {
    /// Create two ends addressed as `a` and `b`
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        let end_a = Self {
            local: a,
            peer: b,
            peer_tx: b_tx.clone(),
            shared: Arc::new(SharedState::new(TransportKind::Channel, a_tx.clone())),
            events_rx: a_rx,
        };
        let end_b = Self {
            local: b,
            peer: a,
            peer_tx: a_tx,
            shared: Arc::new(SharedState::new(TransportKind::Channel, b_tx)),
            events_rx: b_rx,
        };
        (end_a, end_b)
    }

    /// Address of the other end
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn state(&self) -> TransportState {
        self.shared.get()
    }

    async fn connect(&mut self) -> Result<()> {
        if self.shared.get() == TransportState::Error {
            return Err(Error::InvalidState("transport is in error state".into()));
        }
        self.shared.set(TransportState::Connected);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        if self.shared.get() != TransportState::Connected {
            return Err(Error::NotConnected);
        }
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::MessageTooLarge(data.len()));
        }
        let event = TransportEvent::Received {
            data: Bytes::copy_from_slice(data),
            source: self.local,
        };
        match self.peer_tx.try_send(event) {
            Ok(()) => {
                trace!("Sent {} bytes to {}", data.len(), self.peer);
                Ok(data.len())
            }
            Err(TrySendError::Full(_)) => {
                // Datagram semantics: a full queue drops the packet
                warn!("Channel to {} full, datagram dropped", self.peer);
                Ok(data.len())
            }
            Err(TrySendError::Closed(_)) => Err(Error::SendFailed(
                self.peer,
                io::Error::new(io::ErrorKind::NotConnected, "peer end dropped"),
            )),
        }
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<TransportEvent>> {
        Ok(drain_events(&mut self.events_rx, max_wait).await)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.shared.set(TransportState::Disconnected);
        Ok(())
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelTransport({} <-> {})", self.local, self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("10.0.0.1:5060".parse().unwrap(), "10.0.0.2:5060".parse().unwrap())
    }

    fn payloads(events: Vec<TransportEvent>) -> Vec<(Bytes, SocketAddr)> {
        events
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Received { data, source } => Some((data, source)),
                TransportEvent::StateChanged(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pair_preserves_datagram_boundaries() {
        let (a_addr, b_addr) = addrs();
        let (mut a, mut b) = ChannelTransport::pair(a_addr, b_addr);
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        a.send(b"one").await.unwrap();
        a.send(b"two").await.unwrap();

        let received = payloads(b.poll(Duration::from_millis(10)).await.unwrap());
        assert_eq!(
            received,
            vec![
                (Bytes::from_static(b"one"), a_addr),
                (Bytes::from_static(b"two"), a_addr),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_on_disconnected_fails_immediately() {
        let (a_addr, b_addr) = addrs();
        let (mut a, _b) = ChannelTransport::pair(a_addr, b_addr);
        assert!(matches!(a.send(b"x").await, Err(Error::NotConnected)));

        a.connect().await.unwrap();
        a.disconnect().await.unwrap();
        assert_eq!(a.state(), TransportState::Disconnected);
        assert!(matches!(a.send(b"x").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_state_changes_are_polled() {
        let (a_addr, b_addr) = addrs();
        let (mut a, _b) = ChannelTransport::pair(a_addr, b_addr);
        a.connect().await.unwrap();
        let events = a.poll(Duration::ZERO).await.unwrap();
        assert_eq!(events, vec![TransportEvent::StateChanged(TransportState::Connected)]);
    }

    #[tokio::test]
    async fn test_dropped_peer_reports_send_failure() {
        let (a_addr, b_addr) = addrs();
        let (mut a, b) = ChannelTransport::pair(a_addr, b_addr);
        a.connect().await.unwrap();
        drop(b);
        let err = a.send(b"x").await.unwrap_err();
        assert_eq!(err.code(), lws_infra_common::errors::LWS_ERR_SOCKET_SEND);
    }
}
