use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    drain_events, SharedState, Transport, TransportEvent, TransportKind, TransportState,
    DEFAULT_CHANNEL_CAPACITY, MAX_DATAGRAM_SIZE,
};
use crate::error::{Error, Result};

const RECV_BUFFER_SIZE: usize = 65_535;

/// UDP transport for SIP messages.
///
/// The socket is not connected at the OS level so that requests from peers
/// other than the server (direct calls) are still received. The server
/// address is cached and used by [`Transport::send`].
pub struct UdpTransport {
    bind_addr: SocketAddr,
    remote: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    shared: Arc<SharedState>,
    events_rx: mpsc::Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Create a transport that binds `bind_addr` on connect and sends to `remote`
    pub fn new(bind_addr: SocketAddr, remote: SocketAddr) -> Self {
        let (events_tx, events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            bind_addr,
            remote,
            socket: None,
            shared: Arc::new(SharedState::new(TransportKind::Udp, events_tx)),
            events_rx,
            reader: None,
        }
    }

    fn spawn_receive_loop(&mut self, socket: Arc<UdpSocket>) {
        let shared = self.shared.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, source)) => {
                        trace!("Received {} bytes from {}", len, source);
                        let event = TransportEvent::Received {
                            data: Bytes::copy_from_slice(&buffer[..len]),
                            source,
                        };
                        if shared.sender().send(event).await.is_err() {
                            break;
                        }
                    }
                    // ICMP errors surface here on some platforms; a datagram
                    // transport keeps running
                    Err(e) => warn!("Error receiving UDP packet: {}", e),
                }
            }
            debug!("UDP receive loop terminated");
        }));
    }

    async fn send_datagram(&self, data: &[u8], destination: SocketAddr) -> Result<usize> {
        if self.shared.get() != TransportState::Connected {
            return Err(Error::NotConnected);
        }
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::MessageTooLarge(data.len()));
        }
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        let sent = socket
            .send_to(data, destination)
            .await
            .map_err(|e| Error::SendFailed(destination, e))?;
        trace!("Sent {} bytes to {}", sent, destination);
        Ok(sent)
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn state(&self) -> TransportState {
        self.shared.get()
    }

    async fn connect(&mut self) -> Result<()> {
        match self.shared.get() {
            TransportState::Connected => return Ok(()),
            TransportState::Error => {
                return Err(Error::InvalidState("transport is in error state".into()))
            }
            _ => {}
        }

        let socket = match UdpSocket::bind(self.bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.shared.set(TransportState::Error);
                return Err(Error::BindFailed(self.bind_addr, e));
            }
        };
        let local = socket.local_addr().map_err(Error::LocalAddrFailed)?;
        info!("SIP UDP transport bound to {}, peer {}", local, self.remote);

        self.socket = Some(socket.clone());
        self.spawn_receive_loop(socket);
        self.shared.set(TransportState::Connected);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.send_datagram(data, self.remote).await
    }

    async fn send_to(&mut self, data: &[u8], destination: SocketAddr) -> Result<usize> {
        self.send_datagram(data, destination).await
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<TransportEvent>> {
        Ok(drain_events(&mut self.events_rx, max_wait).await)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.socket.as_ref().ok_or(Error::NotConnected)?;
        socket.local_addr().map_err(Error::LocalAddrFailed)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.socket = None;
        self.shared.set(TransportState::Disconnected);
        debug!("UDP transport to {} disconnected", self.remote);
        Ok(())
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_addr() {
            Ok(addr) => write!(f, "UdpTransport({} -> {})", addr, self.remote),
            Err(_) => write!(f, "UdpTransport(<unbound> -> {})", self.remote),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let mut transport = UdpTransport::new(loopback(), "127.0.0.1:5060".parse().unwrap());
        assert_eq!(transport.state(), TransportState::Disconnected);
        let err = transport.send(b"OPTIONS").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(transport.local_addr().is_err());
    }

    #[tokio::test]
    async fn test_datagram_exchange() {
        let peer = UdpSocket::bind(loopback()).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let mut transport = UdpTransport::new(loopback(), peer_addr);
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        let local = transport.local_addr().unwrap();

        assert_eq!(transport.send(b"ping").await.unwrap(), 4);
        let mut buf = [0u8; 16];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, local);

        peer.send_to(b"first", local).await.unwrap();
        peer.send_to(b"second", local).await.unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            for event in transport.poll(Duration::from_secs(1)).await.unwrap() {
                if let TransportEvent::Received { data, source } = event {
                    assert_eq!(source, peer_addr);
                    received.push(data);
                }
            }
        }
        assert_eq!(received, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);

        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let mut transport = UdpTransport::new(loopback(), "127.0.0.1:9".parse().unwrap());
        transport.connect().await.unwrap();
        let payload = vec![b'x'; MAX_DATAGRAM_SIZE + 1];
        let err = transport.send(&payload).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge(_)));
        assert_eq!(transport.state(), TransportState::Connected);
    }
}
