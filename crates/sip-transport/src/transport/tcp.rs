use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::{
    drain_events, SharedState, Transport, TransportEvent, TransportKind, TransportState,
    DEFAULT_CHANNEL_CAPACITY,
};
use crate::error::{Error, Result};

// Buffer sizes
const READ_CHUNK_SIZE: usize = 8192;

/// Upper bound on connection establishment
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Boxed write half shared by the TCP and TLS transports
pub(crate) type StreamWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Open a TCP connection from `bind_addr` to `remote`
pub(crate) async fn open_stream(bind_addr: SocketAddr, remote: SocketAddr) -> Result<TcpStream> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(Error::CreateFailed)?;
    socket.set_reuseaddr(true).map_err(Error::CreateFailed)?;
    socket
        .bind(bind_addr)
        .map_err(|e| Error::BindFailed(bind_addr, e))?;

    match tokio::time::timeout(CONNECT_TIMEOUT, socket.connect(remote)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectFailed(remote, e)),
        Err(_) => Err(Error::ConnectFailed(
            remote,
            io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        )),
    }
}

/// Forward raw stream bytes as `Received` events until EOF or error.
///
/// No SIP framing happens here; a read may carry half a message or several.
pub(crate) fn spawn_stream_reader<R>(
    mut reader: R,
    remote: SocketAddr,
    shared: Arc<SharedState>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
        loop {
            buffer.reserve(READ_CHUNK_SIZE);
            match reader.read_buf(&mut buffer).await {
                Ok(0) => {
                    debug!("Connection closed by {}", remote);
                    shared.set(TransportState::Disconnected);
                    break;
                }
                Ok(n) => {
                    trace!("Received {} bytes from {}", n, remote);
                    let event = TransportEvent::Received {
                        data: buffer.split().freeze(),
                        source: remote,
                    };
                    if shared.sender().send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Read error from {}: {}", remote, e);
                    shared.set(TransportState::Error);
                    break;
                }
            }
        }
    })
}

/// Write all of `data`, moving the transport to `Error` on failure
pub(crate) async fn write_stream(
    writer: &mut StreamWriter,
    data: &[u8],
    remote: SocketAddr,
    shared: &SharedState,
) -> Result<usize> {
    let result = async {
        writer.write_all(data).await?;
        writer.flush().await
    }
    .await;

    match result {
        Ok(()) => {
            trace!("Sent {} bytes to {}", data.len(), remote);
            Ok(data.len())
        }
        Err(e) => {
            shared.set(TransportState::Error);
            Err(Error::SendFailed(remote, e))
        }
    }
}

/// TCP transport for SIP messages: one connection to the server
pub struct TcpTransport {
    bind_addr: SocketAddr,
    remote: SocketAddr,
    local: Option<SocketAddr>,
    writer: Option<StreamWriter>,
    shared: Arc<SharedState>,
    events_rx: mpsc::Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Create a transport connecting from `bind_addr` to `remote`
    pub fn new(bind_addr: SocketAddr, remote: SocketAddr) -> Self {
        let (events_tx, events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            bind_addr,
            remote,
            local: None,
            writer: None,
            shared: Arc::new(SharedState::new(TransportKind::Tcp, events_tx)),
            events_rx,
            reader: None,
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
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

        self.shared.set(TransportState::Connecting);
        let stream = match open_stream(self.bind_addr, self.remote).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("TCP connect to {} failed: {}", self.remote, e);
                self.shared.set(TransportState::Error);
                return Err(e);
            }
        };
        self.local = Some(stream.local_addr().map_err(Error::LocalAddrFailed)?);
        info!("SIP TCP transport connected {:?} -> {}", self.local, self.remote);

        let (read_half, write_half) = stream.into_split();
        self.writer = Some(Box::new(write_half));
        self.reader = Some(spawn_stream_reader(read_half, self.remote, self.shared.clone()));
        self.shared.set(TransportState::Connected);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        if self.shared.get() != TransportState::Connected {
            return Err(Error::NotConnected);
        }
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;
        write_stream(writer, data, self.remote, &self.shared).await
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<TransportEvent>> {
        Ok(drain_events(&mut self.events_rx, max_wait).await)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.local.ok_or(Error::NotConnected)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.shared.set(TransportState::Disconnected);
        debug!("TCP transport to {} disconnected", self.remote);
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.shared.get())
            .finish()
    }
}

/// Collect stream chunks into one buffer
#[cfg(test)]
pub(crate) fn concat(events: &[TransportEvent]) -> Bytes {
    let mut out = BytesMut::new();
    for event in events {
        if let TransportEvent::Received { data, .. } = event {
            out.extend_from_slice(data);
        }
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn any() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_connect_refused_moves_to_error() {
        // Grab a free port, then close the listener
        let listener = TcpListener::bind(any()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = TcpTransport::new(any(), addr);
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(..)));
        assert_eq!(err.code(), lws_infra_common::errors::LWS_ERR_SOCKET_CONNECT);
        assert_eq!(transport.state(), TransportState::Error);
        assert!(transport.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip_and_peer_close() {
        let listener = TcpListener::bind(any()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut transport = TcpTransport::new(any(), addr);
        let (connect, accept) = tokio::join!(transport.connect(), listener.accept());
        connect.unwrap();
        let (mut server, _) = accept.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);

        transport.send(b"REGISTER").await.unwrap();
        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"REGISTER");

        server.write_all(b"SIP/2.0 ").await.unwrap();
        server.write_all(b"200 OK").await.unwrap();
        drop(server);

        let mut events = Vec::new();
        while !events.contains(&TransportEvent::StateChanged(TransportState::Disconnected)) {
            events.extend(transport.poll(Duration::from_secs(1)).await.unwrap());
        }
        assert_eq!(&concat(&events)[..], b"SIP/2.0 200 OK");
        assert!(transport.send(b"x").await.is_err());
    }
}
