use std::fmt;
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName};
use rustls_pemfile::Item;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use super::tcp::{open_stream, spawn_stream_reader, write_stream, StreamWriter};
use super::{
    drain_events, SharedState, Transport, TransportEvent, TransportKind, TransportState,
    DEFAULT_CHANNEL_CAPACITY,
};
use crate::error::{Error, Result};

/// TLS client settings. Certificates and keys are PEM text held in memory.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// Trust anchors for the server certificate
    pub ca_pem: String,
    /// Client certificate chain for mutual TLS
    pub client_cert_pem: Option<String>,
    /// Private key matching `client_cert_pem`
    pub client_key_pem: Option<String>,
    /// Name checked against the server certificate; defaults to the remote IP
    pub server_name: Option<String>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_pem", &format_args!("{} bytes", self.ca_pem.len()))
            .field("client_cert", &self.client_cert_pem.is_some())
            .field("client_key", &self.client_key_pem.as_ref().map(|_| "<redacted>"))
            .field("server_name", &self.server_name)
            .finish()
    }
}

fn read_pem(mut reader: &[u8]) -> Result<Vec<Item>> {
    let reader: &mut dyn BufRead = &mut reader;
    rustls_pemfile::read_all(reader).map_err(|e| Error::TlsError(format!("Invalid PEM: {}", e)))
}

/// Parse every certificate in a PEM blob
pub fn load_certs(pem: &str) -> Result<Vec<Certificate>> {
    let certs: Vec<Certificate> = read_pem(pem.as_bytes())?
        .into_iter()
        .filter_map(|item| match item {
            Item::X509Certificate(der) => Some(Certificate(der)),
            _ => None,
        })
        .collect();

    if certs.is_empty() {
        return Err(Error::TlsError("No certificates found in PEM".into()));
    }
    Ok(certs)
}

/// Parse the first private key (PKCS#8, RSA or SEC1) in a PEM blob
pub fn load_private_key(pem: &str) -> Result<PrivateKey> {
    read_pem(pem.as_bytes())?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| Error::TlsError("No private key found in PEM".into()))
}

/// Build a rustls client configuration from in-memory PEM material
pub fn create_client_config(config: &TlsConfig) -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(&config.ca_pem)? {
        root_store
            .add(&cert)
            .map_err(|e| Error::TlsError(e.to_string()))?;
    }

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store);

    let client_config = match (&config.client_cert_pem, &config.client_key_pem) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| Error::TlsError(e.to_string()))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::TlsError(
                "Client certificate and key must be given together".into(),
            ))
        }
    };
    Ok(Arc::new(client_config))
}

/// TLS transport for SIP messages: one client connection to the server
pub struct TlsTransport {
    bind_addr: SocketAddr,
    remote: SocketAddr,
    config: TlsConfig,
    local: Option<SocketAddr>,
    writer: Option<StreamWriter>,
    shared: Arc<SharedState>,
    events_rx: mpsc::Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl TlsTransport {
    /// Create a transport connecting from `bind_addr` to `remote`
    pub fn new(bind_addr: SocketAddr, remote: SocketAddr, config: TlsConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            bind_addr,
            remote,
            config,
            local: None,
            writer: None,
            shared: Arc::new(SharedState::new(TransportKind::Tls, events_tx)),
            events_rx,
            reader: None,
        }
    }

    fn server_name(&self) -> Result<ServerName> {
        match &self.config.server_name {
            Some(name) => ServerName::try_from(name.as_str())
                .map_err(|_| Error::InvalidAddress(format!("Invalid TLS server name: {}", name))),
            None => Ok(ServerName::IpAddress(self.remote.ip())),
        }
    }

    async fn establish(&mut self) -> Result<()> {
        let connector = TlsConnector::from(create_client_config(&self.config)?);
        let server_name = self.server_name()?;

        let tcp_stream = open_stream(self.bind_addr, self.remote).await?;
        self.local = Some(tcp_stream.local_addr().map_err(Error::LocalAddrFailed)?);

        debug!("TLS handshake with {}", self.remote);
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| Error::TlsError(format!("Handshake with {} failed: {}", self.remote, e)))?;

        let (read_half, write_half) = tokio::io::split(tls_stream);
        self.writer = Some(Box::new(write_half));
        self.reader = Some(spawn_stream_reader(read_half, self.remote, self.shared.clone()));
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for TlsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tls
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
        if let Err(e) = self.establish().await {
            error!("TLS connect to {} failed: {}", self.remote, e);
            self.shared.set(TransportState::Error);
            return Err(e);
        }
        info!("SIP TLS transport connected {:?} -> {}", self.local, self.remote);
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
            // Sends close_notify
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.shared.set(TransportState::Disconnected);
        debug!("TLS transport to {} disconnected", self.remote);
        Ok(())
    }
}

impl Drop for TlsTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTransport")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.shared.get())
            .finish()
    }
}
