use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::{
    drain_events, SharedState, Transport, TransportEvent, TransportKind, TransportState,
    DEFAULT_CHANNEL_CAPACITY, MAX_DATAGRAM_SIZE,
};
use crate::error::{Error, Result};

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    /// Topic outbound SIP messages are published to
    pub publish_topic: String,
    /// Topic inbound SIP messages arrive on
    pub subscribe_topic: String,
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            client_id: String::new(),
            publish_topic: String::new(),
            subscribe_topic: String::new(),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// SIP over MQTT publish/subscribe.
///
/// Each publish carries exactly one SIP message, so no framing is needed.
/// The transport is `Connecting` until the broker acknowledges the session.
pub struct MqttTransport {
    config: MqttConfig,
    broker: Option<SocketAddr>,
    client: Option<AsyncClient>,
    shared: Arc<SharedState>,
    events_rx: mpsc::Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            config,
            broker: None,
            client: None,
            shared: Arc::new(SharedState::new(TransportKind::Mqtt, events_tx)),
            events_rx,
            reader: None,
        }
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    async fn resolve_broker(&self) -> Result<SocketAddr> {
        let target = (self.config.broker_host.as_str(), self.config.broker_port);
        tokio::net::lookup_host(target)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                Error::InvalidAddress(format!(
                    "{}:{}",
                    self.config.broker_host, self.config.broker_port
                ))
            })
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    fn state(&self) -> TransportState {
        self.shared.get()
    }

    async fn connect(&mut self) -> Result<()> {
        match self.shared.get() {
            TransportState::Connected | TransportState::Connecting => return Ok(()),
            TransportState::Error => {
                return Err(Error::InvalidState("transport is in error state".into()))
            }
            TransportState::Disconnected => {}
        }
        if self.config.publish_topic.is_empty() || self.config.subscribe_topic.is_empty() {
            return Err(Error::InvalidState("MQTT topics are not configured".into()));
        }

        self.shared.set(TransportState::Connecting);
        let broker = match self.resolve_broker().await {
            Ok(addr) => addr,
            Err(e) => {
                self.shared.set(TransportState::Error);
                return Err(e);
            }
        };

        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.broker_host.clone(),
            self.config.broker_port,
        );
        options.set_keep_alive(self.config.keep_alive);
        options.set_max_packet_size(MAX_DATAGRAM_SIZE + 1024, MAX_DATAGRAM_SIZE + 1024);

        let (client, mut eventloop) = AsyncClient::new(options, DEFAULT_CHANNEL_CAPACITY);
        client
            .subscribe(self.config.subscribe_topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::MqttError(e.to_string()))?;

        let shared = self.shared.clone();
        let topic = self.config.subscribe_topic.clone();
        self.reader = Some(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT session established with {}", broker);
                        shared.set(TransportState::Connected);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == topic => {
                        trace!("Received {} bytes on {}", publish.payload.len(), publish.topic);
                        let event = TransportEvent::Received {
                            data: publish.payload,
                            source: broker,
                        };
                        if shared.sender().send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        shared.set(TransportState::Error);
                        break;
                    }
                }
            }
            debug!("MQTT event loop terminated");
        }));

        self.broker = Some(broker);
        self.client = Some(client);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        // Publishes queue inside the client until the broker acknowledges
        if !matches!(
            self.shared.get(),
            TransportState::Connected | TransportState::Connecting
        ) {
            return Err(Error::NotConnected);
        }
        let client = self.client.as_ref().ok_or(Error::NotConnected)?;
        client
            .publish(
                self.config.publish_topic.clone(),
                QoS::AtLeastOnce,
                false,
                data.to_vec(),
            )
            .await
            .map_err(|e| Error::MqttError(e.to_string()))?;
        trace!("Published {} bytes to {}", data.len(), self.config.publish_topic);
        Ok(data.len())
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<TransportEvent>> {
        Ok(drain_events(&mut self.events_rx, max_wait).await)
    }

    /// MQTT hides the socket; the unspecified address is reported once the
    /// session is open
    fn local_addr(&self) -> Result<SocketAddr> {
        match self.client {
            Some(_) => Ok(SocketAddr::from(([0, 0, 0, 0], 0))),
            None => Err(Error::NotConnected),
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.broker
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.shared.set(TransportState::Disconnected);
        debug!("MQTT transport disconnected");
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTransport")
            .field("broker", &self.config.broker_host)
            .field("port", &self.config.broker_port)
            .field("client_id", &self.config.client_id)
            .field("state", &self.shared.get())
            .finish()
    }
}
