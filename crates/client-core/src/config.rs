//! Agent configuration
//!
//! [`AgentConfig`] groups identity, transport, media, NAT traversal and MQTT
//! settings. It can be built in code with the `with_*` methods or read from
//! TOML; every field has a default, so a TOML file only lists what differs.
//!
//! ```rust
//! use lws_client_core::{AgentConfig, TransportProtocol};
//!
//! let config = AgentConfig::from_toml_str(
//!     r#"
//!     server_host = "sip.example.com"
//!     username = "1001"
//!     password = "secret"
//!     register_expiry = 600
//!
//!     [transport]
//!     protocol = "tcp"
//!
//!     [media]
//!     enable_video = true
//!     video_codecs = ["h264"]
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.transport.protocol, TransportProtocol::Tcp);
//! assert_eq!(config.server_port(), 5060);
//! assert!(config.media.enable_video);
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use lws_dialog_core::TimerSettings;
use lws_media_core::{CodecId, IceRole, MediaKind, SessionConfig, StreamSettings, VideoFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default SIP port for UDP and TCP
pub const DEFAULT_SIP_PORT: u16 = 5060;
/// Default SIP port for TLS
pub const DEFAULT_SIPS_PORT: u16 = 5061;
/// Default MQTT broker port
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Signaling transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
    Mqtt,
}

/// Certificates for TLS, all PEM text held in memory
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// CA bundle the server certificate is checked against
    pub ca_pem: String,
    pub client_cert_pem: Option<String>,
    pub client_key_pem: Option<String>,
    /// SNI and certificate name; the server host when unset
    pub server_name: Option<String>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_pem", &format_args!("{} bytes", self.ca_pem.len()))
            .field("client_cert_pem", &self.client_cert_pem.is_some())
            .field("client_key_pem", &self.client_key_pem.as_ref().map(|_| "<redacted>"))
            .field("server_name", &self.server_name)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub protocol: TransportProtocol,
    /// TLS over TCP; needs `protocol = "tcp"`
    pub enable_tls: bool,
    pub tls: TlsConfig,
}

/// Media streams offered and accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Address the RTP sockets bind
    pub local_ip: IpAddr,
    /// Address written into SDP; the signaling address when unset
    pub advertised_ip: Option<IpAddr>,
    pub enable_audio: bool,
    pub enable_video: bool,
    /// In order of preference
    pub audio_codecs: Vec<CodecId>,
    pub video_codecs: Vec<CodecId>,
    /// PCM format the application works with
    pub sample_rate: u32,
    pub channels: u8,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// 0 picks a free port
    pub audio_port: u16,
    pub video_port: u16,
    /// Largest RTP payload before a video frame is fragmented
    pub max_payload: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let video = VideoFormat::default();
        Self {
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertised_ip: None,
            enable_audio: true,
            enable_video: false,
            audio_codecs: vec![CodecId::Pcmu, CodecId::Pcma],
            video_codecs: vec![CodecId::H264],
            sample_rate: 8000,
            channels: 1,
            width: video.width,
            height: video.height,
            fps: video.fps,
            audio_port: 0,
            video_port: 0,
            max_payload: 1200,
        }
    }
}

/// NAT traversal
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub enable_ice: bool,
    /// Take the controlling role on outgoing calls
    pub controlling: bool,
    /// `host:port` of a STUN server
    pub stun_server: Option<String>,
    /// `host:port` of a TURN server
    pub turn_server: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
    pub gather_timeout_ms: u64,
    pub check_timeout_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            enable_ice: false,
            controlling: true,
            stun_server: None,
            turn_server: None,
            turn_username: None,
            turn_password: None,
            gather_timeout_ms: 5_000,
            check_timeout_ms: 10_000,
        }
    }
}

impl std::fmt::Debug for IceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IceConfig")
            .field("enable_ice", &self.enable_ice)
            .field("controlling", &self.controlling)
            .field("stun_server", &self.stun_server)
            .field("turn_server", &self.turn_server)
            .field("turn_username", &self.turn_username)
            .field("turn_password", &self.turn_password.as_ref().map(|_| "<redacted>"))
            .field("gather_timeout_ms", &self.gather_timeout_ms)
            .field("check_timeout_ms", &self.check_timeout_ms)
            .finish()
    }
}

impl IceConfig {
    /// Role for a call in the given direction
    pub fn role(&self, outgoing: bool) -> IceRole {
        if self.controlling == outgoing {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        }
    }
}

/// Broker and topics for SIP over MQTT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    /// Topic outgoing SIP messages are published to
    pub publish_topic: String,
    /// Topic incoming SIP messages arrive on
    pub subscribe_topic: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: String::new(),
            broker_port: DEFAULT_MQTT_PORT,
            client_id: "lws-agent".to_string(),
            publish_topic: String::new(),
            subscribe_topic: String::new(),
            keep_alive_secs: 30,
        }
    }
}

/// Everything an [`Agent`](crate::Agent) needs
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Registrar and outbound proxy. Without one the agent places calls
    /// directly to the host in the target URI.
    pub server_host: Option<String>,
    /// 5060, or 5061 with TLS, when unset
    pub server_port: Option<u16>,
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
    /// Address the signaling socket binds
    pub local_ip: IpAddr,
    /// 0 picks a free port
    pub local_port: u16,
    /// Host written into Via and Contact; derived from the socket when unset
    pub advertised_host: Option<String>,
    /// Requested registration lifetime in seconds
    pub register_expiry: u32,
    /// Seconds an outgoing call may ring before it is cancelled and reported
    /// as 408
    pub no_answer_timeout: u32,
    pub user_agent: String,
    pub transport: TransportConfig,
    pub media: MediaConfig,
    pub ice: IceConfig,
    pub mqtt: MqttConfig,
    pub timers: TimerSettings,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_host: None,
            server_port: None,
            username: String::new(),
            password: String::new(),
            display_name: None,
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_port: DEFAULT_SIP_PORT,
            advertised_host: None,
            register_expiry: 3600,
            no_answer_timeout: 120,
            user_agent: format!("lws/{}", env!("CARGO_PKG_VERSION")),
            transport: TransportConfig::default(),
            media: MediaConfig::default(),
            ice: IceConfig::default(),
            mqtt: MqttConfig::default(),
            timers: TimerSettings::default(),
        }
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("local_ip", &self.local_ip)
            .field("local_port", &self.local_port)
            .field("advertised_host", &self.advertised_host)
            .field("register_expiry", &self.register_expiry)
            .field("no_answer_timeout", &self.no_answer_timeout)
            .field("user_agent", &self.user_agent)
            .field("transport", &self.transport)
            .field("media", &self.media)
            .field("ice", &self.ice)
            .field("mqtt", &self.mqtt)
            .field("timers", &self.timers)
            .finish()
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_server(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.server_host = Some(host.into());
        self.server_port = port;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_local_addr(mut self, ip: IpAddr, port: u16) -> Self {
        self.local_ip = ip;
        self.local_port = port;
        self
    }

    pub fn with_advertised_host(mut self, host: impl Into<String>) -> Self {
        self.advertised_host = Some(host.into());
        self
    }

    pub fn with_register_expiry(mut self, seconds: u32) -> Self {
        self.register_expiry = seconds;
        self
    }

    pub fn with_no_answer_timeout(mut self, seconds: u32) -> Self {
        self.no_answer_timeout = seconds;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_transport(mut self, protocol: TransportProtocol) -> Self {
        self.transport.protocol = protocol;
        self
    }

    /// TLS over TCP with the given certificates
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.transport.protocol = TransportProtocol::Tcp;
        self.transport.enable_tls = true;
        self.transport.tls = tls;
        self
    }

    pub fn with_media(mut self, media: MediaConfig) -> Self {
        self.media = media;
        self
    }

    pub fn with_ice(mut self, ice: IceConfig) -> Self {
        self.ice = ice;
        self
    }

    /// SIP over MQTT through `mqtt`
    pub fn with_mqtt(mut self, mqtt: MqttConfig) -> Self {
        self.transport.protocol = TransportProtocol::Mqtt;
        self.mqtt = mqtt;
        self
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    /// Server port with the transport default applied
    pub fn server_port(&self) -> u16 {
        self.server_port.unwrap_or(if self.transport.enable_tls {
            DEFAULT_SIPS_PORT
        } else {
            DEFAULT_SIP_PORT
        })
    }

    /// Domain of the address of record: the server, or the local host
    pub fn domain(&self) -> Option<&str> {
        self.server_host.as_deref().filter(|h| !h.is_empty())
    }

    /// Check the settings fit together
    pub fn validate(&self) -> Result<()> {
        if self.domain().is_some() && self.username.is_empty() {
            return Err(Error::Config("username is required when a server is configured".into()));
        }
        if self.register_expiry == 0 {
            return Err(Error::Config("register_expiry must be greater than zero".into()));
        }
        if self.no_answer_timeout == 0 {
            return Err(Error::Config("no_answer_timeout must be greater than zero".into()));
        }
        if self.server_port == Some(0) {
            return Err(Error::Config("server_port must not be zero".into()));
        }

        let transport = &self.transport;
        if transport.enable_tls {
            if transport.protocol != TransportProtocol::Tcp {
                return Err(Error::Config("TLS requires the TCP transport".into()));
            }
            if transport.tls.ca_pem.trim().is_empty() {
                return Err(Error::Config("TLS requires a CA certificate".into()));
            }
            if transport.tls.client_cert_pem.is_some() != transport.tls.client_key_pem.is_some() {
                return Err(Error::Config("client certificate and key must be given together".into()));
            }
        }
        match transport.protocol {
            TransportProtocol::Tcp if self.domain().is_none() => {
                return Err(Error::Config("TCP and TLS need a server".into()));
            }
            TransportProtocol::Mqtt => {
                let mqtt = &self.mqtt;
                if mqtt.broker_host.is_empty() || mqtt.broker_port == 0 {
                    return Err(Error::Config("MQTT requires a broker host and port".into()));
                }
                if mqtt.publish_topic.is_empty() || mqtt.subscribe_topic.is_empty() {
                    return Err(Error::Config("MQTT requires publish and subscribe topics".into()));
                }
                if mqtt.client_id.is_empty() {
                    return Err(Error::Config("MQTT requires a client id".into()));
                }
            }
            _ => {}
        }

        let media = &self.media;
        if media.enable_audio {
            if media.audio_codecs.is_empty() {
                return Err(Error::Config("audio is enabled without codecs".into()));
            }
            if let Some(codec) = media.audio_codecs.iter().find(|c| c.kind() != MediaKind::Audio) {
                return Err(Error::Config(format!("{} is not an audio codec", codec)));
            }
            if media.sample_rate == 0 || media.channels == 0 {
                return Err(Error::Config("sample_rate and channels must be non-zero".into()));
            }
        }
        if media.enable_video {
            if media.video_codecs.is_empty() {
                return Err(Error::Config("video is enabled without codecs".into()));
            }
            if let Some(codec) = media.video_codecs.iter().find(|c| c.kind() != MediaKind::Video) {
                return Err(Error::Config(format!("{} is not a video codec", codec)));
            }
            if media.width == 0 || media.height == 0 || media.fps == 0 {
                return Err(Error::Config("video width, height and fps must be non-zero".into()));
            }
        }
        if media.max_payload < 64 {
            return Err(Error::Config("max_payload below 64 bytes".into()));
        }

        let ice = &self.ice;
        if ice.turn_server.is_some() && (ice.turn_username.is_none() || ice.turn_password.is_none()) {
            return Err(Error::Config("TURN requires a username and password".into()));
        }
        if ice.enable_ice && (ice.gather_timeout_ms == 0 || ice.check_timeout_ms == 0) {
            return Err(Error::Config("ICE timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Media session settings for one call
    pub(crate) fn session_config(&self, video: bool, advertised_ip: Option<IpAddr>) -> SessionConfig {
        let media = &self.media;
        let audio = media.enable_audio.then(|| {
            StreamSettings::new(media.audio_codecs.clone()).with_port(media.audio_port)
        });
        let video = (video && media.enable_video).then(|| {
            StreamSettings::new(media.video_codecs.clone()).with_port(media.video_port)
        });
        let username = if self.username.is_empty() {
            "-".to_string()
        } else {
            self.username.clone()
        };

        let mut config = SessionConfig::new(media.local_ip)
            .with_username(username)
            .with_audio(audio)
            .with_video(video)
            .with_video_format(VideoFormat {
                width: media.width,
                height: media.height,
                fps: media.fps,
            })
            .with_max_payload(media.max_payload)
            .with_ice_timeouts(
                Duration::from_millis(self.ice.gather_timeout_ms),
                Duration::from_millis(self.ice.check_timeout_ms),
            );
        if let Some(ip) = media.advertised_ip.or(advertised_ip) {
            config = config.with_advertised_ip(ip);
        }
        config
    }
}
