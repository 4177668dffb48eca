//! Media session: binds sockets, runs SDP offer/answer and moves frames
//! between the application and RTP.
//!
//! ```text
//! Idle --prepare--> Gathering --> Ready --start--> Connected --stop--> Stopped
//! ```
//!
//! Offer/answer happens in `Ready`: either [`MediaSession::create_offer`]
//! followed by [`MediaSession::apply_answer`], or
//! [`MediaSession::accept_offer`] alone.

mod stream;

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lws_infra_common::errors::ErrorCode;
use lws_infra_common::TimerWheel;
use lws_rtp_core::RtpSessionStats;
use lws_sip_core::sdp::{Candidate, Direction, SessionDescription};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::codec::{CodecId, MediaKind};
use crate::error::{Error, Result};
use crate::ice::{IceAgent, IceComponent, COMPONENT_RTCP, COMPONENT_RTP};
use crate::payload::DEFAULT_MAX_PAYLOAD;
use crate::sdp::{self, LocalMedia, LocalStream, NegotiatedStream};

use self::stream::{spawn_receiver, ActiveStream, BoundStream};

/// Lifecycle of a [`MediaSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    /// Sockets bound, candidates being gathered
    Gathering,
    /// Ready for offer/answer and start
    Ready,
    Connected,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Gathering => "gathering",
            SessionState::Ready => "ready",
            SessionState::Connected => "connected",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Identifies a session in events shared by several sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "media-{}", self.0)
    }
}

/// Video geometry reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// Codecs, port and direction of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Preference order
    pub codecs: Vec<CodecId>,
    /// RTP port, 0 for ephemeral. RTCP uses the next port when free.
    pub port: u16,
    pub direction: Direction,
}

impl StreamSettings {
    pub fn new(codecs: Vec<CodecId>) -> Self {
        Self {
            codecs,
            port: 0,
            direction: Direction::SendRecv,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// Media session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Address sockets are bound to
    pub local_ip: IpAddr,
    /// Address written into SDP when `local_ip` is unspecified
    pub advertised_ip: Option<IpAddr>,
    /// `o=` user name
    pub username: String,
    /// RTCP canonical name
    pub cname: String,
    pub audio: Option<StreamSettings>,
    pub video: Option<StreamSettings>,
    pub video_format: VideoFormat,
    pub max_payload: usize,
    pub ice_gather_timeout: Duration,
    pub ice_check_timeout: Duration,
}

impl SessionConfig {
    /// G.711 audio only
    pub fn new(local_ip: IpAddr) -> Self {
        Self {
            local_ip,
            advertised_ip: None,
            username: "lws".to_string(),
            cname: format!("lws-{:08x}", rand::random::<u32>()),
            audio: Some(StreamSettings::new(vec![CodecId::Pcmu, CodecId::Pcma])),
            video: None,
            video_format: VideoFormat::default(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            ice_gather_timeout: Duration::from_secs(5),
            ice_check_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_advertised_ip(mut self, ip: IpAddr) -> Self {
        self.advertised_ip = Some(ip);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = cname.into();
        self
    }

    pub fn with_audio(mut self, audio: Option<StreamSettings>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_video(mut self, video: Option<StreamSettings>) -> Self {
        self.video = video;
        self
    }

    pub fn with_video_format(mut self, format: VideoFormat) -> Self {
        self.video_format = format;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_ice_timeouts(mut self, gather: Duration, check: Duration) -> Self {
        self.ice_gather_timeout = gather;
        self.ice_check_timeout = check;
        self
    }

    /// Address to publish in SDP
    pub fn sdp_address(&self) -> IpAddr {
        match self.advertised_ip {
            Some(ip) => ip,
            None if self.local_ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => self.local_ip,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub codec: CodecId,
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub codec: CodecId,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Negotiated media, reported once media starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub audio: Option<AudioInfo>,
    pub video: Option<VideoInfo>,
}

/// Something the application should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Ready(MediaInfo),
    /// PCM16LE for G.711, codec frames otherwise. `timestamp` is the RTP
    /// timestamp.
    AudioFrame { data: Bytes, timestamp: u32 },
    /// One complete access unit
    VideoFrame { data: Bytes, timestamp: u32 },
    Error { code: ErrorCode, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: MediaEvent,
}

/// Per-stream RTP counters
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MediaSessionStats {
    pub audio: Option<RtpSessionStats>,
    pub video: Option<RtpSessionStats>,
}

pub struct MediaSession {
    id: SessionId,
    config: SessionConfig,
    state: SessionState,
    events: mpsc::UnboundedSender<SessionEvent>,
    ice: Option<Box<dyn IceAgent>>,
    /// Arms the ICE deadlines; a local tokio timer without one
    timers: Option<TimerWheel>,
    /// Index is the ICE stream index
    bound: Vec<BoundStream>,
    candidates: Vec<Vec<Candidate>>,
    sdp_version: u64,
    local_sdp: Option<SessionDescription>,
    remote_sdp: Option<SessionDescription>,
    negotiated: Vec<NegotiatedStream>,
    active: Vec<Arc<ActiveStream>>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("ice", &self.ice.is_some())
            .field("streams", &self.negotiated.len())
            .finish()
    }
}

impl MediaSession {
    pub fn new(id: SessionId, config: SessionConfig, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            id,
            config,
            state: SessionState::Idle,
            events,
            ice: None,
            timers: None,
            bound: Vec::new(),
            candidates: Vec::new(),
            sdp_version: u64::from(rand::random::<u32>()),
            local_sdp: None,
            remote_sdp: None,
            negotiated: Vec::new(),
            active: Vec::new(),
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Use an ICE agent for candidates and remote address selection
    pub fn with_ice(mut self, agent: Box<dyn IceAgent>) -> Self {
        self.ice = Some(agent);
        self
    }

    /// Arm the gathering and connectivity-check deadlines on `wheel`
    pub fn with_timer_wheel(mut self, wheel: TimerWheel) -> Self {
        self.timers = Some(wheel);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Last description this side produced
    pub fn local_sdp(&self) -> Option<&SessionDescription> {
        self.local_sdp.as_ref()
    }

    pub fn remote_sdp(&self) -> Option<&SessionDescription> {
        self.remote_sdp.as_ref()
    }

    pub fn negotiated(&self) -> &[NegotiatedStream] {
        &self.negotiated
    }

    fn expect_state(&self, expected: SessionState, name: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected: name,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Bind sockets and gather candidates
    pub async fn prepare(&mut self) -> Result<()> {
        self.expect_state(SessionState::Idle, "Idle")?;
        self.state = SessionState::Gathering;
        match self.bind_and_gather().await {
            Ok(()) => {
                self.state = SessionState::Ready;
                debug!(session = %self.id, streams = self.bound.len(), "Media session ready");
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "Media preparation failed");
                self.bound.clear();
                self.candidates.clear();
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    async fn bind_and_gather(&mut self) -> Result<()> {
        let wanted = [
            (MediaKind::Audio, self.config.audio.clone()),
            (MediaKind::Video, self.config.video.clone()),
        ];
        for (kind, settings) in wanted {
            if let Some(settings) = settings {
                if settings.codecs.is_empty() {
                    return Err(Error::Negotiation(format!("no {} codecs configured", kind)));
                }
                self.bound
                    .push(BoundStream::bind(kind, settings, self.config.local_ip).await?);
            }
        }
        if self.bound.is_empty() {
            return Err(Error::Negotiation("no media streams configured".into()));
        }
        self.candidates = vec![Vec::new(); self.bound.len()];

        let Some(ice) = self.ice.as_mut() else {
            return Ok(());
        };
        let components: Vec<IceComponent> = self
            .bound
            .iter()
            .enumerate()
            .flat_map(|(stream, b)| {
                [
                    IceComponent {
                        stream,
                        component: COMPONENT_RTP,
                        address: b.rtp_addr,
                    },
                    IceComponent {
                        stream,
                        component: COMPONENT_RTCP,
                        address: b.rtcp_addr,
                    },
                ]
            })
            .collect();
        let gathered = with_deadline(
            self.timers.as_ref(),
            self.config.ice_gather_timeout,
            "ICE candidate gathering",
            ice.gather(&components),
        )
        .await?;
        for (stream, candidate) in gathered {
            if let Some(list) = self.candidates.get_mut(stream) {
                list.push(candidate);
            }
        }
        Ok(())
    }

    fn local_media(&mut self) -> LocalMedia {
        self.sdp_version += 1;
        LocalMedia {
            username: self.config.username.clone(),
            session_id: self.sdp_version,
            address: self.config.sdp_address(),
            streams: self
                .bound
                .iter()
                .zip(&self.candidates)
                .map(|(b, candidates)| LocalStream {
                    kind: b.kind,
                    codecs: b.settings.codecs.clone(),
                    rtp_port: b.rtp_addr.port(),
                    rtcp_port: b.rtcp_addr.port(),
                    direction: b.settings.direction,
                    candidates: candidates.clone(),
                })
                .collect(),
            ice: self.ice.as_ref().map(|ice| ice.local_credentials()),
        }
    }

    /// Offer for an outgoing call
    pub fn create_offer(&mut self) -> Result<SessionDescription> {
        self.expect_state(SessionState::Ready, "Ready")?;
        let offer = sdp::build_offer(&self.local_media());
        self.local_sdp = Some(offer.clone());
        Ok(offer)
    }

    /// Answer a remote offer and keep the negotiated streams
    pub fn accept_offer(&mut self, offer: &SessionDescription) -> Result<SessionDescription> {
        self.expect_state(SessionState::Ready, "Ready")?;
        let local = self.local_media();
        let (answer, streams) = sdp::answer_offer(&local, offer)?;
        info!(session = %self.id, streams = streams.len(), "Accepted remote offer");
        self.remote_sdp = Some(offer.clone());
        self.local_sdp = Some(answer.clone());
        self.negotiated = streams;
        Ok(answer)
    }

    /// Match the remote answer against the offer sent earlier
    pub fn apply_answer(&mut self, answer: &SessionDescription) -> Result<()> {
        self.expect_state(SessionState::Ready, "Ready")?;
        let offer = self
            .local_sdp
            .as_ref()
            .ok_or_else(|| Error::Negotiation("answer received before an offer was made".into()))?;
        let streams = sdp::apply_answer(offer, answer)?;
        info!(session = %self.id, streams = streams.len(), "Applied remote answer");
        self.remote_sdp = Some(answer.clone());
        self.negotiated = streams;
        Ok(())
    }

    fn stream_index(&self, kind: MediaKind) -> Option<usize> {
        self.bound.iter().position(|b| b.kind == kind)
    }

    /// Run ICE checks when both sides do ICE and pick remote addresses
    async fn connect_ice(&mut self) -> Result<()> {
        let Some(ice) = self.ice.as_mut() else {
            return Ok(());
        };
        let mut remote_streams = 0;
        for stream in &self.negotiated {
            let (Some(index), Some(credentials)) = (
                self.bound.iter().position(|b| b.kind == stream.kind),
                stream.remote_ice.clone(),
            ) else {
                continue;
            };
            ice.set_remote(index, credentials, stream.remote_candidates.clone());
            remote_streams += 1;
        }
        if remote_streams == 0 {
            debug!(session = %self.id, "Peer does not use ICE, sending to SDP addresses");
            return Ok(());
        }

        with_deadline(
            self.timers.as_ref(),
            self.config.ice_check_timeout,
            "ICE connectivity checks",
            ice.connect(),
        )
        .await?;

        for stream in &mut self.negotiated {
            let Some(index) = self.bound.iter().position(|b| b.kind == stream.kind) else {
                continue;
            };
            if let Some(addr) = ice.selected(index, COMPONENT_RTP) {
                stream.remote_rtp = addr;
            }
            if let Some(addr) = ice.selected(index, COMPONENT_RTCP) {
                stream.remote_rtcp = addr;
            }
        }
        Ok(())
    }

    fn media_info(&self) -> MediaInfo {
        let mut info = MediaInfo::default();
        for stream in &self.negotiated {
            match stream.kind {
                MediaKind::Audio => {
                    info.audio = Some(AudioInfo {
                        codec: stream.codec,
                        sample_rate: stream.codec.sample_rate(),
                        channels: stream.channels,
                    })
                }
                MediaKind::Video => {
                    let format = self.config.video_format;
                    info.video = Some(VideoInfo {
                        codec: stream.codec,
                        width: format.width,
                        height: format.height,
                        fps: format.fps,
                    })
                }
            }
        }
        info
    }

    /// Start media flow on the negotiated streams
    pub async fn start(&mut self) -> Result<()> {
        self.expect_state(SessionState::Ready, "Ready")?;
        if self.negotiated.is_empty() {
            return Err(Error::Negotiation("no negotiated streams to start".into()));
        }
        self.connect_ice().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        for negotiated in &self.negotiated {
            let Some(index) = self.stream_index(negotiated.kind) else {
                continue;
            };
            let active = Arc::new(ActiveStream::new(
                &self.bound[index],
                negotiated.clone(),
                negotiated.remote_rtp,
                negotiated.remote_rtcp,
                &self.config.cname,
                self.config.max_payload,
            ));
            info!(
                session = %self.id,
                kind = %negotiated.kind,
                codec = %negotiated.codec,
                pt = negotiated.payload_type,
                remote = %negotiated.remote_rtp,
                ssrc = active.ssrc(),
                "Media stream started"
            );
            self.tasks.push(spawn_receiver(
                active.clone(),
                self.id,
                self.events.clone(),
                shutdown_rx.clone(),
            ));
            self.active.push(active);
        }
        self.shutdown = Some(shutdown_tx);
        self.state = SessionState::Connected;

        let ready = SessionEvent {
            session: self.id,
            event: MediaEvent::Ready(self.media_info()),
        };
        if self.events.send(ready).is_err() {
            debug!(session = %self.id, "Media event receiver gone");
        }
        Ok(())
    }

    fn active_stream(&self, kind: MediaKind) -> Result<Arc<ActiveStream>> {
        self.expect_state(SessionState::Connected, "Connected")?;
        self.active
            .iter()
            .find(|s| s.kind() == kind)
            .cloned()
            .ok_or(Error::NoStream(kind))
    }

    /// Send one audio frame; `timestamp_ms` is its media time
    pub async fn send_audio(&self, frame: &[u8], timestamp_ms: u32) -> Result<()> {
        self.active_stream(MediaKind::Audio)?
            .send_frame(frame, timestamp_ms)
            .await
    }

    /// Send one encoded video frame (Annex-B for H.264/H.265)
    pub async fn send_video(&self, frame: &[u8], timestamp_ms: u32) -> Result<()> {
        self.active_stream(MediaKind::Video)?
            .send_frame(frame, timestamp_ms)
            .await
    }

    pub fn stats(&self) -> MediaSessionStats {
        let mut stats = MediaSessionStats::default();
        for stream in &self.active {
            match stream.kind() {
                MediaKind::Audio => stats.audio = Some(stream.stats()),
                MediaKind::Video => stats.video = Some(stream.stats()),
            }
        }
        stats
    }

    /// Send RTCP BYE, stop the receive tasks and release the sockets
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Stopped {
            return Ok(());
        }
        for stream in &self.active {
            stream.send_bye(None).await;
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(session = %self.id, error = %e, "Media task ended abnormally");
            }
        }
        if let Some(ice) = self.ice.as_mut() {
            ice.close();
        }
        self.active.clear();
        self.bound.clear();
        self.state = SessionState::Stopped;
        info!(session = %self.id, "Media session stopped");
        Ok(())
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Run `work` unless `after` passes first
async fn with_deadline<T>(
    wheel: Option<&TimerWheel>,
    after: Duration,
    what: &str,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let Some(wheel) = wheel else {
        return time::timeout(after, work)
            .await
            .map_err(|_| Error::Timeout(what.into()))?;
    };
    let (expired, deadline) = oneshot::channel();
    let handle = wheel
        .start(after, move || {
            let _ = expired.send(());
        })
        .map_err(|e| Error::Timeout(format!("{what}: {e}")))?;
    tokio::select! {
        done = work => {
            let _ = wheel.stop(handle);
            done
        }
        Ok(()) = deadline => Err(Error::Timeout(what.into())),
    }
}
