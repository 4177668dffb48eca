//! Socket pairs and the per-stream receive task

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lws_infra_common::errors::LWS_ERR_SOCKET_RECV;
use lws_rtp_core::{
    is_rtcp, RtpPacket, RtpSession, RtpSessionConfig, RtpSessionStats, SequenceOutcome,
};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use super::{MediaEvent, SessionEvent, SessionId, StreamSettings};
use crate::codec::MediaKind;
use crate::error::{Error, Result};
use crate::payload::{depacketizer_for, packetizer_for, Depacketizer, Packetizer};
use crate::sdp::NegotiatedStream;

const RECV_BUFFER_SIZE: usize = 65_536;

/// Pause after a failed receive before reading the socket again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Turns a run of receive errors into one report
#[derive(Debug, Default)]
struct ErrorRun {
    failing: bool,
}

impl ErrorRun {
    /// True for the first error of a run
    fn failed(&mut self) -> bool {
        !std::mem::replace(&mut self.failing, true)
    }

    /// True when a run of errors just ended
    fn recovered(&mut self) -> bool {
        std::mem::take(&mut self.failing)
    }
}

/// RTP and RTCP sockets of one stream, bound before the offer/answer
#[derive(Debug)]
pub(crate) struct BoundStream {
    pub kind: MediaKind,
    pub settings: StreamSettings,
    pub rtp: Arc<UdpSocket>,
    pub rtcp: Arc<UdpSocket>,
    pub rtp_addr: SocketAddr,
    pub rtcp_addr: SocketAddr,
}

async fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })
}

impl BoundStream {
    /// Bind RTP on the configured port and RTCP on the next one when free
    pub async fn bind(kind: MediaKind, settings: StreamSettings, ip: IpAddr) -> Result<Self> {
        let rtp = bind(SocketAddr::new(ip, settings.port)).await?;
        let rtp_addr = rtp.local_addr()?;

        let preferred = rtp_addr.port().checked_add(1).map(|p| SocketAddr::new(ip, p));
        let rtcp = match preferred {
            Some(addr) => match UdpSocket::bind(addr).await {
                Ok(socket) => socket,
                Err(e) => {
                    debug!(%addr, error = %e, "RTCP port taken, using an ephemeral one");
                    bind(SocketAddr::new(ip, 0)).await?
                }
            },
            None => bind(SocketAddr::new(ip, 0)).await?,
        };
        let rtcp_addr = rtcp.local_addr()?;
        debug!(%kind, rtp = %rtp_addr, rtcp = %rtcp_addr, "Media sockets bound");

        Ok(Self {
            kind,
            settings,
            rtp: Arc::new(rtp),
            rtcp: Arc::new(rtcp),
            rtp_addr,
            rtcp_addr,
        })
    }
}

/// A negotiated stream with media flowing
pub(crate) struct ActiveStream {
    pub negotiated: NegotiatedStream,
    rtp_socket: Arc<UdpSocket>,
    rtcp_socket: Arc<UdpSocket>,
    remote_rtp: SocketAddr,
    remote_rtcp: SocketAddr,
    rtp: Mutex<RtpSession>,
    packetizer: Mutex<Box<dyn Packetizer>>,
}

impl ActiveStream {
    pub fn new(
        bound: &BoundStream,
        negotiated: NegotiatedStream,
        remote_rtp: SocketAddr,
        remote_rtcp: SocketAddr,
        cname: &str,
        max_payload: usize,
    ) -> Self {
        let config = RtpSessionConfig::new(negotiated.clock_rate, cname);
        let packetizer = packetizer_for(negotiated.codec, max_payload);
        Self {
            rtp_socket: bound.rtp.clone(),
            rtcp_socket: bound.rtcp.clone(),
            remote_rtp,
            remote_rtcp,
            rtp: Mutex::new(RtpSession::new(config, Instant::now().into_std())),
            packetizer: Mutex::new(packetizer),
            negotiated,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.negotiated.kind
    }

    pub fn ssrc(&self) -> u32 {
        self.rtp.lock().ssrc()
    }

    /// Packetize and send one frame. `timestamp_ms` is media time.
    pub async fn send_frame(&self, frame: &[u8], timestamp_ms: u32) -> Result<()> {
        if !self.negotiated.sends() {
            trace!(kind = %self.kind(), "Stream does not send, frame dropped");
            return Ok(());
        }
        let media_ts = (u64::from(timestamp_ms) * u64::from(self.negotiated.clock_rate) / 1000) as u32;

        let datagrams = {
            let payloads = self.packetizer.lock().packetize(frame)?;
            let mut rtp = self.rtp.lock();
            payloads
                .into_iter()
                .map(|p| {
                    rtp.next_packet(self.negotiated.payload_type, media_ts, p.marker, p.data)
                        .serialize()
                })
                .collect::<std::result::Result<Vec<Bytes>, _>>()?
        };
        for datagram in datagrams {
            self.rtp_socket.send_to(&datagram, self.remote_rtp).await?;
        }
        Ok(())
    }

    async fn send_report(&self) {
        let report = self.rtp.lock().build_report(Instant::now().into_std());
        match report {
            Ok(data) => {
                if let Err(e) = self.rtcp_socket.send_to(&data, self.remote_rtcp).await {
                    warn!(error = %e, remote = %self.remote_rtcp, "RTCP send failed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to build RTCP report"),
        }
    }

    /// Final report with BYE
    pub async fn send_bye(&self, reason: Option<&str>) {
        let bye = self.rtp.lock().build_bye(Instant::now().into_std(), reason);
        match bye {
            Ok(data) => {
                if let Err(e) = self.rtcp_socket.send_to(&data, self.remote_rtcp).await {
                    debug!(error = %e, "RTCP BYE not sent");
                }
            }
            Err(e) => warn!(error = %e, "Failed to build RTCP BYE"),
        }
    }

    pub fn stats(&self) -> RtpSessionStats {
        self.rtp.lock().stats()
    }

    fn accepts_payload_type(&self, payload_type: u8) -> bool {
        payload_type == self.negotiated.payload_type
            || payload_type == self.negotiated.local_payload_type
    }

    fn on_rtp(&self, data: &[u8], depacketizer: &mut dyn Depacketizer) -> Option<MediaEvent> {
        let packet = match RtpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "Dropping malformed RTP packet");
                return None;
            }
        };
        if !self.accepts_payload_type(packet.header.payload_type) {
            trace!(pt = packet.header.payload_type, "Ignoring unnegotiated payload type");
            return None;
        }
        match self.rtp.lock().on_rtp(&packet, Instant::now().into_std()) {
            None | Some(SequenceOutcome::Probation) => return None,
            Some(_) => {}
        }
        if !self.negotiated.receives() {
            return None;
        }

        match depacketizer.depacketize(&packet) {
            Ok(Some(data)) => {
                let timestamp = packet.header.timestamp;
                Some(match self.kind() {
                    MediaKind::Audio => MediaEvent::AudioFrame { data, timestamp },
                    MediaKind::Video => MediaEvent::VideoFrame { data, timestamp },
                })
            }
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, seq = packet.header.sequence_number, "Depacketization failed");
                None
            }
        }
    }

    fn on_rtcp(&self, data: &[u8]) {
        if let Err(e) = self.rtp.lock().on_rtcp(data, Instant::now().into_std()) {
            debug!(error = %e, "Dropping malformed RTCP");
        }
    }
}

/// Receive RTP and RTCP and emit RTCP reports until shut down
pub(crate) fn spawn_receiver(
    stream: Arc<ActiveStream>,
    session: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut depacketizer = depacketizer_for(stream.negotiated.codec);
        let mut rtp_buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut rtcp_buf = vec![0u8; 2048];
        let first_interval = stream.rtp.lock().next_report_interval();
        let mut next_report = Instant::now() + first_interval;
        let mut rtp_errors = ErrorRun::default();
        let mut rtcp_errors = ErrorRun::default();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = stream.rtp_socket.recv_from(&mut rtp_buf) => match received {
                    Ok((len, from)) => {
                        if rtp_errors.recovered() {
                            debug!(kind = %stream.kind(), "RTP receive recovered");
                        }
                        let data = &rtp_buf[..len];
                        // rtcp-mux peers send both on one port
                        if is_rtcp(data) {
                            stream.on_rtcp(data);
                            continue;
                        }
                        trace!(%from, len, "RTP received");
                        if let Some(event) = stream.on_rtp(data, depacketizer.as_mut()) {
                            if events.send(SessionEvent { session, event }).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        if rtp_errors.failed() {
                            warn!(error = %e, "RTP receive failed");
                            let event = MediaEvent::Error {
                                code: LWS_ERR_SOCKET_RECV,
                                message: e.to_string(),
                            };
                            if events.send(SessionEvent { session, event }).is_err() {
                                break;
                            }
                        } else {
                            trace!(error = %e, "RTP receive still failing");
                        }
                        time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                },
                received = stream.rtcp_socket.recv_from(&mut rtcp_buf) => match received {
                    Ok((len, _)) => {
                        rtcp_errors.recovered();
                        stream.on_rtcp(&rtcp_buf[..len]);
                    }
                    Err(e) => {
                        if rtcp_errors.failed() {
                            warn!(error = %e, "RTCP receive failed");
                        }
                        time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                },
                _ = time::sleep_until(next_report) => {
                    stream.send_report().await;
                    let interval = stream.rtp.lock().next_report_interval();
                    next_report = Instant::now() + interval;
                }
            }
        }
        debug!(kind = %stream.kind(), "Media receive task finished");
    })
}
