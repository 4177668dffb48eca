//! SDP offer/answer (RFC 3264) over the `lws-sip-core` SDP model
//!
//! The offer lists every configured codec per stream in preference order.
//! The answer keeps the m-line order of the offer, accepts at most one
//! stream per media kind and declines the rest with port 0. The chosen
//! format is the first shared one in the remote description's order.

use std::net::{IpAddr, SocketAddr};

use lws_sip_core::sdp::{
    Attribute, Candidate, Connection, Direction, MediaDescription, Origin, SessionDescription,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{CodecId, MediaKind};
use crate::error::{Error, Result};

/// Transport profile of offered streams
pub const RTP_AVP: &str = "RTP/AVP";

/// Session name used in `s=`
pub const SESSION_NAME: &str = "lws";

/// ICE username fragment and password
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// One stream as this endpoint wants it
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub kind: MediaKind,
    /// Preference order
    pub codecs: Vec<CodecId>,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub direction: Direction,
    /// Gathered ICE candidates for this stream
    pub candidates: Vec<Candidate>,
}

/// Everything needed to describe this endpoint
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub username: String,
    pub session_id: u64,
    pub address: IpAddr,
    pub streams: Vec<LocalStream>,
    pub ice: Option<IceCredentials>,
}

impl LocalMedia {
    fn stream(&self, kind: MediaKind) -> Option<&LocalStream> {
        self.streams.iter().find(|s| s.kind == kind)
    }
}

/// Outcome of offer/answer for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedStream {
    pub kind: MediaKind,
    pub codec: CodecId,
    /// Payload type to send with
    pub payload_type: u8,
    /// Payload type the peer is expected to send with
    pub local_payload_type: u8,
    pub clock_rate: u32,
    pub channels: u8,
    pub remote_rtp: SocketAddr,
    pub remote_rtcp: SocketAddr,
    /// Direction from this endpoint's point of view
    pub direction: Direction,
    pub remote_ice: Option<IceCredentials>,
    pub remote_candidates: Vec<Candidate>,
}

impl NegotiatedStream {
    pub fn sends(&self) -> bool {
        sends(self.direction)
    }

    pub fn receives(&self) -> bool {
        receives(self.direction)
    }
}

fn sends(direction: Direction) -> bool {
    matches!(direction, Direction::SendRecv | Direction::SendOnly)
}

fn receives(direction: Direction) -> bool {
    matches!(direction, Direction::SendRecv | Direction::RecvOnly)
}

fn direction_from(send: bool, recv: bool) -> Direction {
    match (send, recv) {
        (true, true) => Direction::SendRecv,
        (true, false) => Direction::SendOnly,
        (false, true) => Direction::RecvOnly,
        (false, false) => Direction::Inactive,
    }
}

/// Our direction given what we want and what the peer declared
fn answer_direction(local: Direction, remote: Direction) -> Direction {
    let remote = remote.reverse();
    direction_from(
        sends(local) && sends(remote),
        receives(local) && receives(remote),
    )
}

/// Resolve each payload type of a media line to a known codec
fn formats_of(media: &MediaDescription) -> Vec<(CodecId, u8)> {
    media
        .formats
        .iter()
        .filter_map(|&pt| {
            let codec = match media.rtpmap(pt) {
                Some(map) => CodecId::from_encoding(&map.encoding, map.clock_rate),
                None => CodecId::from_static_payload_type(pt),
            }?;
            Some((codec, pt))
        })
        .collect()
}

/// First format of `remote` whose codec is also in `local`
pub fn select_format(local: &[CodecId], remote: &MediaDescription) -> Option<(CodecId, u8)> {
    formats_of(remote)
        .into_iter()
        .find(|(codec, _)| local.contains(codec))
}

fn add_stream_attributes(
    media: &mut MediaDescription,
    stream: &LocalStream,
    ice: Option<&IceCredentials>,
) {
    if stream.rtcp_port != stream.rtp_port.wrapping_add(1) {
        media.add_attribute(Attribute::new("rtcp", stream.rtcp_port.to_string()));
    }
    if let Some(ice) = ice {
        media.add_attribute(Attribute::new("ice-ufrag", ice.ufrag.clone()));
        media.add_attribute(Attribute::new("ice-pwd", ice.pwd.clone()));
        for candidate in &stream.candidates {
            media.add_attribute(Attribute::new("candidate", candidate.to_string()));
        }
    }
}

fn session_skeleton(local: &LocalMedia) -> SessionDescription {
    let address = local.address.to_string();
    let mut sdp = SessionDescription::new(
        Origin::new(local.username.clone(), local.session_id, address.clone()),
        SESSION_NAME,
    );
    sdp.connection = Some(Connection::new(address));
    sdp
}

/// Initial offer with every configured codec
pub fn build_offer(local: &LocalMedia) -> SessionDescription {
    let mut sdp = session_skeleton(local);
    for stream in &local.streams {
        let mut media = MediaDescription::new(stream.kind.as_str(), stream.rtp_port, RTP_AVP);
        for codec in &stream.codecs {
            let pt = codec.default_payload_type();
            media.formats.push(pt);
            media.add_attribute(Attribute::new("rtpmap", codec.rtpmap(pt).to_string()));
        }
        media.set_direction(stream.direction);
        add_stream_attributes(&mut media, stream, local.ice.as_ref());
        sdp.media.push(media);
    }
    sdp
}

/// Remote transport addresses of an accepted media line
fn remote_endpoints(
    sdp: &SessionDescription,
    media: &MediaDescription,
) -> Result<(SocketAddr, SocketAddr)> {
    let address = sdp
        .connection_address(media)
        .ok_or_else(|| Error::Negotiation(format!("no c= line for {} stream", media.media)))?;
    let ip: IpAddr = address
        .parse()
        .map_err(|_| Error::Negotiation(format!("unusable connection address {}", address)))?;
    Ok((
        SocketAddr::new(ip, media.port),
        SocketAddr::new(ip, media.rtcp_port()),
    ))
}

fn negotiated(
    remote_sdp: &SessionDescription,
    remote: &MediaDescription,
    kind: MediaKind,
    codec: CodecId,
    payload_type: u8,
    local_payload_type: u8,
    direction: Direction,
) -> Result<NegotiatedStream> {
    let (remote_rtp, remote_rtcp) = remote_endpoints(remote_sdp, remote)?;
    let channels = remote
        .rtpmap(payload_type)
        .and_then(|m| m.channels)
        .or(codec.channels())
        .unwrap_or(1);
    Ok(NegotiatedStream {
        kind,
        codec,
        payload_type,
        local_payload_type,
        clock_rate: codec.clock_rate(),
        channels,
        remote_rtp,
        remote_rtcp,
        direction,
        remote_ice: remote_sdp
            .ice_credentials(remote)
            .map(|(ufrag, pwd)| IceCredentials { ufrag, pwd }),
        remote_candidates: remote.candidates(),
    })
}

fn declined(offered: &MediaDescription) -> MediaDescription {
    let mut media = MediaDescription::new(offered.media.clone(), 0, offered.protocol.clone());
    media.formats = offered.formats.clone();
    media
}

/// Answer a remote offer. Returns the answer and the accepted streams.
pub fn answer_offer(
    local: &LocalMedia,
    offer: &SessionDescription,
) -> Result<(SessionDescription, Vec<NegotiatedStream>)> {
    offer.validate()?;
    let mut answer = session_skeleton(local);
    let mut streams: Vec<NegotiatedStream> = Vec::new();

    for offered in &offer.media {
        let candidate = MediaKind::from_sdp(&offered.media)
            .filter(|kind| streams.iter().all(|s| s.kind != *kind))
            .and_then(|kind| local.stream(kind))
            .filter(|_| !offered.is_rejected() && offered.protocol.starts_with(RTP_AVP));
        let Some(stream) = candidate else {
            debug!(media = %offered.media, "Declining offered stream");
            answer.media.push(declined(offered));
            continue;
        };
        let Some((codec, pt)) = select_format(&stream.codecs, offered) else {
            debug!(media = %offered.media, formats = ?offered.formats, "No common codec");
            answer.media.push(declined(offered));
            continue;
        };

        let direction = answer_direction(stream.direction, offered.direction());
        let mut media = MediaDescription::new(offered.media.clone(), stream.rtp_port, offered.protocol.clone());
        media.formats.push(pt);
        media.add_attribute(Attribute::new("rtpmap", codec.rtpmap(pt).to_string()));
        if let Some(fmtp) = offered.fmtp(pt) {
            media.add_attribute(Attribute::new("fmtp", format!("{} {}", pt, fmtp)));
        }
        media.set_direction(direction);
        add_stream_attributes(&mut media, stream, local.ice.as_ref());

        streams.push(negotiated(offer, offered, stream.kind, codec, pt, pt, direction)?);
        answer.media.push(media);
    }

    if streams.is_empty() {
        return Err(Error::Negotiation("no acceptable stream in offer".into()));
    }
    Ok((answer, streams))
}

/// Match a remote answer against the offer we sent
pub fn apply_answer(
    offer: &SessionDescription,
    answer: &SessionDescription,
) -> Result<Vec<NegotiatedStream>> {
    answer.validate()?;
    if answer.media.len() != offer.media.len() {
        warn!(
            offered = offer.media.len(),
            answered = answer.media.len(),
            "Answer m-line count differs from offer"
        );
    }

    let mut streams = Vec::new();
    for (ours, theirs) in offer.media.iter().zip(&answer.media) {
        if theirs.is_rejected() || ours.media != theirs.media {
            continue;
        }
        let Some(kind) = MediaKind::from_sdp(&ours.media) else {
            continue;
        };
        let offered = formats_of(ours);
        let codecs: Vec<CodecId> = offered.iter().map(|(c, _)| *c).collect();
        let Some((codec, pt)) = select_format(&codecs, theirs) else {
            return Err(Error::Negotiation(format!(
                "answer selected no offered {} format",
                ours.media
            )));
        };
        let local_pt = offered
            .iter()
            .find(|(c, _)| *c == codec)
            .map(|(_, pt)| *pt)
            .unwrap_or(pt);
        let direction = answer_direction(ours.direction(), theirs.direction());
        streams.push(negotiated(answer, theirs, kind, codec, pt, local_pt, direction)?);
    }

    if streams.is_empty() {
        return Err(Error::Negotiation("answer accepted no stream".into()));
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn local(address: [u8; 4], audio: Vec<CodecId>, video: Vec<CodecId>) -> LocalMedia {
        let mut streams = vec![LocalStream {
            kind: MediaKind::Audio,
            codecs: audio,
            rtp_port: 40000,
            rtcp_port: 40001,
            direction: Direction::SendRecv,
            candidates: Vec::new(),
        }];
        if !video.is_empty() {
            streams.push(LocalStream {
                kind: MediaKind::Video,
                codecs: video,
                rtp_port: 40010,
                rtcp_port: 40020,
                direction: Direction::SendRecv,
                candidates: Vec::new(),
            });
        }
        LocalMedia {
            username: "1001".into(),
            session_id: 42,
            address: IpAddr::V4(Ipv4Addr::from(address)),
            streams,
            ice: None,
        }
    }

    fn reparse(sdp: &SessionDescription) -> SessionDescription {
        sdp.to_sdp_string().parse().unwrap()
    }

    #[test]
    fn test_offer_layout() {
        let offer = build_offer(&local(
            [10, 0, 0, 1],
            vec![CodecId::Pcmu, CodecId::Pcma, CodecId::Opus],
            vec![CodecId::H264],
        ));
        let text = offer.to_sdp_string();
        assert!(text.starts_with("v=0\r\no=1001 42 42 IN IP4 10.0.0.1\r\ns=lws\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\n"));
        assert!(text.contains("m=audio 40000 RTP/AVP 0 8 111\r\n"));
        assert!(text.contains("a=rtpmap:111 opus/48000/2\r\n"));
        assert!(text.contains("m=video 40010 RTP/AVP 96\r\n"));
        assert!(text.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(text.contains("a=rtcp:40020\r\n"));
        assert!(!text.contains("a=rtcp:40001"));
        assert!(text.contains("a=sendrecv\r\n"));
    }

    #[test]
    fn test_answer_selects_first_shared_format() {
        let offer = reparse(&build_offer(&local(
            [10, 0, 0, 1],
            vec![CodecId::Pcmu, CodecId::Pcma],
            vec![],
        )));
        let answerer = local([10, 0, 0, 2], vec![CodecId::Pcma, CodecId::Pcmu], vec![]);
        let (answer, streams) = answer_offer(&answerer, &offer).unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].codec, CodecId::Pcmu);
        assert_eq!(streams[0].payload_type, 0);
        assert_eq!(streams[0].remote_rtp, "10.0.0.1:40000".parse().unwrap());
        assert_eq!(streams[0].remote_rtcp, "10.0.0.1:40001".parse().unwrap());
        assert_eq!(answer.media[0].formats, vec![0]);
    }

    #[test]
    fn test_remote_order_expresses_preference() {
        let offer = reparse(&build_offer(&local(
            [10, 0, 0, 1],
            vec![CodecId::Pcma, CodecId::Pcmu],
            vec![],
        )));
        let answerer = local([10, 0, 0, 2], vec![CodecId::Pcmu, CodecId::Pcma], vec![]);
        let (_, streams) = answer_offer(&answerer, &offer).unwrap();
        assert_eq!(streams[0].codec, CodecId::Pcma);
    }

    #[test]
    fn test_dynamic_payload_type_matched_by_name() {
        let mut offer = build_offer(&local([10, 0, 0, 1], vec![CodecId::Pcmu], vec![]));
        let audio = &mut offer.media[0];
        audio.formats = vec![109, 0];
        audio.attributes.retain(|a| a.name != "rtpmap");
        audio.add_attribute(Attribute::new("rtpmap", "109 OPUS/48000/2"));
        let answerer = local([10, 0, 0, 2], vec![CodecId::Opus, CodecId::Pcmu], vec![]);
        let (answer, streams) = answer_offer(&answerer, &reparse(&offer)).unwrap();
        assert_eq!(streams[0].codec, CodecId::Opus);
        assert_eq!(streams[0].payload_type, 109);
        assert_eq!(streams[0].channels, 2);
        assert_eq!(answer.media[0].rtpmap(109).unwrap().encoding, "opus");
    }

    #[test]
    fn test_unsupported_stream_is_declined() {
        let offer = reparse(&build_offer(&local(
            [10, 0, 0, 1],
            vec![CodecId::Pcmu],
            vec![CodecId::Vp9],
        )));
        let answerer = local([10, 0, 0, 2], vec![CodecId::Pcmu], vec![CodecId::H264]);
        let (answer, streams) = answer_offer(&answerer, &offer).unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(answer.media.len(), 2);
        assert!(answer.media[1].is_rejected());

        let audio_only = local([10, 0, 0, 2], vec![CodecId::G722], vec![]);
        assert!(matches!(
            answer_offer(&audio_only, &offer),
            Err(Error::Negotiation(_))
        ));
    }

    #[test]
    fn test_direction_negotiation() {
        let mut offerer = local([10, 0, 0, 1], vec![CodecId::Pcmu], vec![]);
        offerer.streams[0].direction = Direction::SendOnly;
        let offer = reparse(&build_offer(&offerer));
        let (answer, streams) =
            answer_offer(&local([10, 0, 0, 2], vec![CodecId::Pcmu], vec![]), &offer).unwrap();
        assert_eq!(streams[0].direction, Direction::RecvOnly);
        assert!(!streams[0].sends());

        let applied = apply_answer(&offer, &reparse(&answer)).unwrap();
        assert_eq!(applied[0].direction, Direction::SendOnly);
    }

    #[test]
    fn test_offer_answer_offer_preserves_codecs() {
        let alice = local(
            [10, 0, 0, 1],
            vec![CodecId::Pcmu, CodecId::Pcma, CodecId::Opus],
            vec![CodecId::H264, CodecId::Vp8],
        );
        let bob = local(
            [10, 0, 0, 2],
            vec![CodecId::Pcma, CodecId::Pcmu],
            vec![CodecId::Vp8, CodecId::H264],
        );

        let offer = reparse(&build_offer(&alice));
        let (answer, bob_streams) = answer_offer(&bob, &offer).unwrap();
        let alice_streams = apply_answer(&offer, &reparse(&answer)).unwrap();
        let codecs = |s: &[NegotiatedStream]| s.iter().map(|n| n.codec).collect::<Vec<_>>();
        assert_eq!(codecs(&alice_streams), vec![CodecId::Pcmu, CodecId::H264]);
        assert_eq!(codecs(&alice_streams), codecs(&bob_streams));
        assert_eq!(alice_streams[1].remote_rtcp, "10.0.0.2:40020".parse().unwrap());

        // A second offer from the same side lands on the same set
        let again = reparse(&build_offer(&alice));
        let (answer, _) = answer_offer(&bob, &again).unwrap();
        let second = apply_answer(&again, &reparse(&answer)).unwrap();
        assert_eq!(codecs(&second), codecs(&alice_streams));
    }

    #[test]
    fn test_ice_attributes() {
        let mut alice = local([10, 0, 0, 1], vec![CodecId::Pcmu], vec![]);
        alice.ice = Some(IceCredentials {
            ufrag: "abcd".into(),
            pwd: "0123456789abcdefghijkl".into(),
        });
        alice.streams[0].candidates = vec![Candidate::host("1", 1, "10.0.0.1", 40000)];
        let offer = reparse(&build_offer(&alice));
        let (_, streams) =
            answer_offer(&local([10, 0, 0, 2], vec![CodecId::Pcmu], vec![]), &offer).unwrap();
        let ice = streams[0].remote_ice.as_ref().unwrap();
        assert_eq!(ice.ufrag, "abcd");
        assert_eq!(streams[0].remote_candidates.len(), 1);
        assert_eq!(streams[0].remote_candidates[0].port, 40000);
    }
}
