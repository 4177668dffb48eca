//! Call control
//!
//! Outgoing calls go Calling → (Ringing) → Established → Terminating →
//! Terminated; incoming calls start in Incoming. Failed means the call was
//! never established. A call leaves the table when it reaches Terminated or
//! Failed, and its handle turns into a no-op.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use lws_dialog_core::{DialogId, TransactionKey};
use lws_media_core::{HostIceAgent, IceAgent, MediaSession, SessionId};
use lws_sip_core::builder::{generate_call_id, generate_tag, SimpleRequestBuilder};
use lws_sip_core::sdp::SessionDescription;
use lws_sip_core::{HeaderName, Method, NameAddr, Request, Response, SipMessage, StatusCode, Uri};
use tracing::{debug, info, trace, warn};

use super::{Agent, AgentTimer};
use crate::error::{Error, Result};
use crate::events::{CallAction, CallDirection, CallHandle, CallState, CallStatusInfo, IncomingCallInfo};
use crate::registration::ALLOWED_METHODS;

const SDP: &str = "application/sdp";

/// Signaling and media state of one call
pub(super) struct Call {
    pub(super) state: CallState,
    pub(super) direction: CallDirection,
    /// Remote party URI
    pub(super) peer: String,
    /// Client INVITE for outgoing calls, server INVITE for incoming ones
    pub(super) invite: TransactionKey,
    /// Outgoing INVITE as last sent, for the authenticated retry
    pub(super) request: Option<Request>,
    pub(super) destination: SocketAddr,
    pub(super) dialog: Option<DialogId>,
    pub(super) media: Option<MediaSession>,
    /// Offer carried by an incoming INVITE
    pub(super) remote_offer: Option<SessionDescription>,
    /// Our 200 carried the offer, the answer comes in the ACK
    pub(super) answer_in_ack: bool,
    pub(super) cancel: Option<TransactionKey>,
    pub(super) cancel_requested: bool,
    /// Cancelled because nobody answered in time; ends as 408
    pub(super) no_answer: bool,
    pub(super) bye: Option<TransactionKey>,
    pub(super) auth_retried: bool,
}

impl Call {
    async fn stop_media(&mut self) {
        if let Some(media) = self.media.as_mut() {
            if let Err(e) = media.stop().await {
                warn!(session = %media.id(), error = %e, "Media did not stop cleanly");
            }
        }
    }
}

fn parse_sdp(body: &[u8]) -> Result<SessionDescription> {
    Ok(String::from_utf8_lossy(body).parse::<SessionDescription>()?)
}

/// Same user at the same host
fn same_party(a: &Uri, b: &Uri) -> bool {
    a.user == b.user && a.host.eq_ignore_ascii_case(&b.host)
}

impl Agent {
    // ---- operations -----------------------------------------------------

    /// Call `uri` (`sip:bob@example.com`, or just `bob` in the server's
    /// domain). Video is offered when `video` is set and enabled in the
    /// configuration.
    pub async fn call(&mut self, uri: &str, video: bool) -> Result<CallHandle> {
        self.ensure_started()?;
        self.ensure_registered()?;
        let target = self.target_uri(uri)?;
        let destination = self.destination_for(&target).await?;

        let handle = self.next_handle();
        let mut media = self.new_media(handle, video, true);
        let offer: lws_media_core::Result<SessionDescription> = async {
            media.prepare().await?;
            media.create_offer()
        }
        .await;
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => {
                if let Err(stop) = media.stop().await {
                    debug!(error = %stop, "Media cleanup failed");
                }
                return Err(e.into());
            }
        };

        let mut request = SimpleRequestBuilder::with_uri(Method::Invite, target.clone())
            .via(self.engine.via())
            .from(self.aor.clone().with_tag(generate_tag()))
            .to(NameAddr::new(target.clone()))
            .call_id(generate_call_id(Some(&self.via_host)))
            .cseq(1)
            .contact(self.contact.clone())
            .header(HeaderName::Allow, ALLOWED_METHODS)
            .header(HeaderName::UserAgent, self.config.user_agent.clone())
            .body(SDP, offer.to_sdp_string())
            .build()?;
        self.auth.authorize(&mut request)?;
        let key = self.engine.send_request(request.clone(), destination)?;

        self.engine.start_user_timer(
            AgentTimer::NoAnswer(handle).id(),
            Duration::from_secs(u64::from(self.config.no_answer_timeout)),
        );
        info!(call = %handle, %target, "Calling");
        self.calls.insert(
            handle,
            Call {
                state: CallState::Calling,
                direction: CallDirection::Outgoing,
                peer: target.to_string(),
                invite: key,
                request: Some(request),
                destination,
                dialog: None,
                media: Some(media),
                remote_offer: None,
                answer_in_ack: false,
                cancel: None,
                cancel_requested: false,
                no_answer: false,
                bye: None,
                auth_retried: false,
            },
        );
        self.notify_new(handle).await;
        self.flush().await?;
        Ok(handle)
    }

    /// Answer the ringing call from `peer_uri`
    pub async fn answer(&mut self, peer_uri: &str) -> Result<CallHandle> {
        self.ensure_started()?;
        let handle = self.find_incoming(peer_uri)?;
        self.answer_call(handle).await?;
        Ok(handle)
    }

    /// Refuse the ringing call from `peer_uri` with `status` (486 Busy Here
    /// by default)
    pub async fn reject(&mut self, peer_uri: &str, status: Option<u16>) -> Result<()> {
        self.ensure_started()?;
        let handle = self.find_incoming(peer_uri)?;
        let status = StatusCode::from_u16(status.unwrap_or(486))?;
        if status.as_u16() < 300 {
            return Err(Error::InvalidStatus(status.as_u16()));
        }
        self.reject_call(handle, status).await;
        self.flush().await
    }

    /// End a call in whatever way fits its state: BYE once established,
    /// CANCEL while ringing out, 603 Decline while ringing in. Does nothing
    /// for a call that is already over.
    pub async fn hangup(&mut self, call: CallHandle) -> Result<()> {
        self.ensure_started()?;
        let Some(state) = self.calls.get(&call).map(|c| c.state) else {
            debug!(%call, "Hangup of a finished call");
            return Ok(());
        };
        match state {
            CallState::Established => self.hangup_established(call).await?,
            CallState::Calling | CallState::Ringing => return self.cancel(call).await,
            CallState::Incoming => self.reject_call(call, StatusCode::Decline).await,
            CallState::Terminating | CallState::Terminated | CallState::Failed => {}
        }
        self.flush().await
    }

    /// Cancel an outgoing call that has not been answered. After the final
    /// response only [`hangup`](Self::hangup) applies.
    pub async fn cancel(&mut self, call: CallHandle) -> Result<()> {
        self.ensure_started()?;
        let Some(entry) = self.calls.get_mut(&call) else {
            debug!(%call, "Cancel of a finished call");
            return Ok(());
        };
        if entry.cancel_requested {
            return Ok(());
        }
        let cancellable = entry.direction == CallDirection::Outgoing
            && matches!(entry.state, CallState::Calling | CallState::Ringing);
        if !cancellable {
            return Err(Error::CancelRejected {
                call,
                state: entry.state,
            });
        }
        match self.engine.cancel(&entry.invite) {
            Ok(key) => {
                entry.cancel = Some(key);
                entry.cancel_requested = true;
            }
            Err(lws_dialog_core::Error::CancelRejected { .. }) => {
                return Err(Error::CancelRejected {
                    call,
                    state: entry.state,
                });
            }
            Err(e) => return Err(e.into()),
        }
        info!(%call, "Cancelling");
        entry.stop_media().await;
        self.flush().await
    }

    /// Send one audio frame on an established call; `timestamp_ms` is the
    /// frame's media time
    pub async fn send_audio(&self, call: CallHandle, frame: &[u8], timestamp_ms: u32) -> Result<()> {
        self.established_media(call)?
            .send_audio(frame, timestamp_ms)
            .await?;
        Ok(())
    }

    /// Send one encoded video frame on an established call
    pub async fn send_video(&self, call: CallHandle, frame: &[u8], timestamp_ms: u32) -> Result<()> {
        self.established_media(call)?
            .send_video(frame, timestamp_ms)
            .await?;
        Ok(())
    }

    fn established_media(&self, call: CallHandle) -> Result<&MediaSession> {
        let entry = self
            .calls
            .get(&call)
            .ok_or_else(|| Error::NoCall(call.to_string()))?;
        let invalid = Error::InvalidCallState {
            call,
            state: entry.state,
            reason: "media flows only on established calls",
        };
        if entry.state != CallState::Established {
            return Err(invalid);
        }
        entry.media.as_ref().ok_or(invalid)
    }

    // ---- internals shared by the operations ---------------------------------

    fn new_media(&self, call: CallHandle, video: bool, outgoing: bool) -> MediaSession {
        let signal_ip = self
            .config
            .media
            .local_ip
            .is_unspecified()
            .then_some(self.media_ip)
            .flatten();
        let config = self.config.session_config(video, signal_ip);
        let mut session = MediaSession::new(SessionId(call.0), config, self.media_tx.clone())
            .with_timer_wheel(self.wheel.clone());
        if self.config.ice.enable_ice {
            let role = self.config.ice.role(outgoing);
            let ip = session.config().sdp_address();
            let agent: Box<dyn IceAgent> = match &self.ice_factory {
                Some(factory) => factory(&self.config.ice, role, ip),
                None => Box::new(HostIceAgent::new(role, ip)),
            };
            session = session.with_ice(agent);
        }
        session
    }

    /// Oldest ringing incoming call from `peer_uri`
    fn find_incoming(&self, peer_uri: &str) -> Result<CallHandle> {
        let wanted = self.target_uri(peer_uri)?;
        self.calls
            .iter()
            .filter(|(_, call)| {
                call.direction == CallDirection::Incoming && call.state == CallState::Incoming
            })
            .filter(|(_, call)| {
                call.peer
                    .parse::<Uri>()
                    .map(|peer| same_party(&peer, &wanted))
                    .unwrap_or(false)
            })
            .map(|(handle, _)| *handle)
            .min()
            .ok_or_else(|| Error::NoCall(peer_uri.to_string()))
    }

    pub(super) fn call_for_transaction(&self, key: &TransactionKey) -> Option<CallHandle> {
        self.calls
            .iter()
            .find(|(_, call)| {
                &call.invite == key || call.bye.as_ref() == Some(key) || call.cancel.as_ref() == Some(key)
            })
            .map(|(handle, _)| *handle)
    }

    fn call_for_dialog(&self, id: &DialogId) -> Option<CallHandle> {
        self.calls
            .iter()
            .find(|(_, call)| call.dialog.as_ref() == Some(id))
            .map(|(handle, _)| *handle)
    }

    async fn notify_new(&self, call: CallHandle) {
        let Some(entry) = self.calls.get(&call) else {
            return;
        };
        let info = CallStatusInfo {
            call,
            peer: entry.peer.clone(),
            direction: entry.direction,
            state: entry.state,
            previous: None,
            status: None,
        };
        self.handler.on_call_state(info).await;
    }

    /// Move a call to `state` and report it. A final state stops media and
    /// forgets the call.
    pub(super) async fn transition(&mut self, call: CallHandle, state: CallState, status: Option<u16>) {
        let Some(entry) = self.calls.get_mut(&call) else {
            return;
        };
        if entry.state == state {
            return;
        }
        let previous = entry.state;
        entry.state = state;
        let info = CallStatusInfo {
            call,
            peer: entry.peer.clone(),
            direction: entry.direction,
            state,
            previous: Some(previous),
            status,
        };
        if !matches!(state, CallState::Calling | CallState::Ringing) {
            self.engine.stop_user_timer(AgentTimer::NoAnswer(call).id());
        }
        if state.is_final() {
            if let Some(mut entry) = self.calls.remove(&call) {
                entry.stop_media().await;
                if let Some(dialog) = &entry.dialog {
                    self.engine.terminate_dialog(dialog);
                }
            }
        }
        info!(%call, %previous, %state, status = ?status, "Call state changed");
        self.handler.on_call_state(info).await;
    }

    async fn start_media(&mut self, call: CallHandle) -> Result<()> {
        if let Some(media) = self.calls.get_mut(&call).and_then(|c| c.media.as_mut()) {
            media.start().await?;
        }
        Ok(())
    }

    /// BYE on the call's dialog; the dialog ends right away
    fn send_bye(&mut self, call: CallHandle) -> Result<()> {
        let Some(entry) = self.calls.get_mut(&call) else {
            return Ok(());
        };
        let Some(dialog) = entry.dialog.clone() else {
            return Ok(());
        };
        let request = self.engine.build_in_dialog_request(&dialog, Method::Bye)?;
        entry.bye = Some(self.engine.send_in_dialog(&dialog, request)?);
        debug!(%call, %dialog, "BYE sent");
        Ok(())
    }

    async fn hangup_established(&mut self, call: CallHandle) -> Result<()> {
        self.send_bye(call)?;
        if let Some(entry) = self.calls.get_mut(&call) {
            entry.stop_media().await;
        }
        self.transition(call, CallState::Terminating, None).await;
        Ok(())
    }

    /// Media or SDP trouble on a call that has a dialog: hang up and report
    /// the call as failed
    async fn abort_call(&mut self, call: CallHandle, error: Error, status: Option<u16>) {
        warn!(%call, error = %error, "Dropping call");
        if let Err(e) = self.send_bye(call) {
            debug!(%call, error = %e, "No BYE for aborted call");
        }
        self.session_handler.on_error(call, error.code()).await;
        self.report_error(&error).await;
        self.transition(call, CallState::Failed, status).await;
    }

    async fn answer_call(&mut self, call: CallHandle) -> Result<()> {
        let entry = self
            .calls
            .get(&call)
            .ok_or_else(|| Error::NoCall(call.to_string()))?;
        if entry.state != CallState::Incoming {
            return Err(Error::InvalidCallState {
                call,
                state: entry.state,
                reason: "only ringing incoming calls can be answered",
            });
        }
        let key = entry.invite.clone();
        let offer = entry.remote_offer.clone();

        let mut media = self.new_media(call, true, false);
        let local: lws_media_core::Result<SessionDescription> = async {
            media.prepare().await?;
            match &offer {
                Some(offer) => media.accept_offer(offer),
                None => media.create_offer(),
            }
        }
        .await;
        let local = match local {
            Ok(local) => local,
            Err(e) => {
                warn!(%call, error = %e, "Cannot answer the offer");
                if let Err(stop) = media.stop().await {
                    debug!(error = %stop, "Media cleanup failed");
                }
                self.respond(&key, StatusCode::NotAcceptableHere);
                self.transition(call, CallState::Failed, Some(488)).await;
                self.flush().await?;
                return Err(e.into());
            }
        };

        let mut response = self.engine.make_response(&key, StatusCode::Ok, None)?;
        response
            .headers
            .set(HeaderName::Contact, self.contact.to_string());
        response.headers.push(HeaderName::Allow, ALLOWED_METHODS);
        response.headers.set(HeaderName::ContentType, SDP);
        response.body = Bytes::from(local.to_sdp_string());
        let dialog = dialog_for_answer(&response)?;
        self.engine.send_response(&key, response)?;

        if let Some(entry) = self.calls.get_mut(&call) {
            entry.dialog = Some(dialog);
            entry.media = Some(media);
            entry.answer_in_ack = offer.is_none();
        }
        if offer.is_some() {
            if let Err(e) = self.start_media(call).await {
                self.abort_call(call, e, None).await;
                self.flush().await?;
                return Ok(());
            }
        }
        self.transition(call, CallState::Established, Some(200)).await;
        self.flush().await
    }

    pub(super) async fn reject_call(&mut self, call: CallHandle, status: StatusCode) {
        let Some(key) = self.calls.get(&call).map(|c| c.invite.clone()) else {
            return;
        };
        info!(%call, status = status.as_u16(), "Rejecting call");
        self.respond(&key, status);
        self.transition(call, CallState::Terminated, Some(status.as_u16()))
            .await;
    }

    /// Used by `stop`: end a call without waiting for the application
    pub(super) async fn end_call(&mut self, call: CallHandle) -> Result<()> {
        let Some(state) = self.calls.get(&call).map(|c| c.state) else {
            return Ok(());
        };
        match state {
            CallState::Established => self.hangup_established(call).await,
            CallState::Calling | CallState::Ringing => match self.cancel(call).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.transition(call, CallState::Terminated, None).await;
                    Err(e)
                }
            },
            CallState::Incoming => {
                self.reject_call(call, StatusCode::TemporarilyUnavailable)
                    .await;
                Ok(())
            }
            CallState::Terminating | CallState::Terminated | CallState::Failed => Ok(()),
        }
    }

    // ---- incoming requests ----------------------------------------------

    pub(super) async fn on_incoming_invite(
        &mut self,
        key: TransactionKey,
        request: Request,
        source: SocketAddr,
    ) {
        if self.lifecycle != super::Lifecycle::Started {
            self.respond(&key, StatusCode::TemporarilyUnavailable);
            return;
        }
        let from = match request.from_addr() {
            Ok(from) => from,
            Err(e) => {
                warn!(%source, error = %e, "INVITE without usable From");
                self.respond(&key, StatusCode::BadRequest);
                return;
            }
        };
        let offer = if request.body.is_empty() {
            None
        } else {
            match parse_sdp(&request.body) {
                Ok(offer) => Some(offer),
                Err(e) => {
                    warn!(%source, error = %e, "INVITE with unreadable SDP");
                    self.respond(&key, StatusCode::NotAcceptableHere);
                    return;
                }
            }
        };

        let call = self.next_handle();
        let peer = from.uri.to_string();
        info!(%call, from = %peer, %source, "Incoming call");
        self.calls.insert(
            call,
            Call {
                state: CallState::Incoming,
                direction: CallDirection::Incoming,
                peer: peer.clone(),
                invite: key.clone(),
                request: None,
                destination: source,
                dialog: None,
                media: None,
                remote_offer: offer,
                answer_in_ack: false,
                cancel: None,
                cancel_requested: false,
                no_answer: false,
                bye: None,
                auth_retried: false,
            },
        );

        let ringing = self
            .engine
            .make_response(&key, StatusCode::Ringing, None)
            .and_then(|mut response| {
                response
                    .headers
                    .set(HeaderName::Contact, self.contact.to_string());
                self.engine.send_response(&key, response)
            });
        if let Err(e) = ringing {
            warn!(%call, error = %e, "Cannot send 180");
        }
        self.notify_new(call).await;

        let info = IncomingCallInfo {
            call,
            from: peer,
            to: request
                .to_addr()
                .map(|to| to.uri.to_string())
                .unwrap_or_default(),
            display_name: from.display_name.clone(),
            sdp: (!request.body.is_empty())
                .then(|| String::from_utf8_lossy(&request.body).into_owned()),
        };
        match self.handler.on_incoming_call(info).await {
            CallAction::Accept => {
                if let Err(e) = self.answer_call(call).await {
                    warn!(%call, error = %e, "Automatic answer failed");
                }
            }
            CallAction::Reject => self.reject_call(call, StatusCode::BusyHere).await,
            CallAction::Ignore => trace!(%call, "Left ringing for the application"),
        }
    }

    pub(super) async fn on_peer_bye(&mut self, key: TransactionKey, dialog: &DialogId) {
        self.respond(&key, StatusCode::Ok);
        let Some(call) = self.call_for_dialog(dialog) else {
            debug!(%dialog, "BYE for a dialog without call");
            return;
        };
        info!(%call, "Peer hung up");
        if let Some(entry) = self.calls.get_mut(&call) {
            entry.stop_media().await;
        }
        self.session_handler.on_bye(call).await;
        self.transition(call, CallState::Terminated, None).await;
    }

    pub(super) async fn on_peer_cancel(&mut self, invite: &TransactionKey) {
        let Some(call) = self.call_for_transaction(invite) else {
            debug!(transaction = %invite, "CANCEL for an unknown call");
            return;
        };
        info!(%call, "Caller cancelled");
        self.transition(call, CallState::Terminated, Some(487)).await;
    }

    pub(super) async fn on_ack(&mut self, dialog: &DialogId, ack: &Request) {
        let Some(call) = self.call_for_dialog(dialog) else {
            trace!(%dialog, "ACK for a dialog without call");
            return;
        };
        let Some(entry) = self.calls.get_mut(&call) else {
            return;
        };
        if !entry.answer_in_ack {
            return;
        }
        entry.answer_in_ack = false;
        let applied = match (parse_sdp(&ack.body), entry.media.as_mut()) {
            (Ok(answer), Some(media)) if !ack.body.is_empty() => media.apply_answer(&answer).map_err(Error::from),
            (Err(e), _) => Err(e),
            _ => Err(Error::InvalidCallState {
                call,
                state: entry.state,
                reason: "ACK carried no answer",
            }),
        };
        let started = match applied {
            Ok(()) => self.start_media(call).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            self.abort_call(call, e, None).await;
        }
    }

    pub(super) async fn on_ack_timeout(&mut self, dialog: &DialogId) {
        let Some(call) = self.call_for_dialog(dialog) else {
            return;
        };
        warn!(%call, "2xx never acknowledged, hanging up");
        if let Err(e) = self.send_bye(call) {
            debug!(%call, error = %e, "No BYE after missing ACK");
        }
        self.transition(call, CallState::Terminating, None).await;
    }

    // ---- responses ------------------------------------------------------

    pub(super) async fn on_call_response(
        &mut self,
        call: CallHandle,
        key: &TransactionKey,
        response: Response,
        dialog: Option<DialogId>,
    ) {
        let Some(entry) = self.calls.get(&call) else {
            return;
        };
        let status = response.status.as_u16();
        if entry.bye.as_ref() == Some(key) {
            if response.status.is_final() {
                self.transition(call, CallState::Terminated, Some(status)).await;
            }
            return;
        }
        if entry.cancel.as_ref() == Some(key) {
            debug!(%call, status, "CANCEL answered");
            return;
        }
        if &entry.invite != key {
            return;
        }

        let cancelled = entry.cancel_requested;
        let no_answer = entry.no_answer;
        match status {
            100 => {}
            101..=199 => {
                if !cancelled && entry.state == CallState::Calling {
                    self.transition(call, CallState::Ringing, Some(status)).await;
                }
            }
            200..=299 => self.on_invite_accepted(call, response, dialog).await,
            401 | 407 if !cancelled => {
                if let Err(e) = self.retry_invite(call, &response) {
                    debug!(%call, error = %e, "No authenticated retry");
                    self.transition(call, CallState::Failed, Some(status)).await;
                }
            }
            _ if no_answer => self.transition(call, CallState::Failed, Some(408)).await,
            _ => {
                let state = if cancelled {
                    CallState::Terminated
                } else {
                    CallState::Failed
                };
                self.transition(call, state, Some(status)).await;
            }
        }
    }

    async fn on_invite_accepted(&mut self, call: CallHandle, response: Response, dialog: Option<DialogId>) {
        let status = response.status.as_u16();
        let Some(entry) = self.calls.get_mut(&call) else {
            return;
        };
        if let Some(current) = entry.dialog.clone() {
            match dialog {
                Some(fork) if fork != current => {
                    info!(%call, dialog = %fork, "Another fork answered, hanging it up");
                    self.hangup_stray_dialog(&fork);
                }
                _ => trace!(%call, "2xx retransmission"),
            }
            return;
        }
        let Some(dialog) = dialog else {
            warn!(%call, "2xx without a usable dialog");
            self.transition(call, CallState::Failed, Some(status)).await;
            return;
        };
        entry.dialog = Some(dialog);

        if entry.cancel_requested {
            // CANCEL lost the race with the 2xx
            info!(%call, "Answered after cancel, hanging up");
            if let Err(e) = self.send_bye(call) {
                warn!(%call, error = %e, "Cannot hang up answered call");
                self.transition(call, CallState::Terminated, Some(status)).await;
            }
            return;
        }

        let applied = match (parse_sdp(&response.body), entry.media.as_mut()) {
            (Ok(answer), Some(media)) => media.apply_answer(&answer).map_err(Error::from),
            (Err(e), _) => Err(e),
            (Ok(_), None) => Ok(()),
        };
        let started = match applied {
            Ok(()) => self.start_media(call).await,
            Err(e) => Err(e),
        };
        match started {
            Ok(()) => self.transition(call, CallState::Established, Some(status)).await,
            Err(e) => self.abort_call(call, e, Some(status)).await,
        }
    }

    /// BYE on a dialog no call owns; nothing waits for the answer
    pub(super) fn hangup_stray_dialog(&mut self, dialog: &DialogId) {
        let sent = self
            .engine
            .build_in_dialog_request(dialog, Method::Bye)
            .and_then(|bye| self.engine.send_in_dialog(dialog, bye));
        if let Err(e) = sent {
            warn!(%dialog, error = %e, "Cannot hang up stray dialog");
            self.engine.terminate_dialog(dialog);
        }
    }

    /// Nobody answered in time: cancel and report the call as timed out
    pub(super) async fn on_no_answer(&mut self, call: CallHandle) {
        let Some(entry) = self.calls.get_mut(&call) else {
            return;
        };
        let ringing = entry.direction == CallDirection::Outgoing
            && matches!(entry.state, CallState::Calling | CallState::Ringing);
        if !ringing || entry.cancel_requested {
            return;
        }
        warn!(%call, after = self.config.no_answer_timeout, "No answer, cancelling");
        entry.no_answer = true;
        match self.cancel(call).await {
            Ok(()) => {}
            // Nothing provisional yet; Timer B ends the INVITE
            Err(Error::CancelRejected { .. }) => debug!(%call, "Nothing to cancel yet"),
            Err(e) => {
                warn!(%call, error = %e, "Cannot cancel unanswered call");
                self.transition(call, CallState::Failed, Some(408)).await;
            }
        }
    }

    /// INVITE again with credentials for the challenge in `response`
    fn retry_invite(&mut self, call: CallHandle, response: &Response) -> Result<()> {
        let via = self.engine.via();
        let Some(entry) = self.calls.get_mut(&call) else {
            return Ok(());
        };
        if !self.auth.on_challenge(response, entry.auth_retried)? {
            return Err(Error::Dialog(lws_dialog_core::Error::Auth(
                "credentials rejected".into(),
            )));
        }
        let Some(mut request) = entry.request.clone() else {
            return Err(Error::NoCall(call.to_string()));
        };
        let cseq = request.cseq()?;
        request.headers.set(HeaderName::Via, via.to_string());
        request
            .headers
            .set(HeaderName::CSeq, format!("{} {}", cseq.seq + 1, Method::Invite));
        self.auth.authorize(&mut request)?;
        let key = self.engine.send_request(request.clone(), entry.destination)?;
        debug!(%call, transaction = %key, "INVITE resent with credentials");
        entry.invite = key;
        entry.request = Some(request);
        entry.auth_retried = true;
        Ok(())
    }

    pub(super) async fn on_call_timeout(&mut self, call: CallHandle, key: &TransactionKey) {
        let Some(entry) = self.calls.get(&call) else {
            return;
        };
        if entry.bye.as_ref() == Some(key) {
            self.transition(call, CallState::Terminated, Some(408)).await;
        } else if &entry.invite == key {
            let state = if entry.cancel_requested && !entry.no_answer {
                CallState::Terminated
            } else {
                CallState::Failed
            };
            self.transition(call, state, Some(408)).await;
        }
    }
}

/// Dialog created by sending `response` to an incoming INVITE
fn dialog_for_answer(response: &Response) -> Result<DialogId> {
    let local = response.to_addr()?;
    let remote = response.from_addr()?;
    Ok(DialogId::new(
        response.call_id()?,
        local.tag().unwrap_or_default(),
        remote.tag().unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_party_ignores_port_and_params() {
        let a: Uri = "sip:bob@Example.com:5070;transport=tcp".parse().unwrap();
        let b: Uri = "sip:bob@example.com".parse().unwrap();
        let c: Uri = "sip:carol@example.com".parse().unwrap();
        assert!(same_party(&a, &b));
        assert!(!same_party(&b, &c));
    }

    #[test]
    fn test_dialog_for_answer_uses_tags() {
        let response = lws_sip_core::builder::SimpleResponseBuilder::new(StatusCode::Ok, None)
            .header(HeaderName::From, "<sip:alice@example.com>;tag=remote")
            .header(HeaderName::To, "<sip:bob@example.com>;tag=local")
            .header(HeaderName::CallId, "abc@host")
            .build();
        let id = dialog_for_answer(&response).unwrap();
        assert_eq!(id, DialogId::new("abc@host", "local", "remote"));
    }
}
