//! Stub SIP server and recording handler shared by the agent tests.
//!
//! The agent runs over one end of a [`ChannelTransport`] pair; the test
//! plays the server on the other end, reading what the agent sends and
//! answering with hand-built messages.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lws_client_core::prelude::*;
use lws_infra_common::ErrorCode;
use lws_media_core::MediaInfo;
use lws_sip_core::builder::{generate_branch, generate_call_id, SimpleRequestBuilder, SimpleResponseBuilder};
use lws_sip_core::{
    parse_message, HeaderName, Message, Method, NameAddr, Param, Request, Response, SipMessage,
    StatusCode, Via,
};
use lws_sip_transport::{ChannelTransport, Transport, TransportEvent};
use parking_lot::Mutex;
use tokio::time::timeout;

pub const AGENT_ADDR: &str = "127.0.0.1:5070";
pub const SERVER_ADDR: &str = "127.0.0.1:5060";
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub const REALM: &str = "example";
pub const NONCE: &str = "deadbeef";
pub const PASSWORD: &str = "p";

/// To tag the stub server puts on its responses
pub const SERVER_TAG: &str = "srv-1";

/// Largest slice of time one `run_once` gets
pub const STEP: Duration = Duration::from_millis(20);

/// Virtual-time bound on any single wait
pub const PATIENCE: Duration = Duration::from_secs(60);

pub const PCMU_PCMA_OFFER: &str = "v=0\r\n\
o=bob 2890844526 2890844526 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0 8\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=sendrecv\r\n";

pub const PCMU_ANSWER: &str = "v=0\r\n\
o=bob 2890844527 2890844527 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 40002 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=sendrecv\r\n";

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lws_client_core=debug,lws_dialog_core=debug")
        .with_test_writer()
        .try_init();
}

// ---- recording handler ----------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Registration(RegistrationState, u16),
    Call(CallStatusInfo),
    Incoming(IncomingCallInfo),
    Error(ErrorCode),
    Message { from: String, content: String },
    MediaReady(CallHandle, MediaInfo),
    Bye(CallHandle),
    MediaError(CallHandle, ErrorCode),
}

/// Records every callback; answers incoming calls with a fixed action
#[derive(Debug)]
pub struct Recorder {
    action: CallAction,
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn new(action: CallAction) -> Arc<Self> {
        Arc::new(Self {
            action,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn registrations(&self) -> Vec<(RegistrationState, u16)> {
        self.seen
            .lock()
            .iter()
            .filter_map(|seen| match seen {
                Seen::Registration(state, code) => Some((*state, *code)),
                _ => None,
            })
            .collect()
    }

    pub fn registration_state(&self) -> Option<RegistrationState> {
        self.registrations().last().map(|(state, _)| *state)
    }

    pub fn call_states(&self, call: CallHandle) -> Vec<(CallState, Option<u16>)> {
        self.seen
            .lock()
            .iter()
            .filter_map(|seen| match seen {
                Seen::Call(info) if info.call == call => Some((info.state, info.status)),
                _ => None,
            })
            .collect()
    }

    pub fn call_state(&self, call: CallHandle) -> Option<CallState> {
        self.call_states(call).last().map(|(state, _)| *state)
    }

    pub fn incoming(&self) -> Vec<IncomingCallInfo> {
        self.seen
            .lock()
            .iter()
            .filter_map(|seen| match seen {
                Seen::Incoming(info) => Some(info.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn media_ready(&self, call: CallHandle) -> Option<MediaInfo> {
        self.seen.lock().iter().find_map(|seen| match seen {
            Seen::MediaReady(c, info) if *c == call => Some(*info),
            _ => None,
        })
    }

    /// Agent and session error codes, in order
    pub fn errors(&self) -> Vec<ErrorCode> {
        self.seen
            .lock()
            .iter()
            .filter_map(|seen| match seen {
                Seen::Error(code) | Seen::MediaError(_, code) => Some(*code),
                _ => None,
            })
            .collect()
    }

    fn push(&self, seen: Seen) {
        self.seen.lock().push(seen);
    }
}

#[async_trait]
impl AgentHandler for Recorder {
    async fn on_reg_state(&self, state: RegistrationState, code: u16) {
        self.push(Seen::Registration(state, code));
    }

    async fn on_call_state(&self, info: CallStatusInfo) {
        self.push(Seen::Call(info));
    }

    async fn on_incoming_call(&self, call: IncomingCallInfo) -> CallAction {
        self.push(Seen::Incoming(call));
        self.action
    }

    async fn on_error(&self, code: ErrorCode, _description: &str) {
        self.push(Seen::Error(code));
    }

    async fn on_message(&self, from: &str, _to: &str, content: &str) {
        self.push(Seen::Message {
            from: from.to_string(),
            content: content.to_string(),
        });
    }
}

#[async_trait]
impl SessionHandler for Recorder {
    async fn on_media_ready(&self, call: CallHandle, info: MediaInfo) {
        self.push(Seen::MediaReady(call, info));
    }

    async fn on_bye(&self, call: CallHandle) {
        self.push(Seen::Bye(call));
    }

    async fn on_error(&self, call: CallHandle, code: ErrorCode) {
        self.push(Seen::MediaError(call, code));
    }
}

// ---- stub server ------------------------------------------------------------

/// The far end of the agent's transport
pub struct Peer {
    transport: ChannelTransport,
    inbox: VecDeque<Message>,
}

impl Peer {
    pub async fn connected(mut transport: ChannelTransport) -> Self {
        transport.connect().await.unwrap();
        Self {
            transport,
            inbox: VecDeque::new(),
        }
    }

    /// Move whatever has arrived into the inbox
    pub async fn collect(&mut self) {
        for event in self.transport.poll(Duration::ZERO).await.unwrap() {
            if let TransportEvent::Received { data, .. } = event {
                self.inbox
                    .push_back(parse_message(&data).expect("agent sent an unparsable message"));
            }
        }
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    pub async fn send(&mut self, message: impl Into<Message>) {
        let bytes: Bytes = message.into().to_bytes();
        self.transport.send(&bytes).await.unwrap();
    }

    /// Respond to `request`; everything above 100 carries [`SERVER_TAG`]
    pub async fn reply(
        &mut self,
        request: &Request,
        status: StatusCode,
        extra: impl FnOnce(SimpleResponseBuilder) -> SimpleResponseBuilder,
    ) -> Response {
        let mut builder = SimpleResponseBuilder::from_request(request, status, None);
        if status.as_u16() > 100 {
            builder = builder.to_tag(SERVER_TAG);
        }
        let response = extra(builder).build();
        self.send(response.clone()).await;
        response
    }
}

pub async fn reply(peer: &mut Peer, request: &Request, status: StatusCode) -> Response {
    peer.reply(request, status, |builder| builder).await
}

// ---- driving the agent ------------------------------------------------------

/// Drive the agent until the peer has received something
pub async fn next_message(agent: &mut Agent, peer: &mut Peer) -> Message {
    timeout(PATIENCE, async {
        loop {
            peer.collect().await;
            if let Some(message) = peer.pop() {
                return message;
            }
            agent.run_once(STEP).await.unwrap();
        }
    })
    .await
    .expect("agent sent nothing")
}

pub async fn expect_request(agent: &mut Agent, peer: &mut Peer) -> Request {
    match next_message(agent, peer).await {
        Message::Request(request) => request,
        Message::Response(response) => panic!(
            "expected a request, got {} {}",
            response.status.as_u16(),
            response.reason
        ),
    }
}

pub async fn expect_response(agent: &mut Agent, peer: &mut Peer) -> Response {
    match next_message(agent, peer).await {
        Message::Response(response) => response,
        Message::Request(request) => panic!("expected a response, got {}", request.method),
    }
}

/// Drive the agent until `done` holds
pub async fn run_until(agent: &mut Agent, mut done: impl FnMut() -> bool) {
    timeout(PATIENCE, async {
        while !done() {
            agent.run_once(STEP).await.unwrap();
        }
    })
    .await
    .expect("condition never reached");
}

// ---- setups -----------------------------------------------------------------

/// User 1001 with password "p" at the stub server
pub fn server_config() -> AgentConfig {
    let mut config = AgentConfig::new()
        .with_server("127.0.0.1", Some(5060))
        .with_credentials("1001", PASSWORD);
    config.media.local_ip = LOCALHOST;
    config
}

/// An agent without a server, calling peers directly
pub fn direct_config(user: &str) -> AgentConfig {
    let mut config = AgentConfig::new().with_credentials(user, "");
    config.media.local_ip = LOCALHOST;
    config
}

pub async fn agent_with_peer(
    config: AgentConfig,
    action: CallAction,
) -> (Agent, Peer, Arc<Recorder>) {
    init_tracing();
    let (local, remote) = ChannelTransport::pair(addr(AGENT_ADDR), addr(SERVER_ADDR));
    let recorder = Recorder::new(action);
    let agent = Agent::with_transport(
        config,
        Box::new(local),
        recorder.clone(),
        recorder.clone(),
    )
    .await
    .unwrap();
    (agent, Peer::connected(remote).await, recorder)
}

pub fn digest_challenge() -> String {
    format!(r#"Digest realm="{REALM}", nonce="{NONCE}", algorithm=MD5, qop="auth""#)
}

/// Start the agent and walk it through a challenged registration. Returns
/// the unauthenticated REGISTER and the authorized one.
pub async fn register(
    agent: &mut Agent,
    peer: &mut Peer,
    recorder: &Recorder,
    expires: u32,
) -> (Request, Request) {
    agent.start().await.unwrap();

    let first = expect_request(agent, peer).await;
    assert_eq!(first.method, Method::Register);
    peer.reply(&first, StatusCode::Unauthorized, |builder| {
        builder.header(HeaderName::WwwAuthenticate, digest_challenge())
    })
    .await;

    let second = expect_request(agent, peer).await;
    assert_eq!(second.method, Method::Register);
    let binding = second
        .contact()
        .unwrap()
        .expect("REGISTER without Contact")
        .with_param(Param::new("expires", expires.to_string()));
    peer.reply(&second, StatusCode::Ok, |builder| builder.contact(binding))
        .await;

    run_until(agent, || {
        recorder.registration_state() == Some(RegistrationState::Registered)
    })
    .await;
    (first, second)
}

// ---- requests from the far end ---------------------------------------------

fn server_via() -> Via {
    Via::new("UDP", "127.0.0.1", Some(5060), generate_branch())
}

/// A request from sip:1002@example to the agent, outside any dialog
pub fn request_to_agent(method: Method, body: Option<(&str, &str)>) -> Request {
    let mut builder = SimpleRequestBuilder::new(method, "sip:1001@127.0.0.1:5070")
        .unwrap()
        .via(server_via())
        .from(NameAddr::new("sip:1002@example".parse().unwrap()).with_tag("caller-1"))
        .to(NameAddr::new("sip:1001@example".parse().unwrap()))
        .call_id(generate_call_id(Some("127.0.0.1")))
        .cseq(1)
        .contact(NameAddr::new("sip:1002@127.0.0.1:5060".parse().unwrap()));
    if let Some((content_type, body)) = body {
        builder = builder.body(content_type, body.to_string());
    }
    builder.build().unwrap()
}

/// INVITE offering PCMU and PCMA
pub fn invite_to_agent() -> Request {
    request_to_agent(Method::Invite, Some(("application/sdp", PCMU_PCMA_OFFER)))
}

/// Request inside the dialog `invite` and its 2xx `answer` set up
pub fn in_dialog(method: Method, invite: &Request, answer: &Response, cseq: u32) -> Request {
    let target = answer
        .contact()
        .unwrap()
        .expect("2xx without Contact")
        .uri;
    SimpleRequestBuilder::with_uri(method, target)
        .via(server_via())
        .from(invite.from_addr().unwrap())
        .to(answer.to_addr().unwrap())
        .call_id(invite.call_id().unwrap())
        .cseq(cseq)
        .build()
        .unwrap()
}

/// ACK for a non-2xx final response; it shares the INVITE's branch
pub fn ack_for_failure(invite: &Request, response: &Response) -> Request {
    SimpleRequestBuilder::with_uri(Method::Ack, invite.uri.clone())
        .via(invite.top_via().unwrap())
        .from(invite.from_addr().unwrap())
        .to(response.to_addr().unwrap())
        .call_id(invite.call_id().unwrap())
        .cseq(invite.cseq().unwrap().seq)
        .build()
        .unwrap()
}
