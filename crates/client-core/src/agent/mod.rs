//! The SIP user agent
//!
//! [`Agent`] ties the stack together for one account: it owns the transport,
//! the transaction and dialog engine, the registration and every call with its
//! media session. Nothing runs in the background except the media receive
//! tasks; the application drives signaling by calling [`Agent::run_once`]
//! from its own loop, and callbacks are delivered from inside that call.
//!
//! ```text
//!            application
//!                │  call / answer / hangup / run_once
//! ┌──────────────▼───────────────────────────────┐
//! │                    Agent                     │
//! │  ┌──────────────┐ ┌──────────┐ ┌───────────┐ │
//! │  │ Registration │ │  Calls   │ │ MESSAGEs  │ │
//! │  └──────┬───────┘ └────┬─────┘ └─────┬─────┘ │
//! │         └──────────────┼─────────────┘       │
//! │                 ┌──────▼──────┐   ┌────────┐ │
//! │                 │  SipEngine  │   │ Media  │◀┼── RTP/RTCP
//! │                 └──────┬──────┘   └────────┘ │
//! └────────────────────────┼─────────────────────┘
//!                   ┌──────▼──────┐
//!                   │  Transport  │◀── UDP / TCP / TLS / MQTT
//!                   └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use lws_client_core::{Agent, AgentConfig, NoopHandler};
//!
//! # async fn example() -> lws_client_core::Result<()> {
//! let config = AgentConfig::new()
//!     .with_server("sip.example.com", None)
//!     .with_credentials("1001", "secret");
//! let mut agent = Agent::create(config, Arc::new(NoopHandler), Arc::new(NoopHandler)).await?;
//! agent.start().await?;
//!
//! loop {
//!     agent.run_once(Duration::from_millis(100)).await?;
//! #   break;
//! }
//! agent.stop().await?;
//! # Ok(())
//! # }
//! ```

mod call;
mod message;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lws_dialog_core::{
    AuthContext, Credentials, EngineConfig, EngineEvent, SipEngine, TransactionKey, UserTimer,
};
use lws_infra_common::TimerWheel;
use lws_media_core::{IceAgent, IceRole, MediaEvent, MediaSessionStats, SessionEvent};
use lws_sip_core::builder::{generate_call_id, generate_tag};
use lws_sip_core::{parse_message, NameAddr, Param, StreamFramer, Uri};
use lws_sip_transport::{
    MqttTransport, TcpTransport, TlsTransport, Transport, TransportEvent, TransportKind,
    TransportState, UdpTransport,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{AgentConfig, IceConfig, TransportProtocol};
use crate::error::{Error, Result};
use crate::events::{
    AgentHandler, CallHandle, CallState, RegistrationState, SessionHandler,
};
use crate::registration::{Registration, RegistrationOutcome};

use self::call::Call;
use self::message::PendingMessage;

/// How long `stop` waits for BYE, CANCEL and un-REGISTER to complete
const STOP_DRAIN: Duration = Duration::from_secs(5);
const DRAIN_STEP: Duration = Duration::from_millis(50);

/// Builds the ICE agent of a new media session
pub type IceFactory =
    Box<dyn Fn(&IceConfig, IceRole, IpAddr) -> Box<dyn IceAgent> + Send + Sync>;

/// Timers the agent arms on the engine's wheel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentTimer {
    RegistrationRefresh,
    /// Outgoing call still waiting for a final response
    NoAnswer(CallHandle),
}

impl AgentTimer {
    fn id(self) -> UserTimer {
        match self {
            AgentTimer::RegistrationRefresh => UserTimer(0),
            AgentTimer::NoAnswer(call) => UserTimer(call.0),
        }
    }

    /// Call handles start at 1, so 0 is free for the refresh
    fn from_id(id: UserTimer) -> Self {
        match id.0 {
            0 => AgentTimer::RegistrationRefresh,
            n => AgentTimer::NoAnswer(CallHandle(n)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// One SIP account with its calls
pub struct Agent {
    config: AgentConfig,
    handler: Arc<dyn AgentHandler>,
    session_handler: Arc<dyn SessionHandler>,

    transport: Box<dyn Transport>,
    framer: StreamFramer,
    wheel: TimerWheel,
    engine: SipEngine,
    lifecycle: Lifecycle,
    /// A stream transport broke; only `stop` is left
    poisoned: bool,

    server: Option<SocketAddr>,
    local_addr: SocketAddr,
    via_host: String,
    /// Our address-of-record, used in From
    aor: NameAddr,
    contact: NameAddr,
    /// Signaling address offered to media when no media IP is configured
    media_ip: Option<IpAddr>,

    registration: Option<Registration>,
    /// Last registration state reported to the handler
    reported_reg: RegistrationState,
    /// Challenges to INVITE and MESSAGE
    auth: AuthContext,

    calls: HashMap<CallHandle, Call>,
    next_call: u64,
    messages: HashMap<TransactionKey, PendingMessage>,

    media_tx: mpsc::UnboundedSender<SessionEvent>,
    media_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ice_factory: Option<IceFactory>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("lifecycle", &self.lifecycle)
            .field("transport", &self.transport)
            .field("local_addr", &self.local_addr)
            .field("server", &self.server)
            .field("contact", &self.contact.to_string())
            .field("registration", &self.registration_state())
            .field("calls", &self.calls.len())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Validate `config`, resolve the server and open the configured
    /// transport. The agent does nothing on the network until
    /// [`start`](Self::start).
    pub async fn create(
        config: AgentConfig,
        handler: Arc<dyn AgentHandler>,
        session_handler: Arc<dyn SessionHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let server = resolve_server(&config).await?;
        let transport = open_transport(&config, server)?;
        Self::assemble(config, transport, server, handler, session_handler).await
    }

    /// Like [`create`](Self::create) but over a transport supplied by the
    /// caller, e.g. a [`ChannelTransport`](lws_sip_transport::ChannelTransport)
    /// in tests
    pub async fn with_transport(
        config: AgentConfig,
        transport: Box<dyn Transport>,
        handler: Arc<dyn AgentHandler>,
        session_handler: Arc<dyn SessionHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let server = resolve_server(&config).await?;
        Self::assemble(config, transport, server, handler, session_handler).await
    }

    async fn assemble(
        config: AgentConfig,
        mut transport: Box<dyn Transport>,
        server: Option<SocketAddr>,
        handler: Arc<dyn AgentHandler>,
        session_handler: Arc<dyn SessionHandler>,
    ) -> Result<Self> {
        transport.connect().await?;
        let kind = transport.kind();
        let local_addr = transport.local_addr()?;
        let via_host = signaling_host(&config, kind, local_addr, server).await;
        let via_port = match local_addr.port() {
            0 => config.local_port,
            port => port,
        };
        let media_ip = via_host
            .parse::<IpAddr>()
            .ok()
            .filter(|ip| !ip.is_unspecified());

        let domain = config
            .domain()
            .map(str::to_string)
            .unwrap_or_else(|| via_host.clone());
        let mut aor_uri = Uri::sip(domain.clone());
        let mut contact_uri = Uri::sip(via_host.clone()).with_port(via_port);
        if !config.username.is_empty() {
            aor_uri = aor_uri.with_user(config.username.clone());
            contact_uri = contact_uri.with_user(config.username.clone());
        }
        match kind {
            TransportKind::Tcp => contact_uri = contact_uri.with_param(Param::new("transport", "tcp")),
            TransportKind::Tls => contact_uri = contact_uri.with_param(Param::new("transport", "tls")),
            _ => {}
        }
        let mut aor = NameAddr::new(aor_uri);
        if let Some(name) = &config.display_name {
            aor = aor.with_display_name(name.clone());
        }
        let contact = NameAddr::new(contact_uri);

        let credentials = Credentials::new(config.username.clone(), config.password.clone());
        let registration = server.and(config.domain()).map(|domain| {
            let mut registrar = Uri::sip(domain);
            if let Some(port) = config.server_port {
                registrar = registrar.with_port(port);
            }
            Registration::new(
                registrar,
                aor.clone(),
                contact.clone(),
                config.register_expiry,
                credentials.clone(),
                generate_call_id(Some(&via_host)),
                generate_tag(),
            )
        });

        let wheel = TimerWheel::init();
        let engine = SipEngine::new(
            EngineConfig::new(via_host.clone(), via_port, kind)
                .with_timers(config.timers)
                .with_user_agent(config.user_agent.clone()),
            wheel.clone(),
        );
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        info!(
            %local_addr,
            transport = %kind,
            contact = %contact,
            server = ?server,
            "Agent created"
        );
        Ok(Self {
            config,
            handler,
            session_handler,
            transport,
            framer: StreamFramer::new(),
            wheel,
            engine,
            lifecycle: Lifecycle::Created,
            poisoned: false,
            server,
            local_addr,
            via_host,
            aor,
            contact,
            media_ip,
            registration,
            reported_reg: RegistrationState::None,
            auth: AuthContext::new(credentials),
            calls: HashMap::new(),
            next_call: 1,
            messages: HashMap::new(),
            media_tx,
            media_rx,
            ice_factory: None,
        })
    }

    /// Use `factory` instead of the built-in host-candidate agent when ICE is
    /// enabled
    pub fn with_ice_factory(mut self, factory: IceFactory) -> Self {
        self.ice_factory = Some(factory);
        self
    }

    /// Begin operating; registers when a server is configured
    pub async fn start(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Started | Lifecycle::Stopping => return Err(Error::AlreadyStarted),
            Lifecycle::Stopped => return Err(Error::Stopped),
        }
        self.lifecycle = Lifecycle::Started;
        info!(contact = %self.contact, "Agent started");
        if self.registration.is_some() {
            self.send_register(false).await?;
        }
        self.flush().await
    }

    /// Register again now instead of waiting for the refresh
    pub async fn register(&mut self) -> Result<()> {
        self.ensure_started()?;
        if self.registration.is_none() {
            return Err(Error::Config("no server configured".into()));
        }
        self.send_register(false).await?;
        self.flush().await
    }

    /// Process whatever is ready: received messages, expired timers
    /// (registration refresh included) and media events. Waits up to `timeout` when
    /// nothing is ready. Returns how many items were handled; 0 means the
    /// wait timed out.
    pub async fn run_once(&mut self, timeout: Duration) -> Result<usize> {
        self.ensure_started()?;
        self.drive(timeout).await
    }

    /// End every call, remove the registration and release the transport.
    /// Waits up to five seconds for the peers to answer.
    pub async fn stop(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Stopped => return Ok(()),
            Lifecycle::Created => {
                self.shutdown().await;
                return Ok(());
            }
            Lifecycle::Started | Lifecycle::Stopping => {}
        }
        info!(calls = self.calls.len(), "Stopping agent");
        self.lifecycle = Lifecycle::Stopping;

        if !self.poisoned {
            let mut handles: Vec<CallHandle> = self.calls.keys().copied().collect();
            handles.sort();
            for handle in handles {
                if let Err(e) = self.end_call(handle).await {
                    warn!(call = %handle, error = %e, "Cannot end call cleanly");
                }
            }
            let bound = self.registration.as_ref().is_some_and(|r| {
                matches!(
                    r.state(),
                    RegistrationState::Registered | RegistrationState::Registering
                )
            });
            if bound {
                if let Err(e) = self.send_register(true).await {
                    warn!(error = %e, "Cannot send un-REGISTER");
                }
            }
            if let Err(e) = self.flush().await {
                warn!(error = %e, "Flush failed while stopping");
            }
        }

        let deadline = Instant::now() + STOP_DRAIN;
        while !self.poisoned && self.has_pending_work() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    calls = self.calls.len(),
                    "Peers did not answer in time, stopping anyway"
                );
                break;
            }
            if let Err(e) = self.drive(DRAIN_STEP.min(deadline - now)).await {
                warn!(error = %e, "Drain interrupted");
                break;
            }
        }

        let mut leftovers: Vec<CallHandle> = self.calls.keys().copied().collect();
        leftovers.sort();
        for handle in leftovers {
            self.transition(handle, CallState::Terminated, None).await;
        }
        if self.registration.as_mut().is_some_and(Registration::abandon) {
            self.sync_reg_state(0).await;
        }
        self.shutdown().await;
        Ok(())
    }

    // ---- accessors --------------------------------------------------------

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Address the transport is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Contact advertised in REGISTER and dialogs
    pub fn contact(&self) -> &NameAddr {
        &self.contact
    }

    /// `RegistrationState::None` when no server is configured
    pub fn registration_state(&self) -> RegistrationState {
        self.registration
            .as_ref()
            .map(Registration::state)
            .unwrap_or(RegistrationState::None)
    }

    /// Lifetime granted by the registrar
    pub fn registration_expiry(&self) -> Option<u32> {
        self.registration.as_ref().and_then(Registration::granted)
    }

    /// Whether a registration refresh is waiting on the timer wheel
    pub fn refresh_pending(&self) -> bool {
        self.engine
            .user_timer_armed(AgentTimer::RegistrationRefresh.id())
    }

    /// SIP transactions the engine still tracks
    pub fn pending_transactions(&self) -> usize {
        self.engine.active_transactions()
    }

    /// `None` once the call is over
    pub fn call_state(&self, call: CallHandle) -> Option<CallState> {
        self.calls.get(&call).map(|c| c.state)
    }

    /// Calls that are not over yet, oldest first
    pub fn active_calls(&self) -> Vec<CallHandle> {
        let mut handles: Vec<CallHandle> = self.calls.keys().copied().collect();
        handles.sort();
        handles
    }

    /// RTP counters of a call with running media
    pub fn media_stats(&self, call: CallHandle) -> Option<MediaSessionStats> {
        self.calls
            .get(&call)
            .and_then(|c| c.media.as_ref())
            .map(|media| media.stats())
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle == Lifecycle::Started
    }

    // ---- lifecycle helpers --------------------------------------------------

    fn ensure_started(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::TransportClosed);
        }
        match self.lifecycle {
            Lifecycle::Created => Err(Error::NotStarted),
            Lifecycle::Started | Lifecycle::Stopping => Ok(()),
            Lifecycle::Stopped => Err(Error::Stopped),
        }
    }

    /// Requests to the server's domain need an active registration
    fn ensure_registered(&self) -> Result<()> {
        match &self.registration {
            Some(registration) if registration.state() != RegistrationState::Registered => {
                Err(Error::NotRegistered(registration.state()))
            }
            _ => Ok(()),
        }
    }

    fn has_pending_work(&self) -> bool {
        !self.calls.is_empty()
            || self
                .registration
                .as_ref()
                .is_some_and(Registration::is_pending)
    }

    async fn shutdown(&mut self) {
        self.engine.shutdown();
        self.wheel.shutdown().await;
        if let Err(e) = self.transport.disconnect().await {
            debug!(error = %e, "Transport disconnect failed");
        }
        self.messages.clear();
        self.lifecycle = Lifecycle::Stopped;
        info!("Agent stopped");
    }

    fn next_handle(&mut self) -> CallHandle {
        let handle = CallHandle(self.next_call);
        self.next_call += 1;
        handle
    }

    // ---- event loop -------------------------------------------------------

    async fn drive(&mut self, timeout: Duration) -> Result<usize> {
        if self.poisoned {
            return Err(Error::TransportClosed);
        }
        let mut handled = self.engine.handle_expired_timers();
        handled += self.drain_media_events().await;
        handled += self.process_engine().await?;
        if handled > 0 {
            return Ok(handled);
        }

        tokio::select! {
            polled = self.transport.poll(timeout) => {
                handled += self.on_transport_events(polled).await?;
            }
            Some(fired) = self.engine.next_timer() => {
                self.engine.on_timer(fired);
                handled += 1;
            }
            Some(event) = self.media_rx.recv() => {
                self.on_media_event(event).await;
                handled += 1;
            }
        }
        handled += self.process_engine().await?;
        Ok(handled)
    }

    async fn on_transport_events(
        &mut self,
        polled: lws_sip_transport::Result<Vec<TransportEvent>>,
    ) -> Result<usize> {
        let events = match polled {
            Ok(events) => events,
            Err(e) => {
                let e = Error::from(e);
                if self.transport.kind().is_stream() {
                    self.poison(&e).await;
                    return Err(e);
                }
                warn!(error = %e, "Transport receive failed");
                self.report_error(&e).await;
                return Ok(0);
            }
        };

        let mut handled = 0;
        for event in events {
            match event {
                TransportEvent::Received { data, source } => {
                    self.on_bytes(&data, source);
                    handled += 1;
                }
                TransportEvent::StateChanged(state) => {
                    debug!(%state, "Transport state changed");
                    let lost = matches!(state, TransportState::Error | TransportState::Disconnected);
                    if lost && self.transport.kind().is_stream() {
                        self.poison(&Error::TransportClosed).await;
                        return Err(Error::TransportClosed);
                    }
                }
            }
        }
        Ok(handled)
    }

    fn on_bytes(&mut self, data: &[u8], source: SocketAddr) {
        if self.transport.kind().is_stream() {
            self.framer.push(data);
            loop {
                match self.framer.next_message() {
                    Ok(Some(message)) => self.engine.on_message(message, source),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%source, buffered = self.framer.buffered(), error = %e, "Discarding unparseable stream data");
                        self.framer.clear();
                        break;
                    }
                }
            }
            return;
        }

        if data.iter().all(u8::is_ascii_whitespace) {
            trace!(%source, "Keep-alive");
            return;
        }
        match parse_message(data) {
            Ok(message) => self.engine.on_message(message, source),
            Err(e) => warn!(%source, len = data.len(), error = %e, "Dropping malformed message"),
        }
    }

    /// Put queued messages on the wire and hand engine events to their owners
    async fn process_engine(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            self.flush().await?;
            let Some(event) = self.engine.poll_event() else {
                break;
            };
            handled += 1;
            self.on_engine_event(event).await;
        }
        Ok(handled)
    }

    async fn flush(&mut self) -> Result<()> {
        while let Some(outgoing) = self.engine.poll_transmit() {
            if let Err(e) = self
                .transport
                .send_to(&outgoing.data, outgoing.destination)
                .await
            {
                let e = Error::from(e);
                if self.transport.kind().is_stream() {
                    self.poison(&e).await;
                    return Err(e);
                }
                warn!(destination = %outgoing.destination, error = %e, "Send failed");
                self.report_error(&e).await;
            }
        }
        Ok(())
    }

    async fn poison(&mut self, e: &Error) {
        if self.poisoned {
            return;
        }
        self.poisoned = true;
        error!(error = %e, "Transport lost");
        self.report_error(e).await;
    }

    async fn report_error(&self, e: &Error) {
        self.handler.on_error(e.code(), &e.to_string()).await;
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Request {
                key,
                request,
                source,
                dialog,
            } => self.on_request(key, request, source, dialog).await,
            EngineEvent::Response {
                key,
                response,
                dialog,
            } => {
                if self.registration.as_ref().is_some_and(|r| r.matches(&key)) {
                    self.on_register_response(&response).await;
                } else if let Some(handle) = self.call_for_transaction(&key) {
                    self.on_call_response(handle, &key, response, dialog).await;
                } else if self.messages.contains_key(&key) {
                    self.on_message_response(key, response).await;
                } else if let Some(dialog) = dialog.filter(|_| response.status.is_success()) {
                    debug!(%dialog, "2xx for a call that is already over");
                    self.hangup_stray_dialog(&dialog);
                } else {
                    trace!(transaction = %key, "Response for nothing we track");
                }
            }
            EngineEvent::Timeout { key, response } => {
                if self.registration.as_ref().is_some_and(|r| r.matches(&key)) {
                    if let Some(outcome) = self.registration.as_mut().map(Registration::on_timeout) {
                        self.apply_register_outcome(outcome, response.status.as_u16())
                            .await;
                    }
                } else if let Some(handle) = self.call_for_transaction(&key) {
                    self.on_call_timeout(handle, &key).await;
                } else if self.messages.contains_key(&key) {
                    self.on_message_timeout(key).await;
                }
            }
            EngineEvent::Cancelled { invite } => self.on_peer_cancel(&invite).await,
            EngineEvent::Ack { dialog, request } => self.on_ack(&dialog, &request).await,
            EngineEvent::AckTimeout { dialog } => self.on_ack_timeout(&dialog).await,
            EngineEvent::DialogTerminated(id) => trace!(dialog = %id, "Dialog terminated"),
            EngineEvent::TransactionTerminated(key) => {
                trace!(transaction = %key, "Transaction terminated");
            }
            EngineEvent::TimerExpired(id) => self.on_agent_timer(AgentTimer::from_id(id)).await,
        }
    }

    async fn on_agent_timer(&mut self, timer: AgentTimer) {
        match timer {
            AgentTimer::RegistrationRefresh => {
                debug!("Registration refresh due");
                if let Err(e) = self.send_register(false).await {
                    self.report_error(&e).await;
                }
            }
            AgentTimer::NoAnswer(call) => self.on_no_answer(call).await,
        }
    }

    // ---- registration -------------------------------------------------------

    async fn send_register(&mut self, unregister: bool) -> Result<()> {
        let Some(registration) = self.registration.as_mut() else {
            return Ok(());
        };
        registration.begin(unregister);
        self.sync_reg_state(0).await;
        self.transmit_register()
    }

    /// Send the next REGISTER of the current attempt
    fn transmit_register(&mut self) -> Result<()> {
        let via = self.engine.via();
        let (Some(registration), Some(server)) = (self.registration.as_mut(), self.server) else {
            return Ok(());
        };
        let request = registration.build_request(via, &self.config.user_agent)?;
        let key = self.engine.send_request(request, server)?;
        registration.on_sent(key);
        Ok(())
    }

    async fn on_register_response(&mut self, response: &lws_sip_core::Response) {
        let Some(outcome) = self.registration.as_mut().map(|r| r.on_response(response)) else {
            return;
        };
        self.apply_register_outcome(outcome, response.status.as_u16())
            .await;
    }

    async fn apply_register_outcome(&mut self, outcome: RegistrationOutcome, status: u16) {
        match outcome {
            RegistrationOutcome::Pending => return,
            RegistrationOutcome::Retry => {
                if let Err(e) = self.transmit_register() {
                    warn!(error = %e, "Cannot resend REGISTER");
                    self.report_error(&e).await;
                }
            }
            RegistrationOutcome::Registered { expires } => {
                debug!(expires, "Binding refreshed or created");
            }
            RegistrationOutcome::Unregistered { .. } | RegistrationOutcome::Failed { .. } => {}
        }
        self.sync_reg_state(status).await;
    }

    /// Tell the handler when the registration state moved
    async fn sync_reg_state(&mut self, code: u16) {
        self.schedule_refresh();
        let state = self.registration_state();
        if state == self.reported_reg {
            return;
        }
        self.reported_reg = state;
        info!(%state, code, "Registration state changed");
        self.handler.on_reg_state(state, code).await;
    }

    /// Keep the refresh timer in step with the registration
    fn schedule_refresh(&mut self) {
        let id = AgentTimer::RegistrationRefresh.id();
        self.engine.stop_user_timer(id);
        if let Some(at) = self.registration.as_ref().and_then(Registration::refresh_at) {
            let after = at.saturating_duration_since(Instant::now());
            trace!(?after, "Registration refresh scheduled");
            self.engine.start_user_timer(id, after);
        }
    }

    // ---- media ----------------------------------------------------------------

    async fn drain_media_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.media_rx.try_recv() {
            self.on_media_event(event).await;
            handled += 1;
        }
        handled
    }

    async fn on_media_event(&mut self, event: SessionEvent) {
        let call = CallHandle(event.session.0);
        if !self.calls.contains_key(&call) {
            trace!(%call, "Media event for a finished call");
            return;
        }
        match event.event {
            MediaEvent::Ready(info) => {
                if let Some(audio) = &info.audio {
                    if audio.sample_rate != self.config.media.sample_rate {
                        warn!(
                            %call,
                            negotiated = audio.sample_rate,
                            configured = self.config.media.sample_rate,
                            "Negotiated audio rate differs from the configured rate"
                        );
                    }
                }
                self.session_handler.on_media_ready(call, info).await;
            }
            MediaEvent::AudioFrame { data, timestamp } => {
                self.session_handler
                    .on_audio_frame(call, data, timestamp)
                    .await;
            }
            MediaEvent::VideoFrame { data, timestamp } => {
                self.session_handler
                    .on_video_frame(call, data, timestamp)
                    .await;
            }
            MediaEvent::Error { code, message } => {
                warn!(%call, %code, message, "Media error");
                self.session_handler.on_error(call, code).await;
            }
        }
    }

    // ---- addressing -------------------------------------------------------------

    /// Target of a call or MESSAGE. A bare user part is placed in the
    /// server's domain.
    fn target_uri(&self, target: &str) -> Result<Uri> {
        let trimmed = target.trim();
        let text = if trimmed.starts_with("sip:") || trimmed.starts_with("sips:") {
            trimmed.to_string()
        } else {
            match self.config.domain() {
                Some(domain) if !trimmed.contains('@') => format!("sip:{trimmed}@{domain}"),
                _ => format!("sip:{trimmed}"),
            }
        };
        text.parse::<Uri>()
            .map_err(|_| Error::InvalidUri(target.to_string()))
    }

    /// Requests go through the server when there is one, straight to the
    /// target otherwise
    async fn destination_for(&self, target: &Uri) -> Result<SocketAddr> {
        if let Some(server) = self.server {
            return Ok(server);
        }
        if self.transport.kind() == TransportKind::Mqtt {
            return Ok(unspecified(target.port_or_default()));
        }
        resolve(&target.host, target.port_or_default()).await
    }
}

/// Resolve the configured server; `None` without one
async fn resolve_server(config: &AgentConfig) -> Result<Option<SocketAddr>> {
    let Some(host) = config.domain() else {
        return Ok(None);
    };
    if config.transport.protocol == TransportProtocol::Mqtt {
        // The broker routes by topic; the server name is only the domain
        return Ok(Some(unspecified(config.server_port())));
    }
    resolve(host, config.server_port()).await.map(Some)
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = tokio::net::lookup_host((bare, port))
        .await
        .map_err(|source| Error::Resolve {
            host: host.to_string(),
            source,
        })?;
    addrs.next().ok_or_else(|| Error::Resolve {
        host: host.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
    })
}

fn unspecified(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

fn open_transport(config: &AgentConfig, server: Option<SocketAddr>) -> Result<Box<dyn Transport>> {
    let bind = SocketAddr::new(config.local_ip, config.local_port);
    let transport: Box<dyn Transport> = match config.transport.protocol {
        TransportProtocol::Udp => Box::new(UdpTransport::new(
            bind,
            server.unwrap_or_else(|| unspecified(0)),
        )),
        TransportProtocol::Tcp => {
            let server = server
                .ok_or_else(|| Error::Config("TCP and TLS need a server".into()))?;
            if config.transport.enable_tls {
                let tls = &config.transport.tls;
                Box::new(TlsTransport::new(
                    bind,
                    server,
                    lws_sip_transport::TlsConfig {
                        ca_pem: tls.ca_pem.clone(),
                        client_cert_pem: tls.client_cert_pem.clone(),
                        client_key_pem: tls.client_key_pem.clone(),
                        server_name: tls
                            .server_name
                            .clone()
                            .or_else(|| config.server_host.clone()),
                    },
                ))
            } else {
                Box::new(TcpTransport::new(bind, server))
            }
        }
        TransportProtocol::Mqtt => {
            let mqtt = &config.mqtt;
            Box::new(MqttTransport::new(lws_sip_transport::MqttConfig {
                broker_host: mqtt.broker_host.clone(),
                broker_port: mqtt.broker_port,
                client_id: mqtt.client_id.clone(),
                publish_topic: mqtt.publish_topic.clone(),
                subscribe_topic: mqtt.subscribe_topic.clone(),
                keep_alive: Duration::from_secs(mqtt.keep_alive_secs),
            }))
        }
    };
    Ok(transport)
}

/// Host for Via and Contact
async fn signaling_host(
    config: &AgentConfig,
    kind: TransportKind,
    local: SocketAddr,
    server: Option<SocketAddr>,
) -> String {
    if let Some(host) = &config.advertised_host {
        return host.clone();
    }
    if kind == TransportKind::Mqtt {
        return format!("{}.invalid", config.mqtt.client_id);
    }
    if !local.ip().is_unspecified() {
        return local.ip().to_string();
    }
    if let Some(server) = server {
        if let Some(ip) = route_source(server).await {
            return ip.to_string();
        }
    }
    Ipv4Addr::LOCALHOST.to_string()
}

/// Source address the OS picks for packets to `destination`
async fn route_source(destination: SocketAddr) -> Option<IpAddr> {
    let bind = if destination.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(destination).await.ok()?;
    socket
        .local_addr()
        .ok()
        .map(|addr| addr.ip())
        .filter(|ip| !ip.is_unspecified())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopHandler;
    use lws_sip_transport::ChannelTransport;

    fn channel() -> (Box<dyn Transport>, ChannelTransport) {
        let (agent, peer) = ChannelTransport::pair(
            "10.0.0.10:5060".parse().unwrap(),
            "10.0.0.1:5060".parse().unwrap(),
        );
        (Box::new(agent), peer)
    }

    async fn agent(config: AgentConfig) -> Agent {
        let (transport, _peer) = channel();
        Agent::with_transport(config, transport, Arc::new(NoopHandler), Arc::new(NoopHandler))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_contact_and_identity() {
        let agent = agent(
            AgentConfig::new()
                .with_server("10.0.0.1", None)
                .with_credentials("1001", "secret")
                .with_display_name("Alice"),
        )
        .await;
        assert_eq!(agent.contact().to_string(), "<sip:1001@10.0.0.10:5060>");
        assert_eq!(agent.aor.uri.to_string(), "sip:1001@10.0.0.1");
        assert_eq!(agent.registration_state(), RegistrationState::None);
        assert_eq!(agent.server, Some("10.0.0.1:5060".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_operations_need_start() {
        let mut agent = agent(AgentConfig::new()).await;
        let err = agent.run_once(Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, Error::NotStarted));
        assert!(matches!(agent.call("sip:bob@10.0.0.1", false).await, Err(Error::NotStarted)));

        agent.start().await.unwrap();
        assert!(matches!(agent.start().await, Err(Error::AlreadyStarted)));
        agent.stop().await.unwrap();
        assert!(matches!(agent.start().await, Err(Error::Stopped)));
        assert!(matches!(
            agent.run_once(Duration::from_millis(1)).await,
            Err(Error::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_target_uri() {
        let agent = agent(AgentConfig::new().with_server("10.0.0.1", Some(5060))).await;
        assert_eq!(agent.target_uri("1002").unwrap().to_string(), "sip:1002@10.0.0.1");
        assert_eq!(
            agent.target_uri("sip:bob@10.0.0.2:5070").unwrap().to_string(),
            "sip:bob@10.0.0.2:5070"
        );
        assert!(matches!(agent.target_uri("sip:"), Err(Error::InvalidUri(_))));
    }

    #[tokio::test]
    async fn test_unregistered_agent_cannot_call() {
        let mut agent = agent(
            AgentConfig::new()
                .with_server("10.0.0.1", None)
                .with_credentials("1001", "secret"),
        )
        .await;
        agent.start().await.unwrap();
        assert_eq!(agent.registration_state(), RegistrationState::Registering);
        let err = agent.call("1002", false).await.unwrap_err();
        assert!(matches!(err, Error::NotRegistered(RegistrationState::Registering)));
    }
}
