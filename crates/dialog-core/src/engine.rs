//! The SIP engine: transactions, dialogs and timers behind one API
//!
//! [`SipEngine`] is sans-IO. Incoming messages go in through
//! [`SipEngine::on_message`], expirations through [`SipEngine::on_timer`];
//! bytes to send come out of [`SipEngine::poll_transmit`] and notifications
//! for the transaction user out of [`SipEngine::poll_event`].
//!
//! Timers are armed on the shared [`TimerWheel`]. A firing timer posts a
//! [`TimerFired`] on an internal channel which the owner drains with
//! [`SipEngine::next_timer`] or [`SipEngine::handle_expired_timers`], so
//! every state change happens on the owner's task. The transaction user
//! arms its own timers the same way with [`SipEngine::start_user_timer`] and
//! gets them back as [`EngineEvent::TimerExpired`].
//!
//! Beyond the four transaction machines the engine does what RFC 3261 puts
//! in the UA core:
//!
//! - answers every new INVITE with 100 Trying
//! - ACKs 2xx responses to INVITE and resends the ACK for 2xx retransmissions
//! - retransmits its own 2xx to INVITE until the ACK arrives
//! - answers CANCEL (200, then 487 to the INVITE) or 481 when nothing matches
//! - answers 481 to requests for unknown dialogs

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use lws_infra_common::{TimerHandle, TimerWheel};
use lws_sip_core::builder::{generate_branch, SimpleResponseBuilder};
use lws_sip_core::{
    HeaderName, Message, Method, Param, Request, Response, SipMessage, StatusCode, Via,
};
use lws_sip_transport::TransportKind;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::dialog::{Dialog, DialogId, DialogState, DialogTable};
use crate::error::{Error, Result};
use crate::transaction::{
    Action, ClientTransaction, ServerTransaction, TimerSettings, TimerType, TransactionKey,
    TransactionKind, TransactionState,
};

/// Local identity and timer settings of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Host written into Via sent-by
    pub via_host: String,
    pub via_port: u16,
    /// Transport messages travel on; decides Via token and retransmissions
    pub transport: TransportKind,
    pub timers: TimerSettings,
    /// Value of the Server header on generated responses
    pub user_agent: Option<String>,
}

impl EngineConfig {
    pub fn new(via_host: impl Into<String>, via_port: u16, transport: TransportKind) -> Self {
        Self {
            via_host: via_host.into(),
            via_port,
            transport,
            timers: TimerSettings::default(),
            user_agent: None,
        }
    }

    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Timer owned by the transaction user; the id is the user's to choose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserTimer(pub u64);

/// What a timer belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerTarget {
    Transaction(TransactionKey),
    Dialog(DialogId),
    User(UserTimer),
}

/// Posted by the timer wheel when an engine timer expires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub target: TimerTarget,
    pub timer: TimerType,
    /// Arming sequence number; a mismatch means the timer was re-armed or
    /// stopped after this expiry was posted
    pub seq: u64,
}

/// Bytes to put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// Notifications for the transaction user
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new request, or one inside a known dialog
    Request {
        key: TransactionKey,
        request: Request,
        source: SocketAddr,
        dialog: Option<DialogId>,
    },
    /// A response to one of our requests
    Response {
        key: TransactionKey,
        response: Response,
        dialog: Option<DialogId>,
    },
    /// No final response before Timer B / F; `response` is a local 408
    Timeout {
        key: TransactionKey,
        response: Response,
    },
    /// The peer cancelled a pending INVITE; 487 has been sent
    Cancelled { invite: TransactionKey },
    /// ACK for our 2xx
    Ack { dialog: DialogId, request: Request },
    /// Our 2xx was never acknowledged
    AckTimeout { dialog: DialogId },
    /// A timer armed with [`SipEngine::start_user_timer`] expired
    TimerExpired(UserTimer),
    DialogTerminated(DialogId),
    TransactionTerminated(TransactionKey),
}

#[derive(Debug)]
struct ClientEntry {
    transaction: ClientTransaction,
    destination: SocketAddr,
}

/// A 2xx to INVITE waiting for its ACK
#[derive(Debug)]
struct PendingOk {
    response: Bytes,
    destination: SocketAddr,
    interval: Duration,
}

/// Transaction and dialog layer of a user agent
pub struct SipEngine {
    config: EngineConfig,
    wheel: TimerWheel,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    timers: HashMap<(TimerTarget, TimerType), (TimerHandle, u64)>,
    next_seq: u64,
    clients: HashMap<TransactionKey, ClientEntry>,
    servers: HashMap<TransactionKey, ServerTransaction>,
    dialogs: DialogTable,
    pending_ok: HashMap<DialogId, PendingOk>,
    outbox: VecDeque<Outgoing>,
    events: VecDeque<EngineEvent>,
}

impl std::fmt::Debug for SipEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SipEngine")
            .field("via", &format_args!("{}:{}", self.config.via_host, self.config.via_port))
            .field("transactions", &(self.clients.len() + self.servers.len()))
            .field("dialogs", &self.dialogs.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl SipEngine {
    pub fn new(config: EngineConfig, wheel: TimerWheel) -> Self {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        info!(
            host = %config.via_host,
            port = config.via_port,
            transport = %config.transport,
            "SIP engine created"
        );
        Self {
            config,
            wheel,
            timer_tx,
            timer_rx,
            timers: HashMap::new(),
            next_seq: 0,
            clients: HashMap::new(),
            servers: HashMap::new(),
            dialogs: DialogTable::new(),
            pending_ok: HashMap::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn reliable(&self) -> bool {
        self.config.transport.is_reliable()
    }

    /// Via for a new request: fresh branch, `rport` requested
    pub fn via(&self) -> Via {
        Via::new(
            self.config.transport.via_token(),
            self.config.via_host.clone(),
            Some(self.config.via_port),
            generate_branch(),
        )
        .with_param(Param::flag("rport"))
    }

    // ---- outgoing requests ----------------------------------------------

    /// Start a client transaction for `request` towards `destination`
    pub fn send_request(
        &mut self,
        request: Request,
        destination: SocketAddr,
    ) -> Result<TransactionKey> {
        if request.method == Method::Ack {
            return Err(Error::InvalidInput("ACK is not sent in a transaction".into()));
        }
        let mut transaction =
            ClientTransaction::new(request, self.reliable(), self.config.timers)?;
        let key = transaction.key().clone();
        if self.clients.contains_key(&key) {
            return Err(Error::InvalidInput(format!("transaction {} already exists", key)));
        }
        debug!(transaction = %key, %destination, "Sending request");
        let actions = transaction.start();
        self.clients.insert(
            key.clone(),
            ClientEntry {
                transaction,
                destination,
            },
        );
        self.apply_client(&key, actions);
        Ok(key)
    }

    /// Send CANCEL for a pending INVITE. Only legal while the INVITE is
    /// Calling or Proceeding. An INVITE still without a final response
    /// 64·T1 later ends with [`EngineEvent::Timeout`].
    pub fn cancel(&mut self, invite: &TransactionKey) -> Result<TransactionKey> {
        let entry = self
            .clients
            .get_mut(invite)
            .ok_or_else(|| Error::TransactionNotFound(invite.clone()))?;
        if !entry.transaction.is_cancellable() {
            return Err(Error::CancelRejected {
                key: invite.clone(),
                state: entry.transaction.state(),
            });
        }
        let cancel = entry.transaction.cancel_request();
        let destination = entry.destination;
        let actions = entry.transaction.on_cancel_sent();
        info!(transaction = %invite, "Cancelling INVITE");
        self.apply_client(invite, actions);
        self.send_request(cancel, destination)
    }

    /// New request inside a dialog, with the next local CSeq
    pub fn build_in_dialog_request(&mut self, id: &DialogId, method: Method) -> Result<Request> {
        let via = self.via();
        let dialog = self
            .dialogs
            .get_mut(id)
            .ok_or_else(|| Error::DialogNotFound(id.clone()))?;
        dialog.build_request(method, via)
    }

    /// Send an in-dialog request to the dialog's peer. A BYE ends the dialog
    /// right away.
    pub fn send_in_dialog(&mut self, id: &DialogId, request: Request) -> Result<TransactionKey> {
        let destination = self
            .dialogs
            .get(id)
            .map(|d| d.peer)
            .ok_or_else(|| Error::DialogNotFound(id.clone()))?;
        let is_bye = request.method == Method::Bye;
        let key = self.send_request(request, destination)?;
        if is_bye {
            self.terminate_dialog(id);
        }
        Ok(key)
    }

    /// Drop a dialog and anything still pending on it
    pub fn terminate_dialog(&mut self, id: &DialogId) {
        self.pending_ok.remove(id);
        let target = TimerTarget::Dialog(id.clone());
        self.disarm(&target, TimerType::OkRetransmit);
        self.disarm(&target, TimerType::OkTimeout);
        if let Some(mut dialog) = self.dialogs.remove(id) {
            dialog.terminate();
            self.events.push_back(EngineEvent::DialogTerminated(id.clone()));
        }
    }

    // ---- outgoing responses ---------------------------------------------

    /// Response to the request of a server transaction, with the
    /// transaction's To tag on anything but 100
    pub fn make_response(
        &self,
        key: &TransactionKey,
        status: StatusCode,
        reason: Option<&str>,
    ) -> Result<Response> {
        let transaction = self
            .servers
            .get(key)
            .ok_or_else(|| Error::TransactionNotFound(key.clone()))?;
        let mut builder = SimpleResponseBuilder::from_request(transaction.request(), status, reason);
        if status != StatusCode::Trying {
            builder = builder.to_tag(transaction.local_tag());
        }
        if let Some(server) = &self.config.user_agent {
            builder = builder.header(HeaderName::Server, server.clone());
        }
        Ok(builder.build())
    }

    /// Send a response through its server transaction
    pub fn send_response(&mut self, key: &TransactionKey, response: Response) -> Result<()> {
        let transaction = self
            .servers
            .get_mut(key)
            .ok_or_else(|| Error::TransactionNotFound(key.clone()))?;
        let actions = transaction.send_response(&response)?;
        let source = transaction.source();
        let status = response.status;
        trace!(transaction = %key, status = status.as_u16(), "Sending response");

        if transaction.kind() == TransactionKind::InviteServer && status != StatusCode::Trying {
            let request = transaction.request().clone();
            let local_tag = transaction.local_tag().to_string();
            if status.as_u16() < 300 {
                self.uas_dialog(&request, &local_tag, source, &response)?;
            } else if let Some(id) = DialogTable::id_for_response(&response)
                .map(|id| DialogId::new(id.call_id, local_tag, id.local_tag))
            {
                // Early dialog ended by a failure
                self.terminate_dialog(&id);
            }
        }
        self.apply_server(key, actions);
        Ok(())
    }

    /// Create or confirm the UAS dialog; a 2xx starts the retransmission
    /// that runs until the ACK arrives
    fn uas_dialog(
        &mut self,
        request: &Request,
        local_tag: &str,
        source: SocketAddr,
        response: &Response,
    ) -> Result<()> {
        let mut dialog = Dialog::from_uas_request(request, local_tag, source)?;
        let id = dialog.id.clone();
        if !self.dialogs.contains(&id) {
            dialog.update_remote_target(request.contact()?);
            self.dialogs.insert(dialog)?;
        }
        if !response.status.is_success() {
            return Ok(());
        }
        if let Some(dialog) = self.dialogs.get_mut(&id) {
            dialog.confirm();
        }
        let t1 = self.config.timers.t1;
        self.pending_ok.insert(
            id.clone(),
            PendingOk {
                response: response.to_bytes(),
                destination: source,
                interval: t1,
            },
        );
        let target = TimerTarget::Dialog(id);
        if !self.reliable() {
            self.arm(target.clone(), TimerType::OkRetransmit, t1);
        }
        self.arm(
            target,
            TimerType::OkTimeout,
            self.config.timers.transaction_timeout(),
        );
        Ok(())
    }

    // ---- incoming ---------------------------------------------------------

    /// Feed a message received from `source`
    pub fn on_message(&mut self, message: Message, source: SocketAddr) {
        match message {
            Message::Request(request) => self.on_request(request, source),
            Message::Response(response) => self.on_response(response, source),
        }
    }

    fn on_response(&mut self, response: Response, source: SocketAddr) {
        let key = match TransactionKey::for_response(&response) {
            Ok(key) => key,
            Err(e) => {
                warn!(%source, error = %e, "Dropping unparseable response");
                return;
            }
        };
        if let Some(entry) = self.clients.get_mut(&key) {
            let actions = entry.transaction.on_response(response);
            self.apply_client(&key, actions);
            return;
        }

        // 2xx retransmission, or a 2xx from another fork, after the INVITE
        // transaction is gone
        if key.method == Method::Invite && response.status.is_success() {
            if let Some(dialog) = self
                .dialogs
                .find_for_response(&response)
                .and_then(|id| self.dialogs.get(&id))
            {
                if let Some(ack) = dialog.ack.clone() {
                    trace!(dialog = %dialog.id, "2xx retransmission, resending ACK");
                    let destination = dialog.peer;
                    self.outbox.push_back(Outgoing {
                        data: ack,
                        destination,
                    });
                    return;
                }
            }
            if let Some(dialog) = self.late_fork(&response) {
                self.events.push_back(EngineEvent::Response {
                    key,
                    response,
                    dialog: Some(dialog),
                });
                return;
            }
        }
        debug!(transaction = %key, %source, status = response.status.as_u16(), "Dropping response without transaction");
    }

    fn on_request(&mut self, request: Request, source: SocketAddr) {
        if request.method == Method::Ack {
            return self.on_ack(request, source);
        }
        if request.method == Method::Cancel {
            return self.on_cancel(request, source);
        }

        let branch = match request.branch() {
            Ok(branch) => branch,
            Err(e) => {
                warn!(%source, error = %e, "Dropping request without branch");
                return;
            }
        };
        let key = TransactionKey::new(branch, request.method.clone(), true);
        if let Some(transaction) = self.servers.get_mut(&key) {
            let actions = transaction.on_retransmission();
            self.apply_server(&key, actions);
            return;
        }

        if request.method == Method::Invite && self.resend_pending_ok(&request) {
            return;
        }

        let transaction =
            match ServerTransaction::new(request.clone(), source, self.reliable(), self.config.timers)
            {
                Ok(transaction) => transaction,
                Err(e) => {
                    warn!(%source, error = %e, "Dropping malformed request");
                    return;
                }
            };
        debug!(transaction = %key, %source, "New server transaction");
        self.servers.insert(key.clone(), transaction);

        let dialog = match DialogTable::id_for_request(&request) {
            Some(id) => {
                let Some(dialog) = self.dialogs.get_mut(&id) else {
                    debug!(dialog = %id, method = %request.method, "Request for unknown dialog");
                    self.respond(&key, StatusCode::CallOrTransactionDoesNotExist);
                    return;
                };
                match dialog.accept_remote_cseq(&request) {
                    Ok(true) => {}
                    _ => {
                        warn!(dialog = %id, "Out-of-order CSeq");
                        self.respond(&key, StatusCode::ServerInternalError);
                        return;
                    }
                }
                if request.method == Method::Bye {
                    self.terminate_dialog(&id);
                } else if let Ok(contact) = request.contact() {
                    dialog.update_remote_target(contact);
                }
                Some(id)
            }
            None => {
                if request.method == Method::Invite {
                    self.respond(&key, StatusCode::Trying);
                }
                None
            }
        };

        self.events.push_back(EngineEvent::Request {
            key,
            request,
            source,
            dialog,
        });
    }

    /// A retransmitted INVITE whose 2xx is still unacknowledged gets the
    /// 2xx again
    fn resend_pending_ok(&mut self, request: &Request) -> bool {
        let (Ok(call_id), Ok(from)) = (request.call_id(), request.from_addr()) else {
            return false;
        };
        let Some(remote_tag) = from.tag() else {
            return false;
        };
        let pending = self
            .pending_ok
            .iter()
            .find(|(id, _)| id.call_id == call_id && id.remote_tag == remote_tag)
            .map(|(_, pending)| Outgoing {
                data: pending.response.clone(),
                destination: pending.destination,
            });
        match pending {
            Some(outgoing) => {
                trace!(call_id, "INVITE retransmission, resending 2xx");
                self.outbox.push_back(outgoing);
                true
            }
            None => false,
        }
    }

    fn on_ack(&mut self, request: Request, source: SocketAddr) {
        // ACK for a non-2xx final belongs to the INVITE server transaction
        if let Ok(branch) = request.branch() {
            let key = TransactionKey::new(branch, Method::Invite, true);
            if let Some(transaction) = self.servers.get_mut(&key) {
                let actions = transaction.on_ack();
                self.apply_server(&key, actions);
                return;
            }
        }

        let Some(id) = self.dialogs.find_for_request(&request) else {
            debug!(%source, "Dropping ACK without dialog");
            return;
        };
        if self.pending_ok.remove(&id).is_some() {
            let target = TimerTarget::Dialog(id.clone());
            self.disarm(&target, TimerType::OkRetransmit);
            self.disarm(&target, TimerType::OkTimeout);
            debug!(dialog = %id, "2xx acknowledged");
        }
        if let Some(dialog) = self.dialogs.get_mut(&id) {
            dialog.confirm();
        }
        self.events.push_back(EngineEvent::Ack { dialog: id, request });
    }

    fn on_cancel(&mut self, request: Request, source: SocketAddr) {
        let transaction =
            match ServerTransaction::new(request, source, self.reliable(), self.config.timers) {
                Ok(transaction) => transaction,
                Err(e) => {
                    warn!(%source, error = %e, "Dropping malformed CANCEL");
                    return;
                }
            };
        let key = transaction.key().clone();
        if let Some(existing) = self.servers.get_mut(&key) {
            let actions = existing.on_retransmission();
            self.apply_server(&key, actions);
            return;
        }
        self.servers.insert(key.clone(), transaction);

        let invite = key.with_method(Method::Invite);
        let pending = self
            .servers
            .get(&invite)
            .map(|t| t.state() == TransactionState::Proceeding)
            .unwrap_or(false);
        if !pending {
            debug!(transaction = %key, "CANCEL matches no pending INVITE");
            self.respond(&key, StatusCode::CallOrTransactionDoesNotExist);
            return;
        }

        info!(transaction = %invite, "INVITE cancelled by peer");
        self.respond(&key, StatusCode::Ok);
        self.respond(&invite, StatusCode::RequestTerminated);
        self.events.push_back(EngineEvent::Cancelled { invite });
    }

    /// Answer a server transaction with a bare response
    fn respond(&mut self, key: &TransactionKey, status: StatusCode) {
        let result = self
            .make_response(key, status, None)
            .and_then(|response| self.send_response(key, response));
        if let Err(e) = result {
            warn!(transaction = %key, status = status.as_u16(), error = %e, "Automatic response failed");
        }
    }

    // ---- timers -------------------------------------------------------------

    /// Wait for the next timer expiry
    pub async fn next_timer(&mut self) -> Option<TimerFired> {
        self.timer_rx.recv().await
    }

    /// Process every expiry already posted; returns how many were handled
    pub fn handle_expired_timers(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(fired) = self.timer_rx.try_recv() {
            self.on_timer(fired);
            handled += 1;
        }
        handled
    }

    /// Arm a timer for the transaction user. Arming an id that is already
    /// pending replaces it.
    pub fn start_user_timer(&mut self, id: UserTimer, after: Duration) {
        self.arm(TimerTarget::User(id), TimerType::User, after);
    }

    /// Disarm a user timer; false when it was not pending
    pub fn stop_user_timer(&mut self, id: UserTimer) -> bool {
        let target = TimerTarget::User(id);
        let armed = self.timers.contains_key(&(target.clone(), TimerType::User));
        self.disarm(&target, TimerType::User);
        armed
    }

    pub fn user_timer_armed(&self, id: UserTimer) -> bool {
        self.timers
            .contains_key(&(TimerTarget::User(id), TimerType::User))
    }

    pub fn on_timer(&mut self, fired: TimerFired) {
        let slot = (fired.target.clone(), fired.timer);
        match self.timers.get(&slot) {
            Some((_, seq)) if *seq == fired.seq => {
                self.timers.remove(&slot);
            }
            _ => {
                trace!(timer = %fired.timer, "Ignoring stale timer");
                return;
            }
        }
        trace!(timer = %fired.timer, target = ?fired.target, "Timer fired");

        match fired.target {
            TimerTarget::Transaction(key) if key.is_server => {
                if let Some(transaction) = self.servers.get_mut(&key) {
                    let actions = transaction.on_timer(fired.timer);
                    self.apply_server(&key, actions);
                }
            }
            TimerTarget::Transaction(key) => {
                if let Some(entry) = self.clients.get_mut(&key) {
                    let actions = entry.transaction.on_timer(fired.timer);
                    self.apply_client(&key, actions);
                }
            }
            TimerTarget::Dialog(id) => self.on_dialog_timer(id, fired.timer),
            TimerTarget::User(id) => self.events.push_back(EngineEvent::TimerExpired(id)),
        }
    }

    fn on_dialog_timer(&mut self, id: DialogId, timer: TimerType) {
        match timer {
            TimerType::OkRetransmit => {
                let t2 = self.config.timers.t2;
                let Some(pending) = self.pending_ok.get_mut(&id) else {
                    return;
                };
                pending.interval = (pending.interval * 2).min(t2);
                let next = pending.interval;
                self.outbox.push_back(Outgoing {
                    data: pending.response.clone(),
                    destination: pending.destination,
                });
                trace!(dialog = %id, ?next, "Retransmitting 2xx");
                self.arm(TimerTarget::Dialog(id), TimerType::OkRetransmit, next);
            }
            TimerType::OkTimeout => {
                warn!(dialog = %id, "2xx never acknowledged");
                self.pending_ok.remove(&id);
                self.disarm(&TimerTarget::Dialog(id.clone()), TimerType::OkRetransmit);
                self.events.push_back(EngineEvent::AckTimeout { dialog: id });
            }
            _ => {}
        }
    }

    fn arm(&mut self, target: TimerTarget, timer: TimerType, after: Duration) {
        self.disarm(&target, timer);
        self.next_seq += 1;
        let seq = self.next_seq;
        let tx = self.timer_tx.clone();
        let fired = TimerFired {
            target: target.clone(),
            timer,
            seq,
        };
        match self.wheel.start(after, move || {
            let _ = tx.send(fired);
        }) {
            Ok(handle) => {
                self.timers.insert((target, timer), (handle, seq));
            }
            Err(e) => warn!(%timer, error = %e, "Cannot arm timer"),
        }
    }

    fn disarm(&mut self, target: &TimerTarget, timer: TimerType) {
        if let Some((handle, _)) = self.timers.remove(&(target.clone(), timer)) {
            // Already fired is fine: the posted expiry is stale now
            let _ = self.wheel.stop(handle);
        }
    }

    fn disarm_all(&mut self, target: &TimerTarget) {
        let slots: Vec<(TimerTarget, TimerType)> = self
            .timers
            .keys()
            .filter(|(t, _)| t == target)
            .cloned()
            .collect();
        for (target, timer) in slots {
            self.disarm(&target, timer);
        }
    }

    // ---- action application ---------------------------------------------

    fn apply_client(&mut self, key: &TransactionKey, actions: Vec<Action>) {
        let target = TimerTarget::Transaction(key.clone());
        for action in actions {
            match action {
                Action::Transmit(data) => {
                    if let Some(entry) = self.clients.get(key) {
                        self.outbox.push_back(Outgoing {
                            data,
                            destination: entry.destination,
                        });
                    }
                }
                Action::StartTimer(timer, after) => self.arm(target.clone(), timer, after),
                Action::StopTimer(timer) => self.disarm(&target, timer),
                Action::Deliver(response) => self.deliver_response(key, response),
                Action::Timeout => {
                    if let Some(entry) = self.clients.get(key) {
                        let response = SimpleResponseBuilder::from_request(
                            entry.transaction.request(),
                            StatusCode::RequestTimeout,
                            None,
                        )
                        .build();
                        let invite = (key.method == Method::Invite)
                            .then(|| invite_dialog(entry.transaction.request()))
                            .flatten();
                        warn!(transaction = %key, "Transaction timed out");
                        if let Some(id) = invite {
                            self.terminate_early_dialogs(&id);
                        }
                        self.events.push_back(EngineEvent::Timeout {
                            key: key.clone(),
                            response,
                        });
                    }
                }
                Action::Terminate => {
                    self.disarm_all(&target);
                    self.clients.remove(key);
                    self.events
                        .push_back(EngineEvent::TransactionTerminated(key.clone()));
                }
            }
        }
    }

    fn apply_server(&mut self, key: &TransactionKey, actions: Vec<Action>) {
        let target = TimerTarget::Transaction(key.clone());
        for action in actions {
            match action {
                Action::Transmit(data) => {
                    if let Some(transaction) = self.servers.get(key) {
                        self.outbox.push_back(Outgoing {
                            data,
                            destination: transaction.source(),
                        });
                    }
                }
                Action::StartTimer(timer, after) => self.arm(target.clone(), timer, after),
                Action::StopTimer(timer) => self.disarm(&target, timer),
                Action::Deliver(_) => {}
                Action::Timeout => {
                    warn!(transaction = %key, "No ACK for final response");
                }
                Action::Terminate => {
                    self.disarm_all(&target);
                    self.servers.remove(key);
                    self.events
                        .push_back(EngineEvent::TransactionTerminated(key.clone()));
                }
            }
        }
    }

    /// Dialog bookkeeping for a response handed up by a client transaction
    fn deliver_response(&mut self, key: &TransactionKey, response: Response) {
        let status = response.status.as_u16();
        let mut dialog = None;

        if key.method == Method::Invite && status > 100 {
            if status < 300 {
                dialog = self.uac_dialog(key, &response);
            } else if let Some(id) = DialogTable::id_for_response(&response) {
                self.terminate_early_dialogs(&id);
            }
        } else {
            dialog = self.dialogs.find_for_response(&response);
        }

        self.events.push_back(EngineEvent::Response {
            key: key.clone(),
            response,
            dialog,
        });
    }

    /// Early dialogs of an INVITE that ended without a 2xx. Only Call-ID and
    /// local tag of `invite` are used.
    fn terminate_early_dialogs(&mut self, invite: &DialogId) {
        let early: Vec<DialogId> = self
            .dialogs
            .iter()
            .filter(|d| {
                d.state == DialogState::Early
                    && d.id.call_id == invite.call_id
                    && d.id.local_tag == invite.local_tag
            })
            .map(|d| d.id.clone())
            .collect();
        for id in early {
            self.terminate_dialog(&id);
        }
    }

    /// Create or confirm the UAC dialog; a 2xx is ACKed here
    fn uac_dialog(&mut self, key: &TransactionKey, response: &Response) -> Option<DialogId> {
        let id = DialogTable::id_for_response(response)?;
        let entry = self.clients.get(key)?;
        let destination = entry.destination;

        if !self.dialogs.contains(&id) {
            let created =
                Dialog::from_uac_response(entry.transaction.request(), response, destination)
                    .and_then(|dialog| self.dialogs.insert(dialog));
            if let Err(e) = created {
                warn!(dialog = %id, error = %e, "Cannot create dialog");
                return None;
            }
        }
        if response.status.is_success() {
            self.confirm_and_ack(&id, response);
        }
        Some(id)
    }

    /// 2xx to an INVITE whose transaction already ended on a 2xx from
    /// another fork. The fork gets its own dialog, ACKed like the first, and
    /// the transaction user decides what to do with it.
    fn late_fork(&mut self, response: &Response) -> Option<DialogId> {
        let id = DialogTable::id_for_response(response)?;
        if !self.dialogs.contains(&id) {
            let forked = self
                .dialogs
                .iter()
                .find(|d| {
                    d.is_initiator
                        && d.is_confirmed()
                        && d.id.call_id == id.call_id
                        && d.id.local_tag == id.local_tag
                })?
                .fork(response);
            if let Err(e) = forked.and_then(|dialog| self.dialogs.insert(dialog)) {
                warn!(dialog = %id, error = %e, "Cannot create dialog for fork");
                return None;
            }
        }
        debug!(dialog = %id, "2xx from another fork");
        self.confirm_and_ack(&id, response);
        Some(id)
    }

    fn confirm_and_ack(&mut self, id: &DialogId, response: &Response) {
        let via = self.via();
        let Some(dialog) = self.dialogs.get_mut(id) else {
            return;
        };
        dialog.confirm();
        if let Ok(contact) = response.contact() {
            dialog.update_remote_target(contact);
        }
        match dialog.build_ack(via) {
            Ok(ack) => {
                let data = ack.to_bytes();
                dialog.ack = Some(data.clone());
                let destination = dialog.peer;
                debug!(dialog = %id, "Sending ACK for 2xx");
                self.outbox.push_back(Outgoing { data, destination });
            }
            Err(e) => warn!(dialog = %id, error = %e, "Cannot build ACK"),
        }
    }

    // ---- output and inspection ------------------------------------------

    /// Next message to put on the wire
    pub fn poll_transmit(&mut self) -> Option<Outgoing> {
        self.outbox.pop_front()
    }

    /// Next notification for the transaction user
    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    pub fn transaction_state(&self, key: &TransactionKey) -> Option<TransactionState> {
        if key.is_server {
            self.servers.get(key).map(|t| t.state())
        } else {
            self.clients.get(key).map(|e| e.transaction.state())
        }
    }

    /// Number of live transactions
    pub fn active_transactions(&self) -> usize {
        self.clients.len() + self.servers.len()
    }

    pub fn dialogs(&self) -> &DialogTable {
        &self.dialogs
    }

    pub fn dialog(&self, id: &DialogId) -> Option<&Dialog> {
        self.dialogs.get(id)
    }

    /// Stop every timer and forget all state
    pub fn shutdown(&mut self) {
        for (_, (handle, _)) in self.timers.drain() {
            let _ = self.wheel.stop(handle);
        }
        while self.timer_rx.try_recv().is_ok() {}
        let transactions = self.clients.len() + self.servers.len();
        self.clients.clear();
        self.servers.clear();
        self.pending_ok.clear();
        self.dialogs.clear();
        self.outbox.clear();
        debug!(transactions, "SIP engine shut down");
    }
}

/// Call-ID and local tag of an outgoing INVITE; the remote tag is left empty
fn invite_dialog(request: &Request) -> Option<DialogId> {
    let call_id = request.call_id().ok()?;
    let from = request.from_addr().ok()?;
    Some(DialogId::new(call_id, from.tag()?, ""))
}
