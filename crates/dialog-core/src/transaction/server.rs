//! Server transactions (RFC 3261 §17.2)

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use lws_sip_core::builder::generate_tag;
use lws_sip_core::{Method, Request, Response, SipMessage};
use tracing::{debug, trace};

use super::{
    transition, Action, TimerSettings, TimerType, TransactionKey, TransactionKind,
    TransactionState,
};
use crate::error::{Error, Result};

/// An INVITE or non-INVITE server transaction
#[derive(Debug, Clone)]
pub struct ServerTransaction {
    key: TransactionKey,
    kind: TransactionKind,
    state: TransactionState,
    request: Request,
    source: SocketAddr,
    /// To tag applied to every response this transaction sends
    local_tag: String,
    last_response: Option<Bytes>,
    reliable: bool,
    settings: TimerSettings,
    /// Current Timer G interval
    interval: Duration,
}

impl ServerTransaction {
    pub fn new(
        request: Request,
        source: SocketAddr,
        reliable: bool,
        settings: TimerSettings,
    ) -> Result<Self> {
        request.validate()?;
        let key = TransactionKey::new(request.branch()?, request.method.clone(), true);
        let (kind, state) = if request.method == Method::Invite {
            (TransactionKind::InviteServer, TransactionState::Proceeding)
        } else {
            (TransactionKind::NonInviteServer, TransactionState::Trying)
        };
        let local_tag = request
            .to_addr()?
            .tag()
            .map(str::to_string)
            .unwrap_or_else(generate_tag);
        Ok(Self {
            key,
            kind,
            state,
            request,
            source,
            local_tag,
            last_response: None,
            reliable,
            settings,
            interval: settings.t1,
        })
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Where the request came from; responses go back there
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    /// The transaction user hands down a response
    pub fn send_response(&mut self, response: &Response) -> Result<Vec<Action>> {
        let status = response.status;
        let open = matches!(
            self.state,
            TransactionState::Trying | TransactionState::Proceeding
        );
        if !open {
            return Err(Error::InvalidTransactionState {
                key: self.key.clone(),
                state: self.state,
                reason: "final response already sent",
            });
        }

        let bytes = response.to_bytes();
        self.last_response = Some(bytes.clone());
        let mut actions = vec![Action::Transmit(bytes)];

        if status.is_provisional() {
            transition(&self.key, &mut self.state, TransactionState::Proceeding);
            return Ok(actions);
        }

        match self.kind {
            TransactionKind::InviteServer if status.is_success() => {
                // 2xx retransmission belongs to the core, not the transaction
                transition(&self.key, &mut self.state, TransactionState::Terminated);
                actions.push(Action::Terminate);
            }
            TransactionKind::InviteServer => {
                transition(&self.key, &mut self.state, TransactionState::Completed);
                if !self.reliable {
                    actions.push(Action::StartTimer(TimerType::G, self.interval));
                }
                actions.push(Action::StartTimer(
                    TimerType::H,
                    self.settings.transaction_timeout(),
                ));
            }
            _ => {
                transition(&self.key, &mut self.state, TransactionState::Completed);
                if self.reliable {
                    transition(&self.key, &mut self.state, TransactionState::Terminated);
                    actions.push(Action::Terminate);
                } else {
                    actions.push(Action::StartTimer(
                        TimerType::J,
                        self.settings.transaction_timeout(),
                    ));
                }
            }
        }
        Ok(actions)
    }

    /// The same request arrived again
    pub fn on_retransmission(&mut self) -> Vec<Action> {
        match self.state {
            TransactionState::Proceeding | TransactionState::Completed => {
                trace!(transaction = %self.key, "Request retransmission, resending last response");
                self.last_response
                    .clone()
                    .map(Action::Transmit)
                    .into_iter()
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// ACK matching a non-2xx final
    pub fn on_ack(&mut self) -> Vec<Action> {
        if self.kind != TransactionKind::InviteServer || self.state != TransactionState::Completed
        {
            return Vec::new();
        }
        transition(&self.key, &mut self.state, TransactionState::Confirmed);
        let mut actions = vec![
            Action::StopTimer(TimerType::G),
            Action::StopTimer(TimerType::H),
        ];
        if self.reliable {
            transition(&self.key, &mut self.state, TransactionState::Terminated);
            actions.push(Action::Terminate);
        } else {
            actions.push(Action::StartTimer(TimerType::I, self.settings.t4));
        }
        actions
    }

    pub fn on_timer(&mut self, timer: TimerType) -> Vec<Action> {
        match (timer, self.state) {
            (TimerType::G, TransactionState::Completed) => {
                self.interval = self.settings.backoff(self.interval);
                let mut actions: Vec<Action> = self
                    .last_response
                    .clone()
                    .map(Action::Transmit)
                    .into_iter()
                    .collect();
                actions.push(Action::StartTimer(TimerType::G, self.interval));
                actions
            }
            (TimerType::H, TransactionState::Completed) => {
                debug!(transaction = %self.key, "Timer H: no ACK for final response");
                transition(&self.key, &mut self.state, TransactionState::Terminated);
                vec![
                    Action::StopTimer(TimerType::G),
                    Action::Timeout,
                    Action::Terminate,
                ]
            }
            (TimerType::I, TransactionState::Confirmed)
            | (TimerType::J, TransactionState::Completed) => {
                transition(&self.key, &mut self.state, TransactionState::Terminated);
                vec![Action::Terminate]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lws_sip_core::builder::{SimpleRequestBuilder, SimpleResponseBuilder};
    use lws_sip_core::{NameAddr, StatusCode, Uri, Via};

    fn request(method: Method) -> Request {
        SimpleRequestBuilder::new(method, "sip:1002@10.0.0.2")
            .unwrap()
            .via(Via::new("UDP", "10.0.0.1", Some(5060), "z9hG4bKserver1"))
            .from(NameAddr::new(Uri::sip("example.com").with_user("1001")).with_tag("abc"))
            .to(NameAddr::new(Uri::sip("example.com").with_user("1002")))
            .call_id("call-2@10.0.0.1")
            .cseq(1)
            .build()
            .unwrap()
    }

    fn source() -> SocketAddr {
        "10.0.0.1:5060".parse().unwrap()
    }

    fn respond(tx: &ServerTransaction, status: StatusCode) -> Response {
        SimpleResponseBuilder::from_request(tx.request(), status, None)
            .to_tag(tx.local_tag())
            .build()
    }

    #[test]
    fn test_invite_failure_waits_for_ack() {
        let mut tx =
            ServerTransaction::new(request(Method::Invite), source(), false, TimerSettings::default())
                .unwrap();
        assert_eq!(tx.state(), TransactionState::Proceeding);
        assert!(tx.key().is_server);

        let ringing = respond(&tx, StatusCode::Ringing);
        tx.send_response(&ringing).unwrap();
        assert_eq!(tx.on_retransmission(), vec![Action::Transmit(ringing.to_bytes())]);

        let busy = respond(&tx, StatusCode::BusyHere);
        let actions = tx.send_response(&busy).unwrap();
        assert_eq!(tx.state(), TransactionState::Completed);
        assert!(actions.contains(&Action::StartTimer(TimerType::G, Duration::from_millis(500))));
        assert!(actions.contains(&Action::StartTimer(TimerType::H, Duration::from_secs(32))));

        let actions = tx.on_timer(TimerType::G);
        assert_eq!(
            actions,
            vec![
                Action::Transmit(busy.to_bytes()),
                Action::StartTimer(TimerType::G, Duration::from_secs(1)),
            ]
        );

        let actions = tx.on_ack();
        assert_eq!(tx.state(), TransactionState::Confirmed);
        assert!(actions.contains(&Action::StartTimer(TimerType::I, Duration::from_secs(5))));
        assert_eq!(tx.on_timer(TimerType::I), vec![Action::Terminate]);
    }

    #[test]
    fn test_invite_success_terminates() {
        let mut tx =
            ServerTransaction::new(request(Method::Invite), source(), false, TimerSettings::default())
                .unwrap();
        let ok = respond(&tx, StatusCode::Ok);
        let actions = tx.send_response(&ok).unwrap();
        assert_eq!(actions.last(), Some(&Action::Terminate));
        assert!(tx.send_response(&ok).is_err());
    }

    #[test]
    fn test_timer_h_without_ack() {
        let mut tx =
            ServerTransaction::new(request(Method::Invite), source(), false, TimerSettings::default())
                .unwrap();
        tx.send_response(&respond(&tx, StatusCode::BusyHere)).unwrap();
        let actions = tx.on_timer(TimerType::H);
        assert!(actions.contains(&Action::Timeout));
        assert_eq!(tx.state(), TransactionState::Terminated);
    }

    #[test]
    fn test_non_invite_absorbs_retransmission_until_answered() {
        let mut tx =
            ServerTransaction::new(request(Method::Options), source(), false, TimerSettings::default())
                .unwrap();
        assert_eq!(tx.state(), TransactionState::Trying);
        assert!(tx.on_retransmission().is_empty());

        let ok = respond(&tx, StatusCode::Ok);
        let actions = tx.send_response(&ok).unwrap();
        assert!(actions.contains(&Action::StartTimer(TimerType::J, Duration::from_secs(32))));
        assert_eq!(tx.on_retransmission(), vec![Action::Transmit(ok.to_bytes())]);
        assert_eq!(tx.on_timer(TimerType::J), vec![Action::Terminate]);
    }

    #[test]
    fn test_reliable_non_invite_terminates_at_once() {
        let mut tx =
            ServerTransaction::new(request(Method::Options), source(), true, TimerSettings::default())
                .unwrap();
        let actions = tx.send_response(&respond(&tx, StatusCode::Ok)).unwrap();
        assert_eq!(actions.last(), Some(&Action::Terminate));
    }

    #[test]
    fn test_existing_to_tag_is_kept() {
        let mut req = request(Method::Bye);
        let to = NameAddr::new(Uri::sip("example.com").with_user("1002")).with_tag("mine");
        req.headers.set(lws_sip_core::HeaderName::To, to.to_string());
        let tx = ServerTransaction::new(req, source(), false, TimerSettings::default()).unwrap();
        assert_eq!(tx.local_tag(), "mine");
    }
}
