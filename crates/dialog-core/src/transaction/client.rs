//! Client transactions (RFC 3261 §17.1)

use std::time::Duration;

use bytes::Bytes;
use lws_sip_core::builder::DEFAULT_MAX_FORWARDS;
use lws_sip_core::{CSeq, HeaderName, Method, Request, Response, SipMessage};
use tracing::{debug, trace};

use super::{
    transition, Action, TimerSettings, TimerType, TransactionKey, TransactionKind,
    TransactionState,
};
use crate::error::Result;

/// An INVITE or non-INVITE client transaction
#[derive(Debug, Clone)]
pub struct ClientTransaction {
    key: TransactionKey,
    kind: TransactionKind,
    state: TransactionState,
    request: Request,
    request_bytes: Bytes,
    cseq: u32,
    reliable: bool,
    settings: TimerSettings,
    /// Current Timer A / E interval
    interval: Duration,
    /// ACK for a non-2xx final, resent on every retransmitted final
    ack: Option<Bytes>,
    /// CANCEL sent; Timer B then also runs in Proceeding
    cancelled: bool,
}

impl ClientTransaction {
    /// Wrap a fully built request. The key comes from its top Via branch.
    pub fn new(request: Request, reliable: bool, settings: TimerSettings) -> Result<Self> {
        request.validate()?;
        let cseq = request.cseq()?.seq;
        let key = TransactionKey::new(request.branch()?, request.method.clone(), false);
        let kind = if request.method == Method::Invite {
            TransactionKind::InviteClient
        } else {
            TransactionKind::NonInviteClient
        };
        let state = match kind {
            TransactionKind::InviteClient => TransactionState::Calling,
            _ => TransactionState::Trying,
        };
        Ok(Self {
            key,
            kind,
            state,
            request_bytes: request.to_bytes(),
            request,
            cseq,
            reliable,
            settings,
            interval: settings.t1,
            ack: None,
            cancelled: false,
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

    /// CANCEL is only meaningful before the INVITE has a final response
    pub fn is_cancellable(&self) -> bool {
        self.kind == TransactionKind::InviteClient
            && matches!(
                self.state,
                TransactionState::Calling | TransactionState::Proceeding
            )
    }

    /// CANCEL matching this INVITE
    pub fn cancel_request(&self) -> Request {
        build_cancel(&self.request, self.cseq)
    }

    /// A CANCEL for this INVITE went out. Without a final response within
    /// 64·T1 the INVITE is abandoned with a timeout (RFC 3261 §9.1).
    pub fn on_cancel_sent(&mut self) -> Vec<Action> {
        if !self.is_cancellable() {
            return Vec::new();
        }
        self.cancelled = true;
        vec![Action::StartTimer(
            TimerType::B,
            self.settings.transaction_timeout(),
        )]
    }

    /// First transmission plus the initial timers
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = vec![Action::Transmit(self.request_bytes.clone())];
        let (retransmit, timeout) = match self.kind {
            TransactionKind::InviteClient => (TimerType::A, TimerType::B),
            _ => (TimerType::E, TimerType::F),
        };
        if !self.reliable {
            actions.push(Action::StartTimer(retransmit, self.interval));
        }
        actions.push(Action::StartTimer(
            timeout,
            self.settings.transaction_timeout(),
        ));
        actions
    }

    pub fn on_response(&mut self, response: Response) -> Vec<Action> {
        match self.kind {
            TransactionKind::InviteClient => self.invite_response(response),
            _ => self.non_invite_response(response),
        }
    }

    pub fn on_timer(&mut self, timer: TimerType) -> Vec<Action> {
        match self.kind {
            TransactionKind::InviteClient => self.invite_timer(timer),
            _ => self.non_invite_timer(timer),
        }
    }

    fn invite_response(&mut self, response: Response) -> Vec<Action> {
        let status = response.status;
        match self.state {
            TransactionState::Calling | TransactionState::Proceeding => {
                if status.is_provisional() {
                    let mut actions = Vec::new();
                    if self.state == TransactionState::Calling {
                        transition(&self.key, &mut self.state, TransactionState::Proceeding);
                        actions.push(Action::StopTimer(TimerType::A));
                    }
                    actions.push(Action::Deliver(response));
                    actions
                } else if status.is_success() {
                    transition(&self.key, &mut self.state, TransactionState::Terminated);
                    vec![
                        Action::StopTimer(TimerType::A),
                        Action::StopTimer(TimerType::B),
                        Action::Deliver(response),
                        Action::Terminate,
                    ]
                } else {
                    transition(&self.key, &mut self.state, TransactionState::Completed);
                    let ack = build_ack(&self.request, &response, self.cseq).to_bytes();
                    self.ack = Some(ack.clone());
                    let mut actions = vec![
                        Action::StopTimer(TimerType::A),
                        Action::StopTimer(TimerType::B),
                        Action::Transmit(ack),
                        Action::Deliver(response),
                    ];
                    if self.reliable {
                        transition(&self.key, &mut self.state, TransactionState::Terminated);
                        actions.push(Action::Terminate);
                    } else {
                        actions.push(Action::StartTimer(TimerType::D, self.settings.timer_d));
                    }
                    actions
                }
            }
            TransactionState::Completed if status.as_u16() >= 300 => {
                trace!(transaction = %self.key, "Final retransmission, resending ACK");
                self.ack.clone().map(Action::Transmit).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    fn invite_timer(&mut self, timer: TimerType) -> Vec<Action> {
        match (timer, self.state) {
            (TimerType::A, TransactionState::Calling) => {
                self.interval = self.settings.backoff(self.interval);
                debug!(transaction = %self.key, next = ?self.interval, "Timer A: retransmitting INVITE");
                vec![
                    Action::Transmit(self.request_bytes.clone()),
                    Action::StartTimer(TimerType::A, self.interval),
                ]
            }
            (TimerType::B, TransactionState::Calling) => self.invite_timed_out(),
            (TimerType::B, TransactionState::Proceeding) if self.cancelled => {
                debug!(transaction = %self.key, "No final response after CANCEL");
                self.invite_timed_out()
            }
            (TimerType::D, TransactionState::Completed) => {
                transition(&self.key, &mut self.state, TransactionState::Terminated);
                vec![Action::Terminate]
            }
            _ => Vec::new(),
        }
    }

    fn invite_timed_out(&mut self) -> Vec<Action> {
        debug!(transaction = %self.key, "Timer B: INVITE timed out");
        transition(&self.key, &mut self.state, TransactionState::Terminated);
        vec![
            Action::StopTimer(TimerType::A),
            Action::Timeout,
            Action::Terminate,
        ]
    }

    fn non_invite_response(&mut self, response: Response) -> Vec<Action> {
        match self.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if response.status.is_provisional() {
                    transition(&self.key, &mut self.state, TransactionState::Proceeding);
                    return vec![Action::Deliver(response)];
                }
                transition(&self.key, &mut self.state, TransactionState::Completed);
                let mut actions = vec![
                    Action::StopTimer(TimerType::E),
                    Action::StopTimer(TimerType::F),
                    Action::Deliver(response),
                ];
                if self.reliable {
                    transition(&self.key, &mut self.state, TransactionState::Terminated);
                    actions.push(Action::Terminate);
                } else {
                    actions.push(Action::StartTimer(TimerType::K, self.settings.t4));
                }
                actions
            }
            // Retransmitted finals are absorbed
            _ => Vec::new(),
        }
    }

    fn non_invite_timer(&mut self, timer: TimerType) -> Vec<Action> {
        match (timer, self.state) {
            (TimerType::E, TransactionState::Trying) => {
                self.interval = self.settings.backoff(self.interval);
                debug!(transaction = %self.key, next = ?self.interval, "Timer E: retransmitting request");
                vec![
                    Action::Transmit(self.request_bytes.clone()),
                    Action::StartTimer(TimerType::E, self.interval),
                ]
            }
            (TimerType::E, TransactionState::Proceeding) => {
                self.interval = self.settings.t2;
                vec![
                    Action::Transmit(self.request_bytes.clone()),
                    Action::StartTimer(TimerType::E, self.interval),
                ]
            }
            (TimerType::F, TransactionState::Trying | TransactionState::Proceeding) => {
                debug!(transaction = %self.key, "Timer F: request timed out");
                transition(&self.key, &mut self.state, TransactionState::Terminated);
                vec![
                    Action::StopTimer(TimerType::E),
                    Action::Timeout,
                    Action::Terminate,
                ]
            }
            (TimerType::K, TransactionState::Completed) => {
                transition(&self.key, &mut self.state, TransactionState::Terminated);
                vec![Action::Terminate]
            }
            _ => Vec::new(),
        }
    }
}

/// ACK for a non-2xx final (RFC 3261 §17.1.1.3): same branch, Request-URI,
/// Call-ID, From and Route set; To from the response
pub(crate) fn build_ack(request: &Request, response: &Response, cseq: u32) -> Request {
    let to = response
        .header(&HeaderName::To)
        .or(request.header(&HeaderName::To));
    derived_request(request, Method::Ack, to, cseq)
}

/// CANCEL for a pending INVITE (RFC 3261 §9.1): same branch, Request-URI,
/// Call-ID, From, To and Route set
pub(crate) fn build_cancel(request: &Request, cseq: u32) -> Request {
    derived_request(request, Method::Cancel, request.header(&HeaderName::To), cseq)
}

fn derived_request(request: &Request, method: Method, to: Option<&str>, cseq: u32) -> Request {
    let mut derived = Request::new(method.clone(), request.uri.clone());
    let headers = &mut derived.headers;
    if let Some(via) = request.header(&HeaderName::Via) {
        headers.push(HeaderName::Via, via);
    }
    for route in request.headers.get_all(&HeaderName::Route) {
        headers.push(HeaderName::Route, route);
    }
    headers.push(HeaderName::MaxForwards, DEFAULT_MAX_FORWARDS.to_string());
    if let Some(from) = request.header(&HeaderName::From) {
        headers.push(HeaderName::From, from);
    }
    if let Some(to) = to {
        headers.push(HeaderName::To, to);
    }
    if let Some(call_id) = request.header(&HeaderName::CallId) {
        headers.push(HeaderName::CallId, call_id);
    }
    headers.push(HeaderName::CSeq, CSeq::new(cseq, method).to_string());
    derived
}

#[cfg(test)]
mod tests {
    use super::*;
    use lws_sip_core::builder::{SimpleRequestBuilder, SimpleResponseBuilder};
    use lws_sip_core::{NameAddr, StatusCode, Uri, Via};

    fn request(method: Method) -> Request {
        SimpleRequestBuilder::new(method, "sip:1002@example.com")
            .unwrap()
            .via(Via::new("UDP", "10.0.0.1", Some(5060), "z9hG4bKclient1"))
            .from(NameAddr::new(Uri::sip("example.com").with_user("1001")).with_tag("abc"))
            .to(NameAddr::new(Uri::sip("example.com").with_user("1002")))
            .call_id("call-1@10.0.0.1")
            .cseq(7)
            .build()
            .unwrap()
    }

    fn response(req: &Request, status: StatusCode) -> Response {
        SimpleResponseBuilder::from_request(req, status, None)
            .to_tag("xyz")
            .build()
    }

    fn timers(actions: &[Action]) -> Vec<(TimerType, Duration)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::StartTimer(t, d) => Some((*t, *d)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_invite_start_arms_a_and_b() {
        let mut tx = ClientTransaction::new(request(Method::Invite), false, TimerSettings::default()).unwrap();
        assert_eq!(tx.state(), TransactionState::Calling);
        assert_eq!(tx.key().branch, "z9hG4bKclient1");
        let actions = tx.start();
        assert!(matches!(actions[0], Action::Transmit(_)));
        assert_eq!(
            timers(&actions),
            vec![
                (TimerType::A, Duration::from_millis(500)),
                (TimerType::B, Duration::from_secs(32)),
            ]
        );
    }

    #[test]
    fn test_reliable_invite_skips_timer_a() {
        let mut tx = ClientTransaction::new(request(Method::Invite), true, TimerSettings::default()).unwrap();
        assert_eq!(timers(&tx.start()), vec![(TimerType::B, Duration::from_secs(32))]);
    }

    #[test]
    fn test_invite_provisional_then_success() {
        let req = request(Method::Invite);
        let mut tx = ClientTransaction::new(req.clone(), false, TimerSettings::default()).unwrap();
        tx.start();

        let actions = tx.on_response(response(&req, StatusCode::Ringing));
        assert_eq!(tx.state(), TransactionState::Proceeding);
        assert!(actions.contains(&Action::StopTimer(TimerType::A)));
        assert!(tx.is_cancellable());

        // Timer A no longer retransmits in Proceeding
        assert!(tx.on_timer(TimerType::A).is_empty());

        let actions = tx.on_response(response(&req, StatusCode::Ok));
        assert_eq!(tx.state(), TransactionState::Terminated);
        assert_eq!(actions.last(), Some(&Action::Terminate));
        assert!(!tx.is_cancellable());
    }

    #[test]
    fn test_invite_failure_sends_ack_on_same_branch() {
        let req = request(Method::Invite);
        let mut tx = ClientTransaction::new(req.clone(), false, TimerSettings::default()).unwrap();
        tx.start();

        let actions = tx.on_response(response(&req, StatusCode::BusyHere));
        assert_eq!(tx.state(), TransactionState::Completed);
        let ack = actions
            .iter()
            .find_map(|a| match a {
                Action::Transmit(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .unwrap();
        let ack = lws_sip_core::parse_message(&ack).unwrap();
        let ack = ack.as_request().unwrap();
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.branch().unwrap(), "z9hG4bKclient1");
        assert_eq!(ack.cseq().unwrap(), CSeq::new(7, Method::Ack));
        assert_eq!(ack.to_addr().unwrap().tag(), Some("xyz"));
        assert!(timers(&actions).contains(&(TimerType::D, Duration::from_secs(32))));

        // A retransmitted final is answered with the same ACK, not delivered
        let again = tx.on_response(response(&req, StatusCode::BusyHere));
        assert_eq!(again.len(), 1);
        assert!(matches!(again[0], Action::Transmit(_)));

        assert_eq!(tx.on_timer(TimerType::D), vec![Action::Terminate]);
    }

    #[test]
    fn test_timer_b_times_out_only_in_calling() {
        let req = request(Method::Invite);
        let mut tx = ClientTransaction::new(req, false, TimerSettings::default()).unwrap();
        tx.start();
        let actions = tx.on_timer(TimerType::B);
        assert!(actions.contains(&Action::Timeout));
        assert_eq!(tx.state(), TransactionState::Terminated);
    }

    #[test]
    fn test_timer_b_ignored_in_proceeding_until_cancelled() {
        let req = request(Method::Invite);
        let mut tx = ClientTransaction::new(req.clone(), false, TimerSettings::default()).unwrap();
        tx.start();
        tx.on_response(response(&req, StatusCode::Ringing));

        // A ringing INVITE may wait as long as the callee rings
        assert!(tx.on_timer(TimerType::B).is_empty());
        assert_eq!(tx.state(), TransactionState::Proceeding);

        let actions = tx.on_cancel_sent();
        assert_eq!(timers(&actions), vec![(TimerType::B, Duration::from_secs(32))]);
        let actions = tx.on_timer(TimerType::B);
        assert!(actions.contains(&Action::Timeout));
        assert_eq!(actions.last(), Some(&Action::Terminate));
        assert_eq!(tx.state(), TransactionState::Terminated);
    }

    #[test]
    fn test_cancel_after_final_arms_nothing() {
        let req = request(Method::Invite);
        let mut tx = ClientTransaction::new(req.clone(), false, TimerSettings::default()).unwrap();
        tx.start();
        tx.on_response(response(&req, StatusCode::BusyHere));
        assert!(tx.on_cancel_sent().is_empty());
        assert!(tx.on_timer(TimerType::B).is_empty());
    }

    #[test]
    fn test_non_invite_timer_e_caps_at_t2_in_proceeding() {
        let req = request(Method::Register);
        let mut tx = ClientTransaction::new(req.clone(), false, TimerSettings::default()).unwrap();
        assert_eq!(tx.state(), TransactionState::Trying);
        tx.start();

        let actions = tx.on_timer(TimerType::E);
        assert_eq!(timers(&actions), vec![(TimerType::E, Duration::from_secs(1))]);

        tx.on_response(response(&req, StatusCode::Trying));
        let actions = tx.on_timer(TimerType::E);
        assert_eq!(timers(&actions), vec![(TimerType::E, Duration::from_secs(4))]);

        let actions = tx.on_response(response(&req, StatusCode::Ok));
        assert_eq!(tx.state(), TransactionState::Completed);
        assert!(timers(&actions).contains(&(TimerType::K, Duration::from_secs(5))));
        assert!(tx.on_response(response(&req, StatusCode::Ok)).is_empty());
        assert_eq!(tx.on_timer(TimerType::K), vec![Action::Terminate]);
    }

    #[test]
    fn test_non_invite_timer_f() {
        let mut tx = ClientTransaction::new(request(Method::Options), false, TimerSettings::default()).unwrap();
        tx.start();
        let actions = tx.on_timer(TimerType::F);
        assert_eq!(
            actions,
            vec![Action::StopTimer(TimerType::E), Action::Timeout, Action::Terminate]
        );
    }

    #[test]
    fn test_cancel_copies_invite_identity() {
        let tx = ClientTransaction::new(request(Method::Invite), false, TimerSettings::default()).unwrap();
        let cancel = tx.cancel_request();
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.uri, tx.request().uri);
        assert_eq!(cancel.branch().unwrap(), "z9hG4bKclient1");
        assert_eq!(cancel.cseq().unwrap(), CSeq::new(7, Method::Cancel));
        assert_eq!(cancel.call_id().unwrap(), "call-1@10.0.0.1");
        assert_eq!(cancel.to_addr().unwrap().tag(), None);
        cancel.validate().unwrap();
    }
}
