//! Two engines talking to each other through in-memory message passing

use std::net::SocketAddr;
use std::time::Duration;

use lws_dialog_core::prelude::*;
use lws_infra_common::TimerWheel;
use lws_sip_core::builder::SimpleRequestBuilder;
use lws_sip_core::{parse_message, Method, NameAddr, SipMessage, StatusCode, Uri};
use lws_sip_transport::TransportKind;
use tokio::time::{self, Instant};

fn alice_addr() -> SocketAddr {
    "10.0.0.1:5060".parse().unwrap()
}

fn bob_addr() -> SocketAddr {
    "10.0.0.2:5060".parse().unwrap()
}

struct Pair {
    wheel: TimerWheel,
    alice: SipEngine,
    bob: SipEngine,
}

impl Pair {
    fn new() -> Self {
        let wheel = TimerWheel::new_detached();
        let alice = SipEngine::new(
            EngineConfig::new("10.0.0.1", 5060, TransportKind::Udp),
            wheel.clone(),
        );
        let bob = SipEngine::new(
            EngineConfig::new("10.0.0.2", 5060, TransportKind::Udp),
            wheel.clone(),
        );
        Self { wheel, alice, bob }
    }

    /// Deliver everything queued in both directions until quiet
    fn pump(&mut self) {
        loop {
            let mut moved = false;
            while let Some(out) = self.alice.poll_transmit() {
                assert_eq!(out.destination, bob_addr());
                self.bob
                    .on_message(parse_message(&out.data).unwrap(), alice_addr());
                moved = true;
            }
            while let Some(out) = self.bob.poll_transmit() {
                assert_eq!(out.destination, alice_addr());
                self.alice
                    .on_message(parse_message(&out.data).unwrap(), bob_addr());
                moved = true;
            }
            if !moved {
                break;
            }
        }
    }

    async fn advance(&mut self, by: Duration) {
        time::advance(by).await;
        self.wheel.fire_expired(Instant::now());
        self.alice.handle_expired_timers();
        self.bob.handle_expired_timers();
    }
}

fn events(engine: &mut SipEngine) -> Vec<EngineEvent> {
    std::iter::from_fn(|| engine.poll_event()).collect()
}

fn invite(engine: &SipEngine) -> lws_sip_core::Request {
    SimpleRequestBuilder::new(Method::Invite, "sip:1002@10.0.0.2")
        .unwrap()
        .via(engine.via())
        .from(NameAddr::new(Uri::sip("example.com").with_user("1001")).with_tag("alice"))
        .to(NameAddr::new(Uri::sip("example.com").with_user("1002")))
        .call_id("pair@10.0.0.1")
        .cseq(1)
        .contact(NameAddr::new(Uri::sip("10.0.0.1").with_user("1001").with_port(5060)))
        .build()
        .unwrap()
}

fn incoming_key(events: &[EngineEvent], method: Method) -> TransactionKey {
    events
        .iter()
        .find_map(|e| match e {
            EngineEvent::Request { key, request, .. } if request.method == method => {
                Some(key.clone())
            }
            _ => None,
        })
        .expect("request event")
}

#[tokio::test(start_paused = true)]
async fn call_setup_and_teardown() {
    let mut pair = Pair::new();
    let request = invite(&pair.alice);
    pair.alice.send_request(request, bob_addr()).unwrap();
    pair.pump();

    // Bob: 100 went out automatically, now ring and answer
    let key = incoming_key(&events(&mut pair.bob), Method::Invite);
    let ringing = pair.bob.make_response(&key, StatusCode::Ringing, None).unwrap();
    pair.bob.send_response(&key, ringing).unwrap();
    pair.pump();

    let early: Vec<DialogId> = pair.alice.dialogs().ids().cloned().collect();
    assert_eq!(early.len(), 1);
    assert_eq!(
        pair.alice.dialog(&early[0]).unwrap().state,
        DialogState::Early
    );

    let ok = pair.bob.make_response(&key, StatusCode::Ok, None).unwrap();
    pair.bob.send_response(&key, ok).unwrap();
    pair.pump();

    let alice_dialog = early[0].clone();
    assert_eq!(
        pair.alice.dialog(&alice_dialog).unwrap().state,
        DialogState::Confirmed
    );
    let bob_events = events(&mut pair.bob);
    let bob_dialog = bob_events
        .iter()
        .find_map(|e| match e {
            EngineEvent::Ack { dialog, .. } => Some(dialog.clone()),
            _ => None,
        })
        .expect("ACK reached bob");
    assert_eq!(bob_dialog.local_tag, alice_dialog.remote_tag);
    assert_eq!(bob_dialog.remote_tag, alice_dialog.local_tag);

    // No 2xx retransmission once the ACK arrived
    pair.advance(Duration::from_secs(2)).await;
    assert!(pair.bob.poll_transmit().is_none());

    // Alice hangs up
    let bye = pair
        .alice
        .build_in_dialog_request(&alice_dialog, Method::Bye)
        .unwrap();
    assert_eq!(bye.cseq().unwrap().seq, 2);
    pair.alice.send_in_dialog(&alice_dialog, bye).unwrap();
    assert!(pair.alice.dialog(&alice_dialog).is_none());
    pair.pump();

    let bob_events = events(&mut pair.bob);
    let bye_key = incoming_key(&bob_events, Method::Bye);
    assert!(bob_events
        .iter()
        .any(|e| matches!(e, EngineEvent::DialogTerminated(id) if *id == bob_dialog)));
    let ok = pair.bob.make_response(&bye_key, StatusCode::Ok, None).unwrap();
    pair.bob.send_response(&bye_key, ok).unwrap();
    pair.pump();

    assert!(events(&mut pair.alice).iter().any(|e| matches!(
        e,
        EngineEvent::Response { response, .. }
            if response.status == StatusCode::Ok && response.cseq().unwrap().method == Method::Bye
    )));
}

#[tokio::test(start_paused = true)]
async fn rejected_call_is_acked_by_transaction() {
    let mut pair = Pair::new();
    let request = invite(&pair.alice);
    let invite_key = pair.alice.send_request(request, bob_addr()).unwrap();
    pair.pump();

    let key = incoming_key(&events(&mut pair.bob), Method::Invite);
    let busy = pair.bob.make_response(&key, StatusCode::BusyHere, None).unwrap();
    pair.bob.send_response(&key, busy).unwrap();
    pair.pump();

    // Bob's server transaction saw the ACK and is Confirmed
    assert_eq!(
        pair.bob.transaction_state(&key),
        Some(TransactionState::Confirmed)
    );
    assert_eq!(
        pair.alice.transaction_state(&invite_key),
        Some(TransactionState::Completed)
    );
    assert!(events(&mut pair.alice).iter().any(|e| matches!(
        e,
        EngineEvent::Response { response, .. } if response.status == StatusCode::BusyHere
    )));

    // Timer D and Timer I clean up
    pair.advance(Duration::from_secs(33)).await;
    assert_eq!(pair.alice.active_transactions(), 0);
    assert_eq!(pair.bob.active_transactions(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_answer() {
    let mut pair = Pair::new();
    let request = invite(&pair.alice);
    let invite_key = pair.alice.send_request(request, bob_addr()).unwrap();
    pair.pump();
    events(&mut pair.bob);

    pair.alice.cancel(&invite_key).unwrap();
    pair.pump();

    assert!(events(&mut pair.bob)
        .iter()
        .any(|e| matches!(e, EngineEvent::Cancelled { .. })));
    let statuses: Vec<u16> = events(&mut pair.alice)
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Response { response, .. } => Some(response.status.as_u16()),
            _ => None,
        })
        .collect();
    assert!(statuses.contains(&200));
    assert!(statuses.contains(&487));
}
