//! Call control end to end: answering, cancelling, INVITE timeout and a
//! hangup race between two agents

mod common;

use std::time::Duration;

use common::*;
use lws_client_core::prelude::*;
use lws_infra_common::errors::LWS_ERR_SIP_CANCEL_REJECTED;
use lws_media_core::CodecId;
use lws_sip_core::sdp::SessionDescription;
use lws_sip_core::{HeaderName, Method, SipMessage, StatusCode};
use lws_sip_transport::ChannelTransport;
use tokio::time::{timeout, Instant};

fn states(recorder: &Recorder, call: CallHandle) -> Vec<CallState> {
    recorder
        .call_states(call)
        .into_iter()
        .map(|(state, _)| state)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_incoming_call_answered() {
    let (mut agent, mut peer, recorder) = agent_with_peer(server_config(), CallAction::Ignore).await;
    register(&mut agent, &mut peer, &recorder, 3600).await;

    let invite = invite_to_agent();
    peer.send(invite.clone()).await;

    let trying = expect_response(&mut agent, &mut peer).await;
    assert_eq!(trying.status, StatusCode::Trying);
    let ringing = expect_response(&mut agent, &mut peer).await;
    assert_eq!(ringing.status, StatusCode::Ringing);
    assert!(ringing.to_addr().unwrap().tag().is_some());
    assert!(ringing.contact().unwrap().is_some());

    let incoming = recorder.incoming();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].from, "sip:1002@example");
    assert!(incoming[0].sdp.as_deref().unwrap().contains("RTP/AVP 0 8"));

    let call = agent.answer("sip:1002@example").await.unwrap();
    assert_eq!(call, incoming[0].call);

    let ok = expect_response(&mut agent, &mut peer).await;
    assert_eq!(ok.status, StatusCode::Ok);
    assert_eq!(ok.content_type(), Some("application/sdp"));
    assert_eq!(
        ok.to_addr().unwrap().tag(),
        ringing.to_addr().unwrap().tag()
    );
    let answer: SessionDescription = std::str::from_utf8(&ok.body).unwrap().parse().unwrap();
    assert_eq!(answer.media[0].media, "audio");
    assert_eq!(answer.media[0].formats, vec![0]);

    peer.send(in_dialog(Method::Ack, &invite, &ok, 1)).await;
    run_until(&mut agent, || recorder.media_ready(call).is_some()).await;

    let media = recorder.media_ready(call).unwrap();
    let audio = media.audio.expect("audio negotiated");
    assert_eq!(audio.codec, CodecId::Pcmu);
    assert_eq!(audio.sample_rate, 8000);
    assert_eq!(agent.call_state(call), Some(CallState::Established));
    assert_eq!(
        states(&recorder, call),
        vec![CallState::Incoming, CallState::Established]
    );
    assert!(agent.media_stats(call).is_some());
    agent.send_audio(call, &[0u8; 320], 0).await.unwrap();

    peer.send(in_dialog(Method::Bye, &invite, &ok, 2)).await;
    let bye_ok = expect_response(&mut agent, &mut peer).await;
    assert_eq!(bye_ok.status, StatusCode::Ok);
    assert_eq!(bye_ok.cseq().unwrap().method, Method::Bye);

    run_until(&mut agent, || {
        recorder.call_state(call) == Some(CallState::Terminated)
    })
    .await;
    assert!(recorder.seen().contains(&Seen::Bye(call)));
    assert_eq!(agent.call_state(call), None);
    assert!(agent.active_calls().is_empty());
    assert!(recorder.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ringing_call_cancelled() {
    let (mut agent, mut peer, recorder) = agent_with_peer(server_config(), CallAction::Ignore).await;
    register(&mut agent, &mut peer, &recorder, 3600).await;

    let call = agent.call("sip:1002@example", false).await.unwrap();
    let invite = expect_request(&mut agent, &mut peer).await;
    assert_eq!(invite.method, Method::Invite);
    assert_eq!(invite.uri.to_string(), "sip:1002@example");
    assert_eq!(invite.content_type(), Some("application/sdp"));

    reply(&mut peer, &invite, StatusCode::Trying).await;
    reply(&mut peer, &invite, StatusCode::Ringing).await;
    run_until(&mut agent, || {
        recorder.call_state(call) == Some(CallState::Ringing)
    })
    .await;

    agent.cancel(call).await.unwrap();
    let cancel = expect_request(&mut agent, &mut peer).await;
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(cancel.branch().unwrap(), invite.branch().unwrap());
    assert_eq!(cancel.cseq().unwrap().seq, invite.cseq().unwrap().seq);
    assert_eq!(cancel.cseq().unwrap().method, Method::Cancel);

    reply(&mut peer, &cancel, StatusCode::Ok).await;
    reply(&mut peer, &invite, StatusCode::RequestTerminated).await;

    let ack = expect_request(&mut agent, &mut peer).await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.branch().unwrap(), invite.branch().unwrap());

    run_until(&mut agent, || {
        recorder.call_state(call) == Some(CallState::Terminated)
    })
    .await;
    assert_eq!(
        recorder.call_states(call),
        vec![
            (CallState::Calling, None),
            (CallState::Ringing, Some(180)),
            (CallState::Terminated, Some(487)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_established_call_cannot_be_cancelled() {
    let (mut agent, mut peer, recorder) = agent_with_peer(server_config(), CallAction::Ignore).await;
    register(&mut agent, &mut peer, &recorder, 3600).await;

    let call = agent.call("1002", false).await.unwrap();
    let invite = expect_request(&mut agent, &mut peer).await;
    let contact = lws_sip_core::NameAddr::new("sip:1002@127.0.0.1:5060".parse().unwrap());
    peer.reply(&invite, StatusCode::Ok, |builder| {
        builder
            .contact(contact)
            .body("application/sdp", PCMU_ANSWER)
    })
    .await;

    let ack = expect_request(&mut agent, &mut peer).await;
    assert_eq!(ack.method, Method::Ack);
    assert_ne!(ack.branch().unwrap(), invite.branch().unwrap());
    assert_eq!(agent.call_state(call), Some(CallState::Established));

    let err = agent.cancel(call).await.unwrap_err();
    assert_eq!(err.code(), LWS_ERR_SIP_CANCEL_REJECTED);

    agent.hangup(call).await.unwrap();
    let bye = expect_request(&mut agent, &mut peer).await;
    assert_eq!(bye.method, Method::Bye);
    assert_eq!(bye.uri.to_string(), "sip:1002@127.0.0.1:5060");
    assert_eq!(agent.call_state(call), Some(CallState::Terminating));

    reply(&mut peer, &bye, StatusCode::Ok).await;
    run_until(&mut agent, || {
        recorder.call_state(call) == Some(CallState::Terminated)
    })
    .await;
    assert_eq!(
        states(&recorder, call),
        vec![
            CallState::Calling,
            CallState::Established,
            CallState::Terminating,
            CallState::Terminated,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_invite_times_out() {
    let (mut agent, mut peer, recorder) =
        agent_with_peer(direct_config("1001"), CallAction::Ignore).await;
    agent.start().await.unwrap();

    let started = Instant::now();
    let call = agent.call("sip:1002@127.0.0.1:5060", false).await.unwrap();

    let mut sent = Vec::new();
    let mut failed_at = None;
    timeout(Duration::from_secs(40), async {
        while failed_at.is_none() {
            peer.collect().await;
            while let Some(message) = peer.pop() {
                if let lws_sip_core::Message::Request(request) = message {
                    assert_eq!(request.method, Method::Invite);
                    sent.push(started.elapsed());
                }
            }
            agent.run_once(STEP).await.unwrap();
            if recorder.call_state(call) == Some(CallState::Failed) {
                failed_at = Some(started.elapsed());
            }
        }
    })
    .await
    .expect("INVITE never timed out");

    let gaps: Vec<i64> = sent
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_millis() as i64)
        .collect();
    let expected = [500, 1000, 2000, 4000, 4000, 4000, 4000, 4000];
    assert!(gaps.len() >= expected.len(), "gaps {gaps:?}");
    for (gap, want) in gaps.iter().zip(expected) {
        assert!((gap - want).abs() <= 30, "gaps {gaps:?}");
    }

    let failed_at = failed_at.unwrap().as_millis() as i64;
    assert!((failed_at - 32_000).abs() <= 50, "failed after {failed_at} ms");
    assert_eq!(
        recorder.call_states(call).last(),
        Some(&(CallState::Failed, Some(408)))
    );
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_hangup() {
    init_tracing();
    let (alice_end, bob_end) =
        ChannelTransport::pair(addr("127.0.0.1:5070"), addr("127.0.0.1:5080"));
    let alice_seen = Recorder::new(CallAction::Ignore);
    let bob_seen = Recorder::new(CallAction::Accept);

    let mut alice = Agent::with_transport(
        direct_config("alice"),
        Box::new(alice_end),
        alice_seen.clone(),
        alice_seen.clone(),
    )
    .await
    .unwrap();
    let mut bob = Agent::with_transport(
        direct_config("bob"),
        Box::new(bob_end),
        bob_seen.clone(),
        bob_seen.clone(),
    )
    .await
    .unwrap();
    alice.start().await.unwrap();
    bob.start().await.unwrap();

    let alice_call = alice.call("sip:bob@127.0.0.1:5080", false).await.unwrap();
    let step = Duration::from_millis(10);
    timeout(PATIENCE, async {
        while alice_seen.call_state(alice_call) != Some(CallState::Established)
            || bob_seen.incoming().is_empty()
        {
            alice.run_once(step).await.unwrap();
            bob.run_once(step).await.unwrap();
        }
    })
    .await
    .expect("call never established");

    let bob_call = bob_seen.incoming()[0].call;
    assert_eq!(bob.call_state(bob_call), Some(CallState::Established));

    alice.hangup(alice_call).await.unwrap();
    bob.hangup(bob_call).await.unwrap();

    timeout(PATIENCE, async {
        while alice_seen.call_state(alice_call) != Some(CallState::Terminated)
            || bob_seen.call_state(bob_call) != Some(CallState::Terminated)
        {
            alice.run_once(step).await.unwrap();
            bob.run_once(step).await.unwrap();
        }
    })
    .await
    .expect("calls never terminated");

    for (seen, call) in [(&alice_seen, alice_call), (&bob_seen, bob_call)] {
        let terminated = states(seen, call)
            .into_iter()
            .filter(|state| *state == CallState::Terminated)
            .count();
        assert_eq!(terminated, 1);
        assert!(seen.errors().is_empty(), "{:?}", seen.errors());
    }
    assert!(alice.active_calls().is_empty());
    assert!(bob.active_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hangup_before_answer_is_declined() {
    let (mut agent, mut peer, recorder) = agent_with_peer(server_config(), CallAction::Ignore).await;
    register(&mut agent, &mut peer, &recorder, 3600).await;

    let invite = invite_to_agent();
    peer.send(invite.clone()).await;
    expect_response(&mut agent, &mut peer).await;
    expect_response(&mut agent, &mut peer).await;
    let call = recorder.incoming()[0].call;

    agent.hangup(call).await.unwrap();
    let decline = expect_response(&mut agent, &mut peer).await;
    assert_eq!(decline.status, StatusCode::Decline);
    assert!(decline.header(&HeaderName::ContentType).is_none());
    peer.send(ack_for_failure(&invite, &decline)).await;

    run_until(&mut agent, || {
        recorder.call_state(call) == Some(CallState::Terminated)
    })
    .await;
    assert_eq!(
        recorder.call_states(call).last(),
        Some(&(CallState::Terminated, Some(603)))
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_ringing_call_gives_up() {
    let config = server_config().with_no_answer_timeout(30);
    let (mut agent, mut peer, recorder) = agent_with_peer(config, CallAction::Ignore).await;
    register(&mut agent, &mut peer, &recorder, 3600).await;

    let call = agent.call("1002", false).await.unwrap();
    let started = Instant::now();
    let invite = expect_request(&mut agent, &mut peer).await;
    reply(&mut peer, &invite, StatusCode::Ringing).await;
    run_until(&mut agent, || {
        recorder.call_state(call) == Some(CallState::Ringing)
    })
    .await;

    // The callee never answers, nor the CANCEL
    let cancel = expect_request(&mut agent, &mut peer).await;
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(cancel.branch().unwrap(), invite.branch().unwrap());
    let waited = started.elapsed();
    assert!(
        waited >= Duration::from_secs(30) && waited <= Duration::from_millis(30_100),
        "cancelled after {waited:?}"
    );

    run_until(&mut agent, || {
        recorder.call_state(call) == Some(CallState::Failed)
    })
    .await;
    assert_eq!(
        recorder.call_states(call),
        vec![
            (CallState::Calling, None),
            (CallState::Ringing, Some(180)),
            (CallState::Failed, Some(408)),
        ]
    );
    assert_eq!(agent.call_state(call), None);
    timeout(PATIENCE, async {
        while agent.pending_transactions() > 0 {
            agent.run_once(STEP).await.unwrap();
        }
    })
    .await
    .expect("transactions outlived the call");
}

#[tokio::test(start_paused = true)]
async fn test_second_fork_answer_is_hung_up() {
    let (mut agent, mut peer, recorder) = agent_with_peer(server_config(), CallAction::Ignore).await;
    register(&mut agent, &mut peer, &recorder, 3600).await;

    let call = agent.call("1002", false).await.unwrap();
    let invite = expect_request(&mut agent, &mut peer).await;
    let contact = lws_sip_core::NameAddr::new("sip:1002@127.0.0.1:5060".parse().unwrap());
    peer.reply(&invite, StatusCode::Ok, |builder| {
        builder
            .contact(contact.clone())
            .body("application/sdp", PCMU_ANSWER)
    })
    .await;
    let ack = expect_request(&mut agent, &mut peer).await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(agent.call_state(call), Some(CallState::Established));

    let other = lws_sip_core::builder::SimpleResponseBuilder::from_request(&invite, StatusCode::Ok, None)
        .to_tag("srv-2")
        .contact(lws_sip_core::NameAddr::new("sip:1002@127.0.0.1:5062".parse().unwrap()))
        .body("application/sdp", PCMU_ANSWER)
        .build();
    peer.send(other).await;

    let ack = expect_request(&mut agent, &mut peer).await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.to_addr().unwrap().tag(), Some("srv-2"));
    let bye = expect_request(&mut agent, &mut peer).await;
    assert_eq!(bye.method, Method::Bye);
    assert_eq!(bye.to_addr().unwrap().tag(), Some("srv-2"));
    assert_eq!(bye.uri.to_string(), "sip:1002@127.0.0.1:5062");
    reply(&mut peer, &bye, StatusCode::Ok).await;

    for _ in 0..5 {
        agent.run_once(STEP).await.unwrap();
    }
    assert_eq!(agent.call_state(call), Some(CallState::Established));
    assert_eq!(
        states(&recorder, call),
        vec![CallState::Calling, CallState::Established]
    );
}
