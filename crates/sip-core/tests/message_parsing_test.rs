//! Parsing and serialization of complete messages

use bytes::Bytes;
use lws_sip_core::builder::{generate_branch, SimpleRequestBuilder, SimpleResponseBuilder};
use lws_sip_core::{
    parse_message, Error, HeaderName, Message, Method, NameAddr, SipMessage, StatusCode, Uri, Via,
    MAX_BRANCH_LEN,
};

const INVITE: &str = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:alice@pc33.atlanta.com>\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 4\r\n\
\r\n\
v=0\n";

#[test]
fn test_parse_invite() {
    let message = parse_message(INVITE.as_bytes()).unwrap();
    let request = message.as_request().unwrap();

    assert_eq!(request.method, Method::Invite);
    assert_eq!(request.uri.to_string(), "sip:bob@biloxi.com");
    assert_eq!(request.max_forwards(), Some(70));
    assert_eq!(request.from_addr().unwrap().tag(), Some("1928301774"));
    assert_eq!(request.to_addr().unwrap().tag(), None);
    assert_eq!(request.cseq().unwrap().seq, 314159);
    assert_eq!(request.branch().unwrap(), "z9hG4bK776asdhds");
    assert_eq!(request.body, Bytes::from_static(b"v=0\n"));
    request.validate().unwrap();
}

#[test]
fn test_serialize_then_parse_is_equivalent() {
    let original = parse_message(INVITE.as_bytes()).unwrap();
    let reparsed = parse_message(&original.to_bytes()).unwrap();
    assert_eq!(reparsed, original);

    let request = reparsed.as_request().unwrap();
    let headers: Vec<_> = request.headers.iter().map(|h| h.name.to_string()).collect();
    assert_eq!(
        headers,
        vec![
            "Via", "Max-Forwards", "To", "From", "Call-ID", "CSeq", "Contact", "Content-Type",
            "Content-Length"
        ]
    );
}

#[test]
fn test_compact_forms_and_folding() {
    let raw = "OPTIONS sip:carol@chicago.com SIP/2.0\r\n\
v: SIP/2.0/TCP host.example.com:5070;branch=z9hG4bKnashds7\r\n\
f: <sip:alice@atlanta.com>;tag=xyz\r\n\
t: <sip:carol@chicago.com>\r\n\
i: folded-call\r\n\
Subject: first part\r\n\
\tsecond part\r\n\
CSeq: 7 OPTIONS\r\n\
l: 0\r\n\r\n";

    let message = parse_message(raw.as_bytes()).unwrap();
    let via = message.top_via().unwrap();
    assert_eq!(via.transport, "TCP");
    assert_eq!(via.port, Some(5070));
    assert_eq!(message.call_id().unwrap(), "folded-call");
    assert_eq!(
        message.header(&HeaderName::Subject),
        Some("first part second part")
    );

    let serialized = String::from_utf8(message.to_bytes().to_vec()).unwrap();
    assert!(serialized.contains("\r\nVia: SIP/2.0/TCP"));
    assert!(serialized.contains("\r\nFrom: <sip:alice@atlanta.com>;tag=xyz"));
    assert!(serialized.contains("\r\nCall-ID: folded-call"));
}

#[test]
fn test_comma_separated_vias_are_expanded() {
    let raw = "SIP/2.0 200 OK\r\n\
Via: SIP/2.0/UDP a.example.com;branch=z9hG4bK1, SIP/2.0/UDP b.example.com;branch=z9hG4bK2\r\n\
Via: SIP/2.0/UDP c.example.com;branch=z9hG4bK3\r\n\
From: <sip:a@x>;tag=1\r\n\
To: <sip:b@y>;tag=2\r\n\
Call-ID: c\r\n\
CSeq: 1 INVITE\r\n\
Content-Length: 0\r\n\r\n";
    let message = parse_message(raw.as_bytes()).unwrap();
    let vias = message.vias().unwrap();
    let hosts: Vec<_> = vias.iter().map(|v| v.host.as_str()).collect();
    assert_eq!(hosts, vec!["a.example.com", "b.example.com", "c.example.com"]);

    let response = message.as_response().unwrap();
    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.reason, "OK");
}

#[test]
fn test_authenticate_header_is_not_split() {
    let raw = "SIP/2.0 401 Unauthorized\r\n\
Via: SIP/2.0/UDP a.example.com;branch=z9hG4bK1\r\n\
From: <sip:a@x>;tag=1\r\n\
To: <sip:a@x>;tag=2\r\n\
Call-ID: c\r\n\
CSeq: 1 REGISTER\r\n\
WWW-Authenticate: Digest realm=\"x\", nonce=\"abc\", qop=\"auth\"\r\n\
Content-Length: 0\r\n\r\n";
    let message = parse_message(raw.as_bytes()).unwrap();
    let values: Vec<_> = message
        .headers()
        .get_all(&HeaderName::WwwAuthenticate)
        .collect();
    assert_eq!(values, vec!["Digest realm=\"x\", nonce=\"abc\", qop=\"auth\""]);
}

#[test]
fn test_branch_length_limit() {
    let longest = format!("z9hG4bK{}", "a".repeat(MAX_BRANCH_LEN - 7));
    let via: Via = format!("SIP/2.0/UDP host;branch={}", longest).parse().unwrap();
    assert_eq!(via.branch(), Some(longest.as_str()));

    let too_long = format!("SIP/2.0/UDP host;branch={}a", longest);
    assert!(too_long.parse::<Via>().is_err());
}

#[test]
fn test_datagram_body_without_content_length() {
    let raw = "MESSAGE sip:bob@b SIP/2.0\r\n\
Via: SIP/2.0/UDP a;branch=z9hG4bK1\r\n\
From: <sip:a@a>;tag=1\r\n\
To: <sip:bob@b>\r\n\
Call-ID: m\r\n\
CSeq: 1 MESSAGE\r\n\r\n\
hello";
    let message = parse_message(raw.as_bytes()).unwrap();
    assert_eq!(message.body().as_ref(), b"hello");
}

#[test]
fn test_truncated_body_is_rejected() {
    let raw = INVITE.replace("Content-Length: 4", "Content-Length: 40");
    assert!(matches!(
        parse_message(raw.as_bytes()),
        Err(Error::TruncatedBody { expected: 40, actual: 4 })
    ));
}

#[test]
fn test_malformed_messages() {
    assert!(parse_message(b"").is_err());
    assert!(parse_message(b"\r\n\r\n").is_err());
    assert!(parse_message(b"INVITE sip:bob@b SIP/2.0\r\nVia SIP/2.0/UDP a\r\n\r\n").is_err());
    assert!(parse_message(b"SIP/2.0 99 Low\r\n\r\n").is_err());
    assert!(matches!(
        parse_message(b"SIP/3.0 200 OK\r\n\r\n"),
        Err(Error::InvalidVersion(_))
    ));
}

#[test]
fn test_builders_produce_valid_messages() {
    let alice: Uri = "sip:alice@atlanta.com".parse().unwrap();
    let bob: Uri = "sip:bob@biloxi.com".parse().unwrap();
    let request = SimpleRequestBuilder::with_uri(Method::Invite, bob.clone())
        .from(NameAddr::new(alice.clone()).with_display_name("Alice").with_tag("t1"))
        .to(NameAddr::new(bob))
        .call_id("call-1")
        .cseq(5)
        .via(Via::new("UDP", "10.0.0.1", Some(5060), generate_branch()))
        .contact(NameAddr::new(alice))
        .body("application/sdp", "v=0\r\n")
        .build()
        .unwrap();
    request.validate().unwrap();
    assert_eq!(request.max_forwards(), Some(70));
    assert_eq!(request.cseq().unwrap().method, Method::Invite);

    let response = SimpleResponseBuilder::from_request(&request, StatusCode::Ringing, None)
        .to_tag("t2")
        .build();
    response.validate().unwrap();
    assert_eq!(response.to_addr().unwrap().tag(), Some("t2"));
    assert_eq!(response.call_id().unwrap(), "call-1");
    assert_eq!(response.branch().unwrap(), request.branch().unwrap());

    let message: Message = parse_message(&response.to_bytes()).unwrap();
    assert_eq!(message.as_response().unwrap().status, StatusCode::Ringing);
    assert_eq!(message.content_length(), Some(0));
    assert_eq!(message.to_addr().unwrap(), response.to_addr().unwrap());
}

#[test]
fn test_builder_rejects_missing_headers() {
    let result = SimpleRequestBuilder::new(Method::Options, "sip:x@y")
        .unwrap()
        .call_id("c")
        .build();
    assert!(matches!(result, Err(Error::BuildError(_))));
}
