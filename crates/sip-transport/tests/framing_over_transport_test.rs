//! Stream transports hand raw segments to the SIP layer, which must still see
//! exactly one message per parse regardless of how TCP split the bytes.

use std::net::SocketAddr;
use std::time::Duration;

use lws_sip_core::{Message, StreamFramer};
use lws_sip_transport::{TcpTransport, Transport, TransportEvent, TransportState};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

const OPTIONS_ONE: &str = "OPTIONS sip:1001@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bK1\r\n\
From: <sip:srv@127.0.0.1>;tag=a\r\n\
To: <sip:1001@127.0.0.1>\r\n\
Call-ID: one@127.0.0.1\r\n\
CSeq: 1 OPTIONS\r\n\
Content-Length: 0\r\n\r\n";

const MESSAGE_TWO: &str = "MESSAGE sip:1001@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bK2\r\n\
From: <sip:srv@127.0.0.1>;tag=b\r\n\
To: <sip:1001@127.0.0.1>\r\n\
Call-ID: two@127.0.0.1\r\n\
CSeq: 1 MESSAGE\r\n\
Content-Type: text/plain\r\n\
Content-Length: 5\r\n\r\nhello";

#[tokio::test]
async fn test_segmented_stream_yields_whole_messages() {
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::bind(any).await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    let mut transport = TcpTransport::new(any, server_addr);
    let (connected, accepted) = tokio::join!(transport.connect(), listener.accept());
    connected.unwrap();
    let (mut server, _) = accepted.unwrap();

    // Both messages back to back, split at awkward offsets
    let wire = format!("{}{}", OPTIONS_ONE, MESSAGE_TWO);
    let bytes = wire.as_bytes();
    for chunk in [&bytes[..7], &bytes[7..150], &bytes[150..bytes.len() - 3], &bytes[bytes.len() - 3..]] {
        server.write_all(chunk).await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut framer = StreamFramer::new();
    let mut messages = Vec::new();
    while messages.len() < 2 {
        let events = transport.poll(Duration::from_secs(2)).await.unwrap();
        assert!(!events.is_empty(), "timed out waiting for data");
        for event in events {
            match event {
                TransportEvent::Received { data, .. } => {
                    framer.push(&data);
                    while let Some(message) = framer.next_message().unwrap() {
                        messages.push(message);
                    }
                }
                TransportEvent::StateChanged(state) => {
                    assert_ne!(state, TransportState::Error);
                }
            }
        }
    }

    match (&messages[0], &messages[1]) {
        (Message::Request(first), Message::Request(second)) => {
            assert_eq!(first.method.as_str(), "OPTIONS");
            assert_eq!(second.method.as_str(), "MESSAGE");
            assert_eq!(&second.body[..], b"hello");
        }
        other => panic!("unexpected messages: {:?}", other),
    }
    assert_eq!(framer.buffered(), 0);
}
