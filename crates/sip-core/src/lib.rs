//! # LWS SIP Core
//!
//! Message model, parser and serializer for the Session Initiation Protocol
//! (RFC 3261), plus the pieces of SDP (RFC 8866) and HTTP Digest
//! authentication (RFC 2617 / 7616) a user agent needs.
//!
//! ## Parsing
//!
//! ```rust
//! use lws_sip_core::{parse_message, Method, SipMessage};
//!
//! let raw = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
//!     v: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
//!     Max-Forwards: 70\r\n\
//!     t: Bob <sip:bob@biloxi.com>\r\n\
//!     f: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
//!     i: a84b4c76e66710@pc33.atlanta.com\r\n\
//!     CSeq: 314159 INVITE\r\n\
//!     l: 0\r\n\r\n";
//!
//! let message = parse_message(raw).unwrap();
//! let request = message.as_request().unwrap();
//! assert_eq!(request.method, Method::Invite);
//! assert_eq!(request.call_id().unwrap(), "a84b4c76e66710@pc33.atlanta.com");
//! ```
//!
//! Stream transports feed bytes into a [`StreamFramer`], which yields one
//! message at a time regardless of how the stream was segmented.

pub mod auth;
pub mod builder;
pub mod error;
pub mod parser;
#[cfg(feature = "sdp")]
pub mod sdp;
pub mod types;

pub use error::{Error, Result};
pub use parser::{parse_message, parse_incremental, Parsed, StreamFramer, MAX_MESSAGE_SIZE};
pub use types::*;

/// Commonly used items
pub mod prelude {
    pub use crate::auth::{Algorithm, Challenge, DigestResponse, Qop};
    pub use crate::builder::{
        generate_branch, generate_call_id, generate_tag, SimpleRequestBuilder,
        SimpleResponseBuilder,
    };
    pub use crate::error::{Error, Result};
    pub use crate::parser::{parse_message, StreamFramer};
    #[cfg(feature = "sdp")]
    pub use crate::sdp::{MediaDescription, SessionDescription};
    pub use crate::types::*;
}
