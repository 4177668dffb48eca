//! HTTP Digest authentication for SIP (RFC 2617, RFC 7616, RFC 8760)
//!
//! [`Challenge`] parses WWW-Authenticate / Proxy-Authenticate values,
//! [`DigestResponse`] produces Authorization / Proxy-Authorization values.
//!
//! ```rust
//! use lws_sip_core::auth::{Challenge, DigestResponse};
//!
//! let challenge: Challenge =
//!     r#"Digest realm="example.com", nonce="abc123", qop="auth", algorithm=MD5"#
//!         .parse()
//!         .unwrap();
//! let answer = DigestResponse::answer(
//!     &challenge, "alice", "secret", "REGISTER", "sip:example.com", b"", 1, Some("0a4f113b"),
//! ).unwrap();
//! assert!(answer.to_string().starts_with("Digest username=\"alice\""));
//! ```

mod challenge;
mod digest;

pub use challenge::{parse_auth_params, AuthScheme, Challenge};
pub use digest::{
    compute_ha1, compute_response, generate_cnonce, Algorithm, DigestResponse, Qop,
};
