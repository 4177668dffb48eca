//! Request and response builders plus identifier generators
//!
//! ```rust
//! use lws_sip_core::builder::{generate_branch, SimpleRequestBuilder, SimpleResponseBuilder};
//! use lws_sip_core::{Method, NameAddr, StatusCode, Via};
//!
//! let request = SimpleRequestBuilder::new(Method::Options, "sip:bob@example.com").unwrap()
//!     .from(NameAddr::new("sip:alice@example.com".parse().unwrap()).with_tag("a1"))
//!     .to(NameAddr::new("sip:bob@example.com".parse().unwrap()))
//!     .call_id("abc@host")
//!     .cseq(1)
//!     .via(Via::new("UDP", "10.0.0.1", Some(5060), generate_branch()))
//!     .build()
//!     .unwrap();
//!
//! let response = SimpleResponseBuilder::from_request(&request, StatusCode::Ok, None)
//!     .to_tag("b2")
//!     .build();
//! assert_eq!(response.status, StatusCode::Ok);
//! ```

mod request;
mod response;

pub use request::SimpleRequestBuilder;
pub use response::SimpleResponseBuilder;

use rand::Rng;

use crate::types::via::BRANCH_MAGIC_COOKIE;

/// Default Max-Forwards for outgoing requests
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Fresh RFC 3261 branch: magic cookie plus 128 random bits
pub fn generate_branch() -> String {
    let bits: [u8; 16] = rand::thread_rng().gen();
    format!("{}{}", BRANCH_MAGIC_COOKIE, hex::encode(bits))
}

/// Fresh From/To tag
pub fn generate_tag() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 8]>())
}

/// Fresh Call-ID, qualified with `host` when given
pub fn generate_call_id(host: Option<&str>) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    match host {
        Some(host) => format!("{}@{}", id, host),
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identifiers() {
        let branch = generate_branch();
        assert!(branch.starts_with("z9hG4bK"));
        assert_eq!(branch.len(), 7 + 32);
        assert_ne!(branch, generate_branch());

        let suffix = &branch[7..];
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));

        let tag = generate_tag();
        assert_eq!(tag.len(), 16);
        assert!(hex::decode(&tag).is_ok());
        assert_ne!(tag, generate_tag());
        assert!(generate_call_id(Some("10.0.0.1")).ends_with("@10.0.0.1"));
        assert!(!generate_call_id(None).contains('@'));
    }
}
