//! # Via header
//!
//! ```rust
//! use lws_sip_core::Via;
//!
//! let via: Via = "SIP/2.0/UDP pc33.atlanta.com:5066;branch=z9hG4bK776asdhds;rport"
//!     .parse()
//!     .unwrap();
//! assert_eq!(via.transport, "UDP");
//! assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
//! assert!(via.is_rfc3261_branch());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::param::{find_param, set_param, write_params, Param};

/// Magic cookie that starts every RFC 3261 branch
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Longest branch value accepted by the parser
pub const MAX_BRANCH_LEN: usize = 255;

/// A single Via entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    /// Transport token, upper-case (`UDP`, `TCP`, `TLS`, ...)
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<Param>,
}

impl Via {
    pub fn new(
        transport: impl Into<String>,
        host: impl Into<String>,
        port: Option<u16>,
        branch: impl Into<String>,
    ) -> Self {
        Via {
            transport: transport.into().to_ascii_uppercase(),
            host: host.into(),
            port,
            params: vec![Param::new("branch", branch)],
        }
    }

    pub fn branch(&self) -> Option<&str> {
        find_param(&self.params, "branch").flatten()
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        set_param(&mut self.params, Param::new("branch", branch));
    }

    /// Branch starts with the RFC 3261 magic cookie
    pub fn is_rfc3261_branch(&self) -> bool {
        self.branch()
            .map(|b| b.starts_with(BRANCH_MAGIC_COOKIE))
            .unwrap_or(false)
    }

    pub fn received(&self) -> Option<&str> {
        find_param(&self.params, "received").flatten()
    }

    /// `rport` value; `Some(None)` when the flag is present without a value
    pub fn rport(&self) -> Option<Option<u16>> {
        find_param(&self.params, "rport").map(|v| v.and_then(|p| p.parse().ok()))
    }

    /// `sent-by` as `host[:port]`
    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn with_param(mut self, param: Param) -> Self {
        set_param(&mut self.params, param);
        self
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by())?;
        write_params(f, &self.params)
    }
}

impl FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        crate::parser::via::parse_via(s)
    }
}
