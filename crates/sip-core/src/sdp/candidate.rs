//! ICE candidate attribute (RFC 8839 Section 5.1)
//!
//! `a=candidate:<foundation> <component> <transport> <priority> <address> <port>
//! typ <type> [raddr <addr>] [rport <port>] *(<name> <value>)`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }

    /// RFC 8445 recommended type preference
    pub fn preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl FromStr for CandidateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            _ => Err(Error::SdpParsingError(format!("Invalid candidate type: {}", s))),
        }
    }
}

/// One ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub foundation: String,
    /// 1 = RTP, 2 = RTCP
    pub component: u16,
    pub transport: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub typ: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    pub extensions: Vec<(String, String)>,
}

impl Candidate {
    /// Host candidate with an RFC 8445 priority
    pub fn host(foundation: impl Into<String>, component: u16, address: impl Into<String>, port: u16) -> Self {
        Candidate {
            foundation: foundation.into(),
            component,
            transport: "UDP".into(),
            priority: Self::compute_priority(CandidateType::Host, 65535, component),
            address: address.into(),
            port,
            typ: CandidateType::Host,
            related_address: None,
            related_port: None,
            extensions: Vec::new(),
        }
    }

    /// `(2^24)*type_pref + (2^8)*local_pref + (256 - component)`
    pub fn compute_priority(typ: CandidateType, local_preference: u32, component: u16) -> u32 {
        (typ.preference() << 24) + ((local_preference & 0xFFFF) << 8) + (256 - u32::from(component.min(256)))
    }
}

impl FromStr for Candidate {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        let value = value.strip_prefix("candidate:").unwrap_or(value);
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 8 {
            return Err(Error::SdpParsingError(format!(
                "Invalid candidate, insufficient parts: {}",
                value
            )));
        }
        let bad = |what: &str, v: &str| Error::SdpParsingError(format!("Invalid {} in candidate: {}", what, v));

        let component = match parts[1].parse::<u16>() {
            Ok(id) if (1..=256).contains(&id) => id,
            _ => return Err(bad("component", parts[1])),
        };
        let transport = parts[2].to_string();
        if !transport.eq_ignore_ascii_case("udp") && !transport.eq_ignore_ascii_case("tcp") {
            return Err(bad("transport", parts[2]));
        }
        let priority = parts[3].parse::<u32>().map_err(|_| bad("priority", parts[3]))?;
        let port = parts[5].parse::<u16>().map_err(|_| bad("port", parts[5]))?;
        if parts[6] != "typ" {
            return Err(bad("keyword", parts[6]));
        }

        let mut candidate = Candidate {
            foundation: parts[0].to_string(),
            component,
            transport,
            priority,
            address: parts[4].to_string(),
            port,
            typ: parts[7].parse()?,
            related_address: None,
            related_port: None,
            extensions: Vec::new(),
        };

        for pair in parts[8..].chunks(2) {
            let [name, val] = pair else {
                return Err(bad("extension", pair[0]));
            };
            match *name {
                "raddr" => candidate.related_address = Some(val.to_string()),
                "rport" => candidate.related_port = Some(val.parse().map_err(|_| bad("rport", val))?),
                _ => candidate.extensions.push((name.to_string(), val.to_string())),
            }
        }
        Ok(candidate)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.typ.as_str()
        )?;
        if let Some(raddr) = &self.related_address {
            write!(f, " raddr {}", raddr)?;
        }
        if let Some(rport) = self.related_port {
            write!(f, " rport {}", rport)?;
        }
        for (name, value) in &self.extensions {
            write!(f, " {} {}", name, value)?;
        }
        Ok(())
    }
}
