//! Session-level description

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::media::{Attribute, MediaDescription};
use crate::error::{Error, Result};

/// `o=<username> <sess-id> <sess-version> IN <addrtype> <address>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl Origin {
    pub fn new(username: impl Into<String>, session_id: u64, address: impl Into<String>) -> Self {
        let address = address.into();
        Origin {
            username: username.into(),
            session_id,
            session_version: session_id,
            net_type: "IN".into(),
            addr_type: addr_type_of(&address).into(),
            address,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "o={} {} {} {} {} {}",
            self.username,
            self.session_id,
            self.session_version,
            self.net_type,
            self.addr_type,
            self.address
        )
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let [username, id, version, net_type, addr_type, address] = parts[..] else {
            return Err(Error::SdpParsingError(format!("Invalid origin: {}", s)));
        };
        let number = |v: &str| {
            v.parse::<u64>()
                .map_err(|_| Error::SdpParsingError(format!("Invalid origin number: {}", v)))
        };
        Ok(Origin {
            username: username.to_string(),
            session_id: number(id)?,
            session_version: number(version)?,
            net_type: net_type.to_string(),
            addr_type: addr_type.to_string(),
            address: address.to_string(),
        })
    }
}

/// `c=IN <addrtype> <address>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl Connection {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Connection {
            net_type: "IN".into(),
            addr_type: addr_type_of(&address).into(),
            address,
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c={} {} {}", self.net_type, self.addr_type, self.address)
    }
}

impl FromStr for Connection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let [net_type, addr_type, address] = parts[..] else {
            return Err(Error::SdpParsingError(format!("Invalid connection: {}", s)));
        };
        // drop any multicast TTL / count suffix
        let address = address.split('/').next().unwrap_or(address);
        Ok(Connection {
            net_type: net_type.to_string(),
            addr_type: addr_type.to_string(),
            address: address.to_string(),
        })
    }
}

fn addr_type_of(address: &str) -> &'static str {
    if address.contains(':') {
        "IP6"
    } else {
        "IP4"
    }
}

/// A complete session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub version: u8,
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<Connection>,
    pub bandwidth: Vec<(String, u32)>,
    /// `t=<start> <stop>`
    pub timing: (u64, u64),
    pub attributes: Vec<Attribute>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn new(origin: Origin, session_name: impl Into<String>) -> Self {
        SessionDescription {
            version: 0,
            origin,
            session_name: session_name.into(),
            connection: None,
            bandwidth: Vec::new(),
            timing: (0, 0),
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }

    /// Session-level attribute value
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.value.as_deref())
    }

    /// Media-level value, falling back to session level
    pub fn media_attribute<'a>(&'a self, media: &'a MediaDescription, name: &str) -> Option<&'a str> {
        media.attribute(name).or_else(|| self.attribute(name))
    }

    /// Connection address for `media`, falling back to the session `c=`
    pub fn connection_address<'a>(&'a self, media: &'a MediaDescription) -> Option<&'a str> {
        media
            .connection
            .as_ref()
            .or(self.connection.as_ref())
            .map(|c| c.address.as_str())
    }

    /// First stream of the given kind (`audio`, `video`)
    pub fn media_of(&self, kind: &str) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.media == kind)
    }

    /// ICE credentials for `media` (`ice-ufrag`, `ice-pwd`)
    pub fn ice_credentials(&self, media: &MediaDescription) -> Option<(String, String)> {
        let ufrag = self.media_attribute(media, "ice-ufrag")?;
        let pwd = self.media_attribute(media, "ice-pwd")?;
        Some((ufrag.to_string(), pwd.to_string()))
    }

    /// Check the fields every description needs
    pub fn validate(&self) -> Result<()> {
        if self.version != 0 {
            return Err(Error::SdpParsingError(format!(
                "Unsupported SDP version {}",
                self.version
            )));
        }
        for media in &self.media {
            if !media.is_rejected() && self.connection_address(media).is_none() {
                return Err(Error::SdpParsingError(format!(
                    "No connection address for {} stream",
                    media.media
                )));
            }
        }
        Ok(())
    }

    /// Serialize with CRLF line endings
    pub fn to_sdp_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(f, "{}\r\n", self.origin)?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(connection) = &self.connection {
            write!(f, "{}\r\n", connection)?;
        }
        for (kind, value) in &self.bandwidth {
            write!(f, "b={}:{}\r\n", kind, value)?;
        }
        write!(f, "t={} {}\r\n", self.timing.0, self.timing.1)?;
        for attribute in &self.attributes {
            write!(f, "{}\r\n", attribute)?;
        }
        for media in &self.media {
            write!(f, "{}", media)?;
        }
        Ok(())
    }
}

impl FromStr for SessionDescription {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        super::parser::parse_sdp(s)
    }
}
