//! Media-level description (`m=` section) and the attributes it carries

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::candidate::Candidate;
use super::session::Connection;
use crate::error::{Error, Result};

/// Generic `a=name[:value]` attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Attribute {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Attribute {
            name: name.into(),
            value: None,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "a={}:{}", self.name, value),
            None => write!(f, "a={}", self.name),
        }
    }
}

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        }
    }

    /// Direction to answer with when the peer offered `self`
    pub fn reverse(&self) -> Direction {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => *other,
        }
    }

    fn from_attribute(name: &str) -> Option<Direction> {
        match name {
            "sendrecv" => Some(Direction::SendRecv),
            "sendonly" => Some(Direction::SendOnly),
            "recvonly" => Some(Direction::RecvOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }
}

/// `a=rtpmap:<pt> <encoding>/<clock>[/<channels>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

impl FromStr for RtpMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::SdpParsingError(format!("Invalid rtpmap: {}", s));
        let (pt, rest) = s.trim().split_once(' ').ok_or_else(bad)?;
        let mut parts = rest.trim().split('/');
        let encoding = parts.next().filter(|e| !e.is_empty()).ok_or_else(bad)?;
        let clock_rate = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(bad)?;
        let channels = parts.next().map(|c| c.parse()).transpose().map_err(|_| bad())?;
        Ok(RtpMap {
            payload_type: pt.parse().map_err(|_| bad())?,
            encoding: encoding.to_string(),
            clock_rate,
            channels,
        })
    }
}

impl fmt::Display for RtpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.payload_type, self.encoding, self.clock_rate)?;
        if let Some(channels) = self.channels {
            write!(f, "/{}", channels)?;
        }
        Ok(())
    }
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescription {
    /// `audio`, `video`, ...
    pub media: String,
    pub port: u16,
    pub protocol: String,
    /// Payload types in preference order
    pub formats: Vec<u8>,
    pub connection: Option<Connection>,
    pub bandwidth: Vec<(String, u32)>,
    pub attributes: Vec<Attribute>,
}

impl MediaDescription {
    pub fn new(media: impl Into<String>, port: u16, protocol: impl Into<String>) -> Self {
        MediaDescription {
            media: media.into(),
            port,
            protocol: protocol.into(),
            formats: Vec::new(),
            connection: None,
            bandwidth: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// First value of attribute `name`
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .and_then(|a| a.value.as_deref())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Every parseable `a=rtpmap`
    pub fn rtpmaps(&self) -> Vec<RtpMap> {
        self.attributes
            .iter()
            .filter(|a| a.name == "rtpmap")
            .filter_map(|a| a.value.as_deref()?.parse().ok())
            .collect()
    }

    pub fn rtpmap(&self, payload_type: u8) -> Option<RtpMap> {
        self.rtpmaps()
            .into_iter()
            .find(|m| m.payload_type == payload_type)
    }

    /// Format parameters for `payload_type`
    pub fn fmtp(&self, payload_type: u8) -> Option<&str> {
        self.attributes
            .iter()
            .filter(|a| a.name == "fmtp")
            .filter_map(|a| a.value.as_deref())
            .find_map(|v| {
                let (pt, params) = v.split_once(' ')?;
                (pt.parse::<u8>().ok()? == payload_type).then_some(params.trim())
            })
    }

    /// Explicit direction attribute, or sendrecv
    pub fn direction(&self) -> Direction {
        self.attributes
            .iter()
            .find_map(|a| Direction::from_attribute(&a.name))
            .unwrap_or_default()
    }

    /// Replace any direction attribute with `direction`
    pub fn set_direction(&mut self, direction: Direction) {
        self.attributes
            .retain(|a| Direction::from_attribute(&a.name).is_none());
        self.attributes.push(Attribute::flag(direction.as_str()));
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.attributes
            .iter()
            .filter(|a| a.name == "candidate")
            .filter_map(|a| a.value.as_deref()?.parse().ok())
            .collect()
    }

    /// RTCP port from `a=rtcp`, or RTP port + 1
    pub fn rtcp_port(&self) -> u16 {
        self.attribute("rtcp")
            .and_then(|v| v.split_whitespace().next()?.parse().ok())
            .unwrap_or_else(|| self.port.saturating_add(1))
    }

    /// Port 0 means the stream was declined
    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {} {}", self.media, self.port, self.protocol)?;
        for format in &self.formats {
            write!(f, " {}", format)?;
        }
        f.write_str("\r\n")?;
        if let Some(connection) = &self.connection {
            write!(f, "{}\r\n", connection)?;
        }
        for (kind, value) in &self.bandwidth {
            write!(f, "b={}:{}\r\n", kind, value)?;
        }
        for attribute in &self.attributes {
            write!(f, "{}\r\n", attribute)?;
        }
        Ok(())
    }
}
