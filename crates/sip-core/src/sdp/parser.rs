//! Line-oriented SDP parser (RFC 8866)
//!
//! Each line is `<type>=<value>`. Lines before the first `m=` belong to the
//! session, the rest to the most recent media section. Unknown line types
//! are ignored.

use nom::{
    bytes::complete::take_while_m_n,
    character::complete::{char, not_line_ending},
    combinator::{all_consuming, map},
    sequence::separated_pair,
    IResult,
};

use super::media::{Attribute, MediaDescription};
use super::session::{Connection, Origin, SessionDescription};
use crate::error::{Error, Result};

/// Split one line into its type character and value
pub fn parse_sdp_line(input: &str) -> IResult<&str, (char, &str)> {
    separated_pair(
        map(take_while_m_n(1, 1, |c: char| c.is_ascii_alphabetic()), |s: &str| {
            s.chars().next().unwrap_or_default()
        }),
        char('='),
        not_line_ending,
    )(input)
}

fn parse_attribute(value: &str) -> Attribute {
    match value.split_once(':') {
        Some((name, value)) => Attribute::new(name.trim(), value.trim()),
        None => Attribute::flag(value.trim()),
    }
}

fn parse_bandwidth(value: &str) -> Result<(String, u32)> {
    let (kind, amount) = value
        .split_once(':')
        .ok_or_else(|| Error::SdpParsingError(format!("Invalid bandwidth: {}", value)))?;
    let amount = amount
        .trim()
        .parse()
        .map_err(|_| Error::SdpParsingError(format!("Invalid bandwidth: {}", value)))?;
    Ok((kind.trim().to_string(), amount))
}

fn parse_media_line(value: &str) -> Result<MediaDescription> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::SdpParsingError(format!("Invalid media line: {}", value)));
    }
    // port may carry a "/<count>" suffix
    let port = parts[1]
        .split('/')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| Error::SdpParsingError(format!("Invalid media port: {}", parts[1])))?;
    let mut media = MediaDescription::new(parts[0], port, parts[2]);
    for format in &parts[3..] {
        match format.parse::<u8>() {
            Ok(pt) => media.formats.push(pt),
            // non-RTP formats (e.g. webrtc-datachannel) carry no payload type
            Err(_) => continue,
        }
    }
    Ok(media)
}

fn parse_timing(value: &str) -> Result<(u64, u64)> {
    let mut parts = value.split_whitespace().map(str::parse::<u64>);
    match (parts.next(), parts.next()) {
        (Some(Ok(start)), Some(Ok(stop))) => Ok((start, stop)),
        _ => Err(Error::SdpParsingError(format!("Invalid timing: {}", value))),
    }
}

/// Parse a complete session description
pub fn parse_sdp(input: &str) -> Result<SessionDescription> {
    let mut version = None;
    let mut origin = None;
    let mut session_name = None;
    let mut connection = None;
    let mut bandwidth = Vec::new();
    let mut timing = (0, 0);
    let mut attributes = Vec::new();
    let mut media: Vec<MediaDescription> = Vec::new();

    for raw in input.lines() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }
        let (_, (kind, value)) = all_consuming(parse_sdp_line)(line)
            .map_err(|_| Error::SdpParsingError(format!("Malformed line: {}", line)))?;

        match (kind, media.last_mut()) {
            ('v', None) => {
                version = Some(value.trim().parse::<u8>().map_err(|_| {
                    Error::SdpParsingError(format!("Invalid version: {}", value))
                })?)
            }
            ('o', None) => origin = Some(value.parse::<Origin>()?),
            ('s', None) => session_name = Some(value.to_string()),
            ('c', None) => connection = Some(value.parse::<Connection>()?),
            ('c', Some(current)) => current.connection = Some(value.parse()?),
            ('b', None) => bandwidth.push(parse_bandwidth(value)?),
            ('b', Some(current)) => current.bandwidth.push(parse_bandwidth(value)?),
            ('t', None) => timing = parse_timing(value)?,
            ('a', None) => attributes.push(parse_attribute(value)),
            ('a', Some(current)) => current.attributes.push(parse_attribute(value)),
            ('m', _) => media.push(parse_media_line(value)?),
            _ => {}
        }
    }

    let session = SessionDescription {
        version: version.ok_or_else(|| Error::SdpParsingError("Missing v= line".into()))?,
        origin: origin.ok_or_else(|| Error::SdpParsingError("Missing o= line".into()))?,
        session_name: session_name.unwrap_or_else(|| "-".into()),
        connection,
        bandwidth,
        timing,
        attributes,
        media,
    };
    Ok(session)
}
