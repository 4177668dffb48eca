//! Start lines, header blocks and complete messages

use std::str::FromStr;

use bytes::Bytes;
use nom::{
    bytes::complete::{tag_no_case, take_till1, take_while_m_n},
    character::complete::{space0, space1},
    combinator::{all_consuming, map_res, rest},
    sequence::{preceded, tuple},
};
use tracing::trace;

use super::common::{split_list, token, ParseResult};
use super::uri::parse_uri;
use crate::error::{Error, Result};
use crate::types::header::{Header, HeaderName, Headers};
use crate::types::message::{Message, Request, Response};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;

/// Largest message accepted from a stream transport
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// First line of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request(Method, Uri),
    Response(StatusCode, String),
}

/// Outcome of [`parse_incremental`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A full message and the number of input bytes it used, leading
    /// keep-alive CRLFs included
    Complete { message: Message, consumed: usize },
    /// The input ends before the message does
    Incomplete,
}

fn request_line(input: &str) -> ParseResult<(Method, Uri)> {
    let (input, (method, _, uri, _, _)) = tuple((
        map_res(token, Method::from_str),
        space1,
        map_res(take_till1(|c: char| c == ' '), parse_uri),
        space1,
        tag_no_case("SIP/2.0"),
    ))(input)?;
    Ok((input, (method, uri)))
}

fn status_line(input: &str) -> ParseResult<(StatusCode, String)> {
    let (input, (_, _, status, reason)) = tuple((
        tag_no_case("SIP/2.0"),
        space1,
        map_res(
            take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
            StatusCode::from_str,
        ),
        preceded(space0, rest),
    ))(input)?;
    Ok((input, (status, reason.trim().to_string())))
}

/// Parse a request or status line (without its line terminator)
pub fn parse_start_line(line: &str) -> Result<StartLine> {
    if line.len() >= 4 && line[..4].eq_ignore_ascii_case("SIP/") {
        if !line.to_ascii_uppercase().starts_with("SIP/2.0") {
            return Err(Error::InvalidVersion(line.split(' ').next().unwrap_or(line).into()));
        }
        let (_, (status, reason)) = all_consuming(status_line)(line)
            .map_err(|_| Error::ParseError(format!("Invalid status line: {}", line)))?;
        Ok(StartLine::Response(status, reason))
    } else {
        let (_, (method, uri)) = all_consuming(request_line)(line.trim_end())
            .map_err(|_| Error::ParseError(format!("Invalid request line: {}", line)))?;
        Ok(StartLine::Request(method, uri))
    }
}

/// Join folded continuation lines onto the line they continue
fn unfold_lines(block: &str) -> Result<Vec<String>> {
    let mut lines: Vec<String> = Vec::new();
    for raw in block.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let previous = lines
                .last_mut()
                .ok_or_else(|| Error::ParseError("Continuation line without header".into()))?;
            previous.push(' ');
            previous.push_str(line.trim());
        } else {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

/// Parse the header block that follows the start line.
///
/// Folded lines are joined, compact names are expanded, and list headers
/// (Via, Contact, Route, ...) are split into one entry per value.
pub fn parse_headers(block: &str) -> Result<Headers> {
    let mut headers = Vec::new();
    for line in unfold_lines(block)? {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::ParseError(format!("Header without colon: {}", line)))?;
        let name = HeaderName::from_str(name.trim_end())?;
        let value = value.trim();
        if name.is_list() {
            let items = split_list(value);
            if items.is_empty() {
                headers.push(Header::new(name.clone(), ""));
            }
            for item in items {
                headers.push(Header::new(name.clone(), item));
            }
        } else {
            headers.push(Header::new(name, value));
        }
    }
    Ok(headers.into_iter().collect())
}

/// Locate the blank line ending the head; returns (head length, body offset)
fn find_head_end(data: &[u8]) -> Option<(usize, usize)> {
    let crlf = data.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = data.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => Some((l, l + 2)),
        (Some(c), _) => Some((c, c + 4)),
        (None, Some(l)) => Some((l, l + 2)),
        (None, None) => None,
    }
}

fn parse_head(head: &[u8]) -> Result<(StartLine, Headers)> {
    let text = std::str::from_utf8(head)
        .map_err(|e| Error::ParseError(format!("Head is not UTF-8: {}", e)))?;
    let (first, block) = match text.find('\n') {
        Some(pos) => (&text[..pos], &text[pos + 1..]),
        None => (text, ""),
    };
    let start = parse_start_line(first.strip_suffix('\r').unwrap_or(first))?;
    let headers = parse_headers(block)?;
    Ok((start, headers))
}

fn declared_length(headers: &Headers) -> Result<Option<usize>> {
    headers
        .get(&HeaderName::ContentLength)
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| Error::header("Content-Length", v))
        })
        .transpose()
}

fn assemble(start: StartLine, headers: Headers, body: Bytes) -> Message {
    match start {
        StartLine::Request(method, uri) => Message::Request(Request {
            method,
            uri,
            headers,
            body,
        }),
        StartLine::Response(status, reason) => Message::Response(Response {
            status,
            reason,
            headers,
            body,
        }),
    }
}

fn skip_keepalive(data: &[u8]) -> usize {
    data.iter().take_while(|b| **b == b'\r' || **b == b'\n').count()
}

/// Parse a complete message from a datagram.
///
/// Without Content-Length the body is the rest of the datagram. Bytes past
/// the declared length are ignored.
pub fn parse_message(data: &[u8]) -> Result<Message> {
    let skip = skip_keepalive(data);
    let data = &data[skip..];
    if data.is_empty() {
        return Err(Error::ParseError("Empty message".into()));
    }
    let (head_len, body_start) = find_head_end(data)
        .ok_or_else(|| Error::ParseError("Missing blank line after headers".into()))?;
    let (start, headers) = parse_head(&data[..head_len])?;

    let available = data.len() - body_start;
    let body_len = match declared_length(&headers)? {
        Some(len) if len > available => {
            return Err(Error::TruncatedBody {
                expected: len,
                actual: available,
            })
        }
        Some(len) => len,
        None => available,
    };
    let body = Bytes::copy_from_slice(&data[body_start..body_start + body_len]);
    Ok(assemble(start, headers, body))
}

/// Try to parse one message from the front of a stream buffer.
///
/// A missing Content-Length means an empty body. Leading CRLF keep-alives
/// are consumed. Messages larger than `max_size` are rejected.
pub fn parse_incremental(data: &[u8], max_size: usize) -> Result<Parsed> {
    let skip = skip_keepalive(data);
    let frame = &data[skip..];
    if frame.is_empty() {
        return Ok(Parsed::Incomplete);
    }

    let Some((head_len, body_start)) = find_head_end(frame) else {
        if frame.len() > max_size {
            return Err(Error::MessageTooLarge(frame.len()));
        }
        return Ok(Parsed::Incomplete);
    };

    let (start, headers) = parse_head(&frame[..head_len])?;
    let body_len = declared_length(&headers)?.unwrap_or(0);
    let total = body_start + body_len;
    if total > max_size {
        return Err(Error::MessageTooLarge(total));
    }
    if frame.len() < total {
        trace!(have = frame.len(), need = total, "Waiting for more body bytes");
        return Ok(Parsed::Incomplete);
    }

    let body = Bytes::copy_from_slice(&frame[body_start..total]);
    Ok(Parsed::Complete {
        message: assemble(start, headers, body),
        consumed: skip + total,
    })
}

impl FromStr for Message {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_message(s.as_bytes())
    }
}
