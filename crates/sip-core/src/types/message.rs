//! SIP requests, responses and typed header access

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::address::NameAddr;
use crate::types::cseq::CSeq;
use crate::types::header::{HeaderName, Headers};
use crate::types::method::Method;
use crate::types::status::StatusCode;
use crate::types::uri::Uri;
use crate::types::via::Via;

/// Only protocol version spoken
pub const SIP_VERSION: &str = "SIP/2.0";

/// Typed accessors shared by requests and responses
pub trait SipMessage {
    fn headers(&self) -> &Headers;
    fn headers_mut(&mut self) -> &mut Headers;
    fn body(&self) -> &Bytes;

    fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers().get(name)
    }

    fn call_id(&self) -> Result<&str> {
        self.header(&HeaderName::CallId)
            .ok_or_else(|| Error::MissingHeader("Call-ID".into()))
    }

    fn cseq(&self) -> Result<CSeq> {
        self.header(&HeaderName::CSeq)
            .ok_or_else(|| Error::MissingHeader("CSeq".into()))?
            .parse()
    }

    /// From header
    fn from_addr(&self) -> Result<NameAddr> {
        self.header(&HeaderName::From)
            .ok_or_else(|| Error::MissingHeader("From".into()))?
            .parse()
    }

    /// To header
    fn to_addr(&self) -> Result<NameAddr> {
        self.header(&HeaderName::To)
            .ok_or_else(|| Error::MissingHeader("To".into()))?
            .parse()
    }

    /// Topmost Via
    fn top_via(&self) -> Result<Via> {
        self.header(&HeaderName::Via)
            .ok_or_else(|| Error::MissingHeader("Via".into()))?
            .parse()
    }

    /// All Via entries, topmost first
    fn vias(&self) -> Result<Vec<Via>> {
        self.headers()
            .get_all(&HeaderName::Via)
            .map(str::parse)
            .collect()
    }

    /// First Contact, if any
    fn contact(&self) -> Result<Option<NameAddr>> {
        self.header(&HeaderName::Contact).map(str::parse).transpose()
    }

    fn record_routes(&self) -> Result<Vec<NameAddr>> {
        self.headers()
            .get_all(&HeaderName::RecordRoute)
            .map(str::parse)
            .collect()
    }

    fn expires(&self) -> Option<u32> {
        self.header(&HeaderName::Expires)
            .and_then(|v| v.trim().parse().ok())
    }

    fn content_type(&self) -> Option<&str> {
        self.header(&HeaderName::ContentType)
    }

    fn content_length(&self) -> Option<usize> {
        self.header(&HeaderName::ContentLength)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Branch of the topmost Via
    fn branch(&self) -> Result<String> {
        self.top_via()?
            .branch()
            .map(str::to_string)
            .ok_or_else(|| Error::header("Via", "missing branch"))
    }

    /// Check that the headers every message must carry are present and parse
    fn validate_common(&self) -> Result<()> {
        self.top_via()?;
        self.from_addr()?;
        self.to_addr()?;
        self.call_id()?;
        self.cseq()?;
        Ok(())
    }
}

/// A SIP request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.header(&HeaderName::MaxForwards)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Mandatory headers present and CSeq method matching the request line
    pub fn validate(&self) -> Result<()> {
        self.validate_common()?;
        let cseq = self.cseq()?;
        if cseq.method != self.method {
            return Err(Error::header(
                "CSeq",
                format!("method {} does not match {}", cseq.method, self.method),
            ));
        }
        Ok(())
    }

    /// Serialize to wire format; Content-Length always reflects the body
    pub fn to_bytes(&self) -> Bytes {
        let start = format!("{} {} {}", self.method, self.uri, SIP_VERSION);
        encode(&start, &self.headers, &self.body)
    }
}

impl SipMessage for Request {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn body(&self) -> &Bytes {
        &self.body
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// Response with the default reason phrase
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_common()
    }

    pub fn to_bytes(&self) -> Bytes {
        let start = format!("{} {} {}", SIP_VERSION, self.status.as_u16(), self.reason);
        encode(&start, &self.headers, &self.body)
    }
}

impl SipMessage for Response {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn body(&self) -> &Bytes {
        &self.body
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

/// Either kind of SIP message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(req) => Some(req),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(resp) => Some(resp),
            Message::Request(_) => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(req) => req.to_bytes(),
            Message::Response(resp) => resp.to_bytes(),
        }
    }
}

impl SipMessage for Message {
    fn headers(&self) -> &Headers {
        match self {
            Message::Request(req) => &req.headers,
            Message::Response(resp) => &resp.headers,
        }
    }

    fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Message::Request(req) => &mut req.headers,
            Message::Response(resp) => &mut resp.headers,
        }
    }

    fn body(&self) -> &Bytes {
        match self {
            Message::Request(req) => &req.body,
            Message::Response(resp) => &resp.body,
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

fn encode(start_line: &str, headers: &Headers, body: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(512 + body.len());
    buf.put_slice(start_line.as_bytes());
    buf.put_slice(b"\r\n");
    for header in headers.iter() {
        if header.name == HeaderName::ContentLength {
            continue;
        }
        buf.put_slice(header.to_string().as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    buf.put_slice(body);
    buf.freeze()
}
