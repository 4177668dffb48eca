use bytes::Bytes;

use super::DEFAULT_MAX_FORWARDS;
use crate::error::{Error, Result};
use crate::types::{CSeq, HeaderName, Headers, Method, NameAddr, Request, Uri, Via};

/// Builder for outgoing requests.
///
/// Headers are emitted in the conventional order: Via, Route, Max-Forwards,
/// From, To, Call-ID, CSeq, Contact, then anything added through
/// [`SimpleRequestBuilder::header`], then Content-Type.
#[derive(Debug, Clone)]
pub struct SimpleRequestBuilder {
    method: Method,
    uri: Uri,
    vias: Vec<Via>,
    routes: Vec<NameAddr>,
    max_forwards: u32,
    from: Option<NameAddr>,
    to: Option<NameAddr>,
    call_id: Option<String>,
    cseq: u32,
    contact: Option<NameAddr>,
    extra: Headers,
    content_type: Option<String>,
    body: Bytes,
}

impl SimpleRequestBuilder {
    /// Start a request for `method` addressed to `uri`
    pub fn new(method: Method, uri: &str) -> Result<Self> {
        Ok(Self::with_uri(method, uri.parse()?))
    }

    pub fn with_uri(method: Method, uri: Uri) -> Self {
        SimpleRequestBuilder {
            method,
            uri,
            vias: Vec::new(),
            routes: Vec::new(),
            max_forwards: DEFAULT_MAX_FORWARDS,
            from: None,
            to: None,
            call_id: None,
            cseq: 1,
            contact: None,
            extra: Headers::new(),
            content_type: None,
            body: Bytes::new(),
        }
    }

    pub fn from(mut self, from: NameAddr) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: NameAddr) -> Self {
        self.to = Some(to);
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    /// Sequence number; the CSeq method is always the request method
    pub fn cseq(mut self, seq: u32) -> Self {
        self.cseq = seq;
        self
    }

    /// Add a Via below any already added
    pub fn via(mut self, via: Via) -> Self {
        self.vias.push(via);
        self
    }

    pub fn route(mut self, route: NameAddr) -> Self {
        self.routes.push(route);
        self
    }

    pub fn routes(mut self, routes: impl IntoIterator<Item = NameAddr>) -> Self {
        self.routes.extend(routes);
        self
    }

    pub fn max_forwards(mut self, hops: u32) -> Self {
        self.max_forwards = hops;
        self
    }

    pub fn contact(mut self, contact: NameAddr) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.extra.push(name, value);
        self
    }

    pub fn body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<Request> {
        if self.vias.is_empty() {
            return Err(Error::BuildError("request needs a Via".into()));
        }
        let from = self
            .from
            .ok_or_else(|| Error::BuildError("request needs a From".into()))?;
        let to = self
            .to
            .ok_or_else(|| Error::BuildError("request needs a To".into()))?;
        let call_id = self
            .call_id
            .ok_or_else(|| Error::BuildError("request needs a Call-ID".into()))?;

        let mut headers = Headers::new();
        for via in &self.vias {
            headers.push(HeaderName::Via, via.to_string());
        }
        for route in &self.routes {
            headers.push(HeaderName::Route, route.to_string());
        }
        headers.push(HeaderName::MaxForwards, self.max_forwards.to_string());
        headers.push(HeaderName::From, from.to_string());
        headers.push(HeaderName::To, to.to_string());
        headers.push(HeaderName::CallId, call_id);
        headers.push(
            HeaderName::CSeq,
            CSeq::new(self.cseq, self.method.clone()).to_string(),
        );
        if let Some(contact) = &self.contact {
            headers.push(HeaderName::Contact, contact.to_string());
        }
        for header in self.extra {
            headers.push(header.name, header.value);
        }
        if let Some(content_type) = self.content_type {
            headers.push(HeaderName::ContentType, content_type);
        }

        Ok(Request {
            method: self.method,
            uri: self.uri,
            headers,
            body: self.body,
        })
    }
}
