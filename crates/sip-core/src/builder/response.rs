use bytes::Bytes;

use crate::types::{HeaderName, NameAddr, Request, Response, SipMessage, StatusCode};

/// Builder for responses
#[derive(Debug, Clone)]
pub struct SimpleResponseBuilder {
    response: Response,
}

impl SimpleResponseBuilder {
    /// Empty response; `reason` defaults to the standard phrase
    pub fn new(status: StatusCode, reason: Option<&str>) -> Self {
        let mut response = Response::new(status);
        if let Some(reason) = reason {
            response.reason = reason.to_string();
        }
        SimpleResponseBuilder { response }
    }

    /// Response to `request`, copying Via, From, To, Call-ID and CSeq
    pub fn from_request(request: &Request, status: StatusCode, reason: Option<&str>) -> Self {
        let mut builder = Self::new(status, reason);
        let headers = &mut builder.response.headers;
        for via in request.headers.get_all(&HeaderName::Via) {
            headers.push(HeaderName::Via, via);
        }
        for name in [
            HeaderName::From,
            HeaderName::To,
            HeaderName::CallId,
            HeaderName::CSeq,
        ] {
            if let Some(value) = request.header(&name) {
                headers.push(name, value);
            }
        }
        builder
    }

    /// Add a To tag unless the To header already carries one
    pub fn to_tag(mut self, tag: &str) -> Self {
        if let Ok(mut to) = self.response.to_addr() {
            if to.tag().is_none() {
                to.set_tag(tag);
                self.response.headers.set(HeaderName::To, to.to_string());
            }
        }
        self
    }

    pub fn contact(mut self, contact: NameAddr) -> Self {
        self.response
            .headers
            .set(HeaderName::Contact, contact.to_string());
        self
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.response.headers.push(name, value);
        self
    }

    pub fn body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.response
            .headers
            .set(HeaderName::ContentType, content_type.into());
        self.response.body = body.into();
        self
    }

    pub fn build(self) -> Response {
        self.response
    }
}
