//! The Dialog struct: route set, remote target and CSeq bookkeeping

use std::net::SocketAddr;

use bytes::Bytes;
use lws_sip_core::builder::SimpleRequestBuilder;
use lws_sip_core::{Method, NameAddr, Request, Response, SipMessage, Uri, Via};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DialogId, DialogState};
use crate::error::{Error, Result};

/// A SIP dialog as defined in RFC 3261 §12
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,

    /// Our From/To value, carrying the local tag
    pub local: NameAddr,

    /// Peer's From/To value, carrying the remote tag
    pub remote: NameAddr,

    /// Last CSeq number used by us
    pub local_cseq: u32,

    /// Last CSeq number seen from the peer, if any request arrived yet
    pub remote_cseq: Option<u32>,

    /// Contact of the peer; Request-URI of in-dialog requests
    pub remote_target: Uri,

    /// Route headers for in-dialog requests, in sending order
    pub route_set: Vec<NameAddr>,

    /// Whether this side sent the INVITE
    pub is_initiator: bool,

    /// Socket address in-dialog requests are sent to
    pub peer: SocketAddr,

    /// CSeq number of the INVITE that created the dialog
    pub invite_cseq: u32,

    /// ACK for the 2xx, resent when the 2xx is retransmitted
    #[serde(skip)]
    pub ack: Option<Bytes>,
}

impl Dialog {
    /// Dialog seen by the UAC, from the INVITE and a 101-299 response with
    /// a To tag
    pub fn from_uac_response(
        request: &Request,
        response: &Response,
        peer: SocketAddr,
    ) -> Result<Self> {
        let local = request.from_addr()?;
        let remote = response.to_addr()?;
        let local_tag = local
            .tag()
            .ok_or_else(|| Error::DialogCreation("request has no From tag".into()))?;
        let remote_tag = remote
            .tag()
            .ok_or_else(|| Error::DialogCreation("response has no To tag".into()))?;
        let id = DialogId::new(response.call_id()?, local_tag, remote_tag);

        let remote_target = match response.contact()? {
            Some(contact) => contact.uri,
            None => {
                debug!(dialog = %id, "Response without Contact, targeting Request-URI");
                request.uri.clone()
            }
        };
        let mut route_set = response.record_routes()?;
        route_set.reverse();
        let cseq = request.cseq()?.seq;

        Ok(Self {
            state: if response.status.is_provisional() {
                DialogState::Early
            } else {
                DialogState::Confirmed
            },
            id,
            local,
            remote,
            local_cseq: cseq,
            remote_cseq: None,
            remote_target,
            route_set,
            is_initiator: true,
            peer,
            invite_cseq: cseq,
            ack: None,
        })
    }

    /// Sibling UAC dialog for a 2xx from another fork of the same INVITE,
    /// once the INVITE transaction that made this one is gone
    pub fn fork(&self, response: &Response) -> Result<Self> {
        let remote = response.to_addr()?;
        let remote_tag = remote
            .tag()
            .ok_or_else(|| Error::DialogCreation("response has no To tag".into()))?;
        let id = DialogId::new(self.id.call_id.clone(), self.id.local_tag.clone(), remote_tag);
        let remote_target = match response.contact()? {
            Some(contact) => contact.uri,
            None => self.remote_target.clone(),
        };
        let mut route_set = response.record_routes()?;
        route_set.reverse();

        Ok(Self {
            id,
            state: DialogState::Confirmed,
            local: self.local.clone(),
            remote,
            local_cseq: self.invite_cseq,
            remote_cseq: None,
            remote_target,
            route_set,
            is_initiator: true,
            peer: self.peer,
            invite_cseq: self.invite_cseq,
            ack: None,
        })
    }

    /// Dialog seen by the UAS, from the INVITE and the tag it answers with.
    /// Starts Early; [`Dialog::confirm`] once the 2xx is sent.
    pub fn from_uas_request(request: &Request, local_tag: &str, peer: SocketAddr) -> Result<Self> {
        let remote = request.from_addr()?;
        let local = request.to_addr()?.with_tag(local_tag);
        let remote_tag = remote
            .tag()
            .ok_or_else(|| Error::DialogCreation("request has no From tag".into()))?;
        let id = DialogId::new(request.call_id()?, local_tag, remote_tag);

        let remote_target = match request.contact()? {
            Some(contact) => contact.uri,
            None => remote.uri.clone(),
        };
        let cseq = request.cseq()?.seq;

        Ok(Self {
            id,
            state: DialogState::Early,
            remote_target,
            route_set: request.record_routes()?,
            local,
            remote,
            local_cseq: 0,
            remote_cseq: Some(cseq),
            is_initiator: false,
            peer,
            invite_cseq: cseq,
            ack: None,
        })
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            debug!(dialog = %self.id, "Dialog confirmed");
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DialogState::Confirmed
    }

    /// Increment and return the local CSeq
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Check an incoming request's CSeq against the last one seen.
    /// Returns false for an out-of-order request.
    pub fn accept_remote_cseq(&mut self, request: &Request) -> Result<bool> {
        let seq = request.cseq()?.seq;
        if matches!(request.method, Method::Ack | Method::Cancel) {
            return Ok(true);
        }
        match self.remote_cseq {
            Some(last) if seq < last => Ok(false),
            _ => {
                self.remote_cseq = Some(seq);
                Ok(true)
            }
        }
    }

    /// Take a refreshed Contact from a target refresh request or response
    pub fn update_remote_target(&mut self, contact: Option<NameAddr>) {
        if let Some(contact) = contact {
            self.remote_target = contact.uri;
        }
    }

    /// New in-dialog request with the next local CSeq
    pub fn build_request(&mut self, method: Method, via: Via) -> Result<Request> {
        let cseq = self.next_cseq();
        self.request_with_cseq(method, via, cseq)
    }

    /// ACK for a 2xx: new branch, CSeq number of the INVITE
    pub fn build_ack(&self, via: Via) -> Result<Request> {
        self.request_with_cseq(Method::Ack, via, self.invite_cseq)
    }

    fn request_with_cseq(&self, method: Method, via: Via, cseq: u32) -> Result<Request> {
        let (uri, routes) = self.request_target();
        let request = SimpleRequestBuilder::with_uri(method, uri)
            .via(via)
            .from(self.local.clone())
            .to(self.remote.clone())
            .call_id(self.id.call_id.clone())
            .cseq(cseq)
            .routes(routes)
            .build()?;
        Ok(request)
    }

    /// Request-URI and Route headers (RFC 3261 §12.2.1.1). A strict router
    /// at the head of the route set takes the Request-URI and the remote
    /// target moves to the end of the Route list.
    fn request_target(&self) -> (Uri, Vec<NameAddr>) {
        match self.route_set.first() {
            Some(first) if !first.uri.is_loose_route() => {
                let mut routes: Vec<NameAddr> = self.route_set[1..].to_vec();
                routes.push(NameAddr::new(self.remote_target.clone()));
                (first.uri.clone(), routes)
            }
            _ => (self.remote_target.clone(), self.route_set.clone()),
        }
    }
}
