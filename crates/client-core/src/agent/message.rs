//! Requests outside call control: MESSAGE in both directions, OPTIONS, and
//! the answers to methods we do not implement

use std::net::SocketAddr;

use lws_dialog_core::{DialogId, TransactionKey};
use lws_infra_common::errors::{LWS_ERR_SIP_AUTH, LWS_ERR_SIP_TIMEOUT, LWS_ERR_SIP_TRANSACTION};
use lws_sip_core::builder::{generate_call_id, generate_tag, SimpleRequestBuilder};
use lws_sip_core::{HeaderName, Method, NameAddr, Request, Response, SipMessage, StatusCode};
use tracing::{debug, info, warn};

use super::Agent;
use crate::error::Result;
use crate::registration::ALLOWED_METHODS;

const TEXT_PLAIN: &str = "text/plain;charset=UTF-8";

/// A MESSAGE waiting for its final response
#[derive(Debug)]
pub(super) struct PendingMessage {
    request: Request,
    destination: SocketAddr,
    retried: bool,
}

impl Agent {
    /// Send `content` as a MESSAGE to `uri`. Delivery failures arrive later
    /// through [`AgentHandler::on_error`](crate::AgentHandler::on_error).
    pub async fn send_message(&mut self, uri: &str, content: &str) -> Result<()> {
        self.ensure_started()?;
        self.ensure_registered()?;
        let target = self.target_uri(uri)?;
        let destination = self.destination_for(&target).await?;

        let mut request = SimpleRequestBuilder::with_uri(Method::Message, target.clone())
            .via(self.engine.via())
            .from(self.aor.clone().with_tag(generate_tag()))
            .to(NameAddr::new(target.clone()))
            .call_id(generate_call_id(Some(&self.via_host)))
            .cseq(1)
            .header(HeaderName::UserAgent, self.config.user_agent.clone())
            .body(TEXT_PLAIN, content.to_string())
            .build()?;
        self.auth.authorize(&mut request)?;
        let key = self.engine.send_request(request.clone(), destination)?;
        debug!(transaction = %key, %target, len = content.len(), "MESSAGE sent");
        self.messages.insert(
            key,
            PendingMessage {
                request,
                destination,
                retried: false,
            },
        );
        self.flush().await
    }

    pub(super) async fn on_message_response(&mut self, key: TransactionKey, response: Response) {
        if response.status.is_provisional() {
            return;
        }
        let Some(pending) = self.messages.remove(&key) else {
            return;
        };
        let status = response.status.as_u16();
        if response.status.is_success() {
            debug!(transaction = %key, status, "MESSAGE delivered");
            return;
        }

        let challenged = matches!(
            response.status,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
        );
        if challenged {
            match self.retry_message(pending, &response) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Cannot resend MESSAGE"),
            }
            self.handler
                .on_error(LWS_ERR_SIP_AUTH, &format!("MESSAGE rejected: {status} {}", response.reason))
                .await;
            return;
        }
        warn!(transaction = %key, status, "MESSAGE failed");
        self.handler
            .on_error(
                LWS_ERR_SIP_TRANSACTION,
                &format!("MESSAGE failed: {status} {}", response.reason),
            )
            .await;
    }

    /// Resend a challenged MESSAGE with credentials; false when it was
    /// already retried or the challenge is unusable
    fn retry_message(&mut self, pending: PendingMessage, response: &Response) -> Result<bool> {
        if !self.auth.on_challenge(response, pending.retried)? {
            return Ok(false);
        }
        let mut request = pending.request;
        let cseq = request.cseq()?;
        request
            .headers
            .set(HeaderName::Via, self.engine.via().to_string());
        request
            .headers
            .set(HeaderName::CSeq, format!("{} {}", cseq.seq + 1, Method::Message));
        self.auth.authorize(&mut request)?;
        let key = self.engine.send_request(request.clone(), pending.destination)?;
        debug!(transaction = %key, "MESSAGE resent with credentials");
        self.messages.insert(
            key,
            PendingMessage {
                request,
                destination: pending.destination,
                retried: true,
            },
        );
        Ok(true)
    }

    pub(super) async fn on_message_timeout(&mut self, key: TransactionKey) {
        if let Some(pending) = self.messages.remove(&key) {
            warn!(transaction = %key, target = %pending.request.uri, "MESSAGE timed out");
            self.handler
                .on_error(
                    LWS_ERR_SIP_TIMEOUT,
                    &format!("MESSAGE to {} timed out", pending.request.uri),
                )
                .await;
        }
    }

    // ---- incoming requests ----------------------------------------------

    pub(super) async fn on_request(
        &mut self,
        key: TransactionKey,
        request: Request,
        source: SocketAddr,
        dialog: Option<DialogId>,
    ) {
        match (request.method.clone(), dialog) {
            (Method::Invite, None) => self.on_incoming_invite(key, request, source).await,
            (Method::Invite, Some(dialog)) => {
                debug!(%dialog, "Refusing re-INVITE");
                self.respond(&key, StatusCode::NotAcceptableHere);
            }
            (Method::Bye, Some(dialog)) => self.on_peer_bye(key, &dialog).await,
            (Method::Bye, None) => self.respond(&key, StatusCode::CallOrTransactionDoesNotExist),
            (Method::Options, _) => self.respond_with(
                &key,
                StatusCode::Ok,
                &[
                    (HeaderName::Allow, ALLOWED_METHODS),
                    (HeaderName::Accept, "application/sdp"),
                ],
            ),
            (Method::Message, _) => self.on_incoming_message(&key, &request).await,
            (method, _) => {
                debug!(%method, %source, "Method not implemented");
                self.respond_with(
                    &key,
                    StatusCode::NotImplemented,
                    &[(HeaderName::Allow, ALLOWED_METHODS)],
                );
            }
        }
    }

    async fn on_incoming_message(&mut self, key: &TransactionKey, request: &Request) {
        self.respond(key, StatusCode::Ok);
        let from = request
            .from_addr()
            .map(|addr| addr.uri.to_string())
            .unwrap_or_default();
        let to = request
            .to_addr()
            .map(|addr| addr.uri.to_string())
            .unwrap_or_default();
        let content = String::from_utf8_lossy(&request.body);
        info!(%from, len = content.len(), "MESSAGE received");
        self.handler.on_message(&from, &to, &content).await;
    }

    /// Answer a server transaction with a bare response
    pub(super) fn respond(&mut self, key: &TransactionKey, status: StatusCode) {
        self.respond_with(key, status, &[]);
    }

    fn respond_with(&mut self, key: &TransactionKey, status: StatusCode, headers: &[(HeaderName, &str)]) {
        let result = self
            .engine
            .make_response(key, status, None)
            .and_then(|mut response| {
                for (name, value) in headers {
                    response.headers.push(name.clone(), *value);
                }
                self.engine.send_response(key, response)
            });
        if let Err(e) = result {
            warn!(transaction = %key, status = status.as_u16(), error = %e, "Cannot send response");
        }
    }
}
