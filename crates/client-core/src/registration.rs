//! Registration with a SIP registrar
//!
//! [`Registration`] builds REGISTER requests and interprets their responses;
//! the agent sends what it builds and feeds the answers back. One Call-ID is
//! kept for the lifetime of the binding and the CSeq grows with every
//! request (RFC 3261 §10.2).
//!
//! ```text
//!  None ──▶ Registering ──200──▶ Registered ──expires 0──▶ Unregistering ──▶ Unregistered
//!                │                    │  ▲
//!                │ 4xx-6xx / timeout  │  └── refresh (state unchanged)
//!                ▼                    ▼
//!              Failed ◀───────────── Failed
//! ```
//!
//! A 401 or 407 is answered once from the cached challenge; the same
//! challenge is then reused for refreshes with an incremented nonce count.

use std::time::Duration;

use lws_dialog_core::{AuthContext, Credentials, TransactionKey};
use lws_sip_core::builder::SimpleRequestBuilder;
use lws_sip_core::{HeaderName, Method, NameAddr, Request, Response, SipMessage, StatusCode, Uri, Via};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::RegistrationState;

/// Methods this agent handles, advertised in Allow
pub const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, MESSAGE";

/// Delay before refreshing a binding granted for `expires` seconds: the
/// smaller of 90 % of the lifetime and the lifetime less 5 s.
pub fn refresh_delay(expires: u32) -> Duration {
    let ninety_percent = Duration::from_millis(u64::from(expires) * 900);
    if expires <= 5 {
        return ninety_percent;
    }
    ninety_percent.min(Duration::from_secs(u64::from(expires - 5)))
}

/// What a REGISTER response means for the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// Provisional or unrelated; keep waiting
    Pending,
    /// Send the REGISTER again (credentials added, or a longer expiry)
    Retry,
    /// Binding accepted for `expires` seconds
    Registered { expires: u32 },
    /// Binding removed
    Unregistered { status: u16 },
    /// Gave up
    Failed { status: u16 },
}

/// Client side of one registration binding
#[derive(Debug)]
pub struct Registration {
    state: RegistrationState,
    registrar: Uri,
    aor: NameAddr,
    contact: NameAddr,
    call_id: String,
    local_tag: String,
    cseq: u32,
    expires: u32,
    /// Expiry of the request in flight
    requested: u32,
    auth: AuthContext,
    retried: bool,
    pending: Option<TransactionKey>,
    granted: Option<u32>,
    refresh_at: Option<Instant>,
}

impl Registration {
    pub fn new(
        registrar: Uri,
        aor: NameAddr,
        contact: NameAddr,
        expires: u32,
        credentials: Credentials,
        call_id: String,
        local_tag: String,
    ) -> Self {
        Self {
            state: RegistrationState::None,
            registrar,
            aor,
            contact,
            call_id,
            local_tag,
            cseq: 0,
            expires,
            requested: expires,
            auth: AuthContext::new(credentials),
            retried: false,
            pending: None,
            granted: None,
            refresh_at: None,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Lifetime granted by the registrar in the last 2xx
    pub fn granted(&self) -> Option<u32> {
        self.granted
    }

    /// When the next refresh is due
    pub fn refresh_at(&self) -> Option<Instant> {
        self.refresh_at
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether `key` is the REGISTER in flight
    pub fn matches(&self, key: &TransactionKey) -> bool {
        self.pending.as_ref() == Some(key)
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Start a new attempt: a registration (or refresh) when `unregister`
    /// is false, removal of the binding otherwise
    pub fn begin(&mut self, unregister: bool) {
        self.retried = false;
        self.refresh_at = None;
        self.requested = if unregister { 0 } else { self.expires };
        self.state = match (unregister, self.state) {
            (true, _) => RegistrationState::Unregistering,
            // A refresh keeps the binding visible as registered
            (false, RegistrationState::Registered) => RegistrationState::Registered,
            (false, _) => RegistrationState::Registering,
        };
    }

    /// Next REGISTER of the current attempt, authorized from the cached
    /// challenge when there is one
    pub fn build_request(&mut self, via: Via, user_agent: &str) -> Result<Request> {
        self.cseq += 1;
        let mut request = SimpleRequestBuilder::with_uri(Method::Register, self.registrar.clone())
            .via(via)
            .from(self.aor.clone().with_tag(self.local_tag.clone()))
            .to(self.aor.clone())
            .call_id(self.call_id.clone())
            .cseq(self.cseq)
            .contact(self.contact.clone())
            .header(HeaderName::Expires, self.requested.to_string())
            .header(HeaderName::Allow, ALLOWED_METHODS)
            .header(HeaderName::UserAgent, user_agent)
            .build()?;
        if self.auth.authorize(&mut request)? {
            debug!(nc = self.auth.nonce_count(), "REGISTER authorized from cached challenge");
        }
        Ok(request)
    }

    /// Remember the transaction the last built request went out on
    pub fn on_sent(&mut self, key: TransactionKey) {
        self.pending = Some(key);
    }

    /// Interpret the response to the REGISTER in flight
    pub fn on_response(&mut self, response: &Response) -> RegistrationOutcome {
        let status = response.status.as_u16();
        if response.status.is_provisional() {
            return RegistrationOutcome::Pending;
        }
        self.pending = None;

        if response.status.is_success() {
            self.retried = false;
            if self.requested == 0 {
                info!(registrar = %self.registrar, "Binding removed");
                self.state = RegistrationState::Unregistered;
                self.granted = None;
                return RegistrationOutcome::Unregistered { status };
            }
            let expires = self.granted_expiry(response);
            self.granted = Some(expires);
            self.refresh_at = Some(Instant::now() + refresh_delay(expires));
            self.state = RegistrationState::Registered;
            info!(registrar = %self.registrar, expires, "Registered");
            return RegistrationOutcome::Registered { expires };
        }

        match response.status {
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                match self.auth.on_challenge(response, self.retried) {
                    Ok(true) => {
                        self.retried = true;
                        debug!(status, "Answering registrar challenge");
                        return RegistrationOutcome::Retry;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Unusable registrar challenge"),
                }
            }
            StatusCode::IntervalTooBrief => {
                if let Some(min) = response
                    .header(&HeaderName::MinExpires)
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .filter(|min| *min > self.requested && self.requested != 0)
                {
                    debug!(min, "Registrar wants a longer expiry");
                    self.expires = min;
                    self.requested = min;
                    return RegistrationOutcome::Retry;
                }
            }
            _ => {}
        }

        self.finish_failed(status)
    }

    /// The REGISTER got no response at all
    pub fn on_timeout(&mut self) -> RegistrationOutcome {
        self.pending = None;
        self.finish_failed(StatusCode::RequestTimeout.as_u16())
    }

    /// Give up on the binding without waiting for the registrar. Returns
    /// false when there was nothing to abandon.
    pub fn abandon(&mut self) -> bool {
        self.pending = None;
        self.refresh_at = None;
        self.granted = None;
        match self.state {
            RegistrationState::None
            | RegistrationState::Unregistered
            | RegistrationState::Failed => false,
            _ => {
                self.state = RegistrationState::Unregistered;
                true
            }
        }
    }

    fn finish_failed(&mut self, status: u16) -> RegistrationOutcome {
        self.refresh_at = None;
        self.granted = None;
        if self.requested == 0 {
            // Whatever the registrar says, the binding is abandoned
            warn!(status, "Un-REGISTER failed");
            self.state = RegistrationState::Unregistered;
            return RegistrationOutcome::Unregistered { status };
        }
        warn!(registrar = %self.registrar, status, "Registration failed");
        self.state = RegistrationState::Failed;
        RegistrationOutcome::Failed { status }
    }

    /// Lifetime from our Contact's `expires`, then the Expires header, then
    /// what was asked for
    fn granted_expiry(&self, response: &Response) -> u32 {
        let ours = response
            .headers
            .get_all(&HeaderName::Contact)
            .filter_map(|value| value.parse::<NameAddr>().ok())
            .find(|contact| same_binding(&contact.uri, &self.contact.uri))
            .and_then(|contact| contact.expires());
        ours.or_else(|| response.expires())
            .filter(|expires| *expires > 0)
            .unwrap_or(self.requested)
    }
}

fn same_binding(a: &Uri, b: &Uri) -> bool {
    a.user == b.user && a.host.eq_ignore_ascii_case(&b.host) && a.port_or_default() == b.port_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lws_sip_core::auth::DigestResponse;
    use lws_sip_core::builder::SimpleResponseBuilder;
    use lws_sip_core::Param;

    fn registration() -> Registration {
        let aor = NameAddr::new(Uri::sip("example.com").with_user("1001"));
        let contact = NameAddr::new(Uri::sip("192.0.2.10").with_user("1001").with_port(5062));
        Registration::new(
            Uri::sip("example.com"),
            aor,
            contact,
            3600,
            Credentials::new("1001", "secret"),
            "reg-1@192.0.2.10".into(),
            "t1".into(),
        )
    }

    fn via() -> Via {
        Via::new("UDP", "192.0.2.10", Some(5062), lws_sip_core::builder::generate_branch())
    }

    fn respond(request: &Request, status: StatusCode) -> SimpleResponseBuilder {
        SimpleResponseBuilder::from_request(request, status, None).to_tag("srv")
    }

    fn challenge(request: &Request, nonce: &str, stale: bool) -> Response {
        let mut value = format!(r#"Digest realm="example.com", nonce="{}", qop="auth""#, nonce);
        if stale {
            value.push_str(", stale=true");
        }
        respond(request, StatusCode::Unauthorized)
            .header(HeaderName::WwwAuthenticate, value)
            .build()
    }

    fn digest(request: &Request) -> DigestResponse {
        request
            .header(&HeaderName::Authorization)
            .expect("Authorization header")
            .parse()
            .unwrap()
    }

    #[test]
    fn test_refresh_delay() {
        assert_eq!(refresh_delay(3600), Duration::from_secs(3240));
        assert_eq!(refresh_delay(60), Duration::from_secs(54));
        assert_eq!(refresh_delay(30), Duration::from_secs(25));
        assert_eq!(refresh_delay(4), Duration::from_millis(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_then_grant() {
        let mut reg = registration();
        reg.begin(false);
        assert_eq!(reg.state(), RegistrationState::Registering);

        let first = reg.build_request(via(), "lws-test").unwrap();
        assert!(first.header(&HeaderName::Authorization).is_none());
        assert_eq!(first.header(&HeaderName::Expires), Some("3600"));

        assert_eq!(reg.on_response(&challenge(&first, "n1", false)), RegistrationOutcome::Retry);
        let second = reg.build_request(via(), "lws-test").unwrap();
        assert_eq!(second.cseq().unwrap().seq, 2);
        assert_eq!(second.call_id().unwrap(), first.call_id().unwrap());
        let answer = digest(&second);
        assert_eq!(answer.nc, Some(1));
        assert!(answer.verify("secret", "REGISTER", b""));

        let contact = NameAddr::new(Uri::sip("192.0.2.10").with_user("1001").with_port(5062))
            .with_param(Param::new("expires", "120"));
        let ok = respond(&second, StatusCode::Ok).contact(contact).build();
        assert_eq!(reg.on_response(&ok), RegistrationOutcome::Registered { expires: 120 });
        assert_eq!(reg.state(), RegistrationState::Registered);
        assert_eq!(reg.refresh_at(), Some(Instant::now() + Duration::from_secs(108)));
    }

    #[test]
    fn test_second_challenge_fails() {
        let mut reg = registration();
        reg.begin(false);
        let first = reg.build_request(via(), "lws-test").unwrap();
        assert_eq!(reg.on_response(&challenge(&first, "n1", false)), RegistrationOutcome::Retry);
        let second = reg.build_request(via(), "lws-test").unwrap();
        assert_eq!(
            reg.on_response(&challenge(&second, "n2", false)),
            RegistrationOutcome::Failed { status: 401 }
        );
        assert_eq!(reg.state(), RegistrationState::Failed);
    }

    #[test]
    fn test_stale_challenge_is_retried() {
        let mut reg = registration();
        reg.begin(false);
        let first = reg.build_request(via(), "lws-test").unwrap();
        reg.on_response(&challenge(&first, "n1", false));
        let second = reg.build_request(via(), "lws-test").unwrap();
        assert_eq!(reg.on_response(&challenge(&second, "n2", true)), RegistrationOutcome::Retry);
        let third = reg.build_request(via(), "lws-test").unwrap();
        assert_eq!(digest(&third).nonce, "n2");
        assert_eq!(digest(&third).nc, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_reuses_nonce() {
        let mut reg = registration();
        reg.begin(false);
        let first = reg.build_request(via(), "lws-test").unwrap();
        reg.on_response(&challenge(&first, "n1", false));
        let second = reg.build_request(via(), "lws-test").unwrap();
        let ok = respond(&second, StatusCode::Ok)
            .header(HeaderName::Expires, "60")
            .build();
        assert_eq!(reg.on_response(&ok), RegistrationOutcome::Registered { expires: 60 });

        reg.begin(false);
        assert_eq!(reg.state(), RegistrationState::Registered);
        let refresh = reg.build_request(via(), "lws-test").unwrap();
        let answer = digest(&refresh);
        assert_eq!(answer.nonce, "n1");
        assert_eq!(answer.nc, Some(2));
        assert_ne!(answer.cnonce, digest(&second).cnonce);
    }

    #[test]
    fn test_interval_too_brief() {
        let mut reg = registration();
        reg.begin(false);
        let first = reg.build_request(via(), "lws-test").unwrap();
        let brief = SimpleResponseBuilder::from_request(&first, StatusCode::IntervalTooBrief, None)
            .header(HeaderName::MinExpires, "7200")
            .build();
        assert_eq!(reg.on_response(&brief), RegistrationOutcome::Retry);
        let second = reg.build_request(via(), "lws-test").unwrap();
        assert_eq!(second.header(&HeaderName::Expires), Some("7200"));
    }

    #[test]
    fn test_unregister_always_ends_unregistered() {
        let mut reg = registration();
        reg.begin(true);
        assert_eq!(reg.state(), RegistrationState::Unregistering);
        let request = reg.build_request(via(), "lws-test").unwrap();
        assert_eq!(request.header(&HeaderName::Expires), Some("0"));
        let error = respond(&request, StatusCode::ServerInternalError).build();
        assert_eq!(reg.on_response(&error), RegistrationOutcome::Unregistered { status: 500 });
        assert_eq!(reg.state(), RegistrationState::Unregistered);
        assert!(reg.refresh_at().is_none());
    }

    #[test]
    fn test_timeout_fails() {
        let mut reg = registration();
        reg.begin(false);
        reg.build_request(via(), "lws-test").unwrap();
        assert_eq!(reg.on_timeout(), RegistrationOutcome::Failed { status: 408 });
    }
}
