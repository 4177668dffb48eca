//! Client side of Digest authentication
//!
//! [`AuthContext`] remembers the last challenge from a realm so that later
//! requests can carry credentials up front, with the nonce count
//! incremented each time. A challenge is answered once; a second challenge
//! for the same request is only answered when it is marked `stale`.

use lws_sip_core::auth::{
    compute_ha1, generate_cnonce, AuthScheme, Challenge, DigestResponse,
};
use lws_sip_core::{HeaderName, Request, Response, SipMessage, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Username and password for one account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
struct CachedChallenge {
    challenge: Challenge,
    /// Came from a 407
    proxy: bool,
    /// Last nonce count used with this nonce
    nc: u32,
    ha1: String,
    /// cnonce the `-sess` HA1 was computed with
    session_cnonce: Option<String>,
}

/// Per-account Digest state
#[derive(Debug, Clone)]
pub struct AuthContext {
    credentials: Credentials,
    cached: Option<CachedChallenge>,
}

impl AuthContext {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            cached: None,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Whether a challenge is cached and requests can be authorized up front
    pub fn has_challenge(&self) -> bool {
        self.cached.is_some()
    }

    /// Nonce count of the last authorized request
    pub fn nonce_count(&self) -> u32 {
        self.cached.as_ref().map(|c| c.nc).unwrap_or(0)
    }

    /// Forget the cached challenge
    pub fn reset(&mut self) {
        self.cached = None;
    }

    /// Take the challenge from a 401 or 407.
    ///
    /// Returns `Ok(false)` when the request should not be retried: it was
    /// already retried once and the new challenge is not `stale`.
    pub fn on_challenge(&mut self, response: &Response, already_retried: bool) -> Result<bool> {
        let (header, proxy) = match response.status {
            StatusCode::Unauthorized => (HeaderName::WwwAuthenticate, false),
            StatusCode::ProxyAuthenticationRequired => (HeaderName::ProxyAuthenticate, true),
            other => {
                return Err(Error::Auth(format!("{} is not a challenge", other.as_u16())));
            }
        };

        let challenge = response
            .headers
            .get_all(&header)
            .filter_map(|value| value.parse::<Challenge>().ok())
            .find(|c| c.scheme == AuthScheme::Digest)
            .ok_or_else(|| Error::Auth(format!("no Digest challenge in {}", header)))?;

        if already_retried && !challenge.stale {
            warn!(realm = %challenge.realm, "Credentials rejected");
            return Ok(false);
        }

        let same_nonce = self
            .cached
            .as_ref()
            .map(|c| c.challenge.nonce == challenge.nonce && c.challenge.realm == challenge.realm)
            .unwrap_or(false);
        if same_nonce {
            if let Some(cached) = self.cached.as_mut() {
                cached.proxy = proxy;
            }
            return Ok(true);
        }

        debug!(
            realm = %challenge.realm,
            algorithm = challenge.algorithm.as_str(),
            stale = challenge.stale,
            "New Digest challenge"
        );
        let session_cnonce = challenge.algorithm.is_session().then(generate_cnonce);
        let ha1 = compute_ha1(
            challenge.algorithm,
            &self.credentials.username,
            &challenge.realm,
            &self.credentials.password,
            &challenge.nonce,
            session_cnonce.as_deref(),
        );
        self.cached = Some(CachedChallenge {
            challenge,
            proxy,
            nc: 0,
            ha1,
            session_cnonce,
        });
        Ok(true)
    }

    /// Add Authorization (or Proxy-Authorization) to `request` from the
    /// cached challenge. Returns false when nothing is cached.
    pub fn authorize(&mut self, request: &mut Request) -> Result<bool> {
        let Some(cached) = self.cached.as_mut() else {
            return Ok(false);
        };
        cached.nc += 1;
        let cnonce = cached.session_cnonce.clone().unwrap_or_else(generate_cnonce);
        let uri = request.uri.to_string();
        let answer = DigestResponse::answer_with_ha1(
            &cached.challenge,
            &self.credentials.username,
            &cached.ha1,
            request.method.as_str(),
            &uri,
            &request.body,
            cached.nc,
            Some(&cnonce),
        )?;
        let header = if cached.proxy {
            HeaderName::ProxyAuthorization
        } else {
            HeaderName::Authorization
        };
        request.headers.set(header, answer.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lws_sip_core::builder::{SimpleRequestBuilder, SimpleResponseBuilder};
    use lws_sip_core::{Method, NameAddr, Uri, Via};

    fn register() -> Request {
        SimpleRequestBuilder::new(Method::Register, "sip:example")
            .unwrap()
            .via(Via::new("UDP", "10.0.0.1", Some(5060), "z9hG4bKreg"))
            .from(NameAddr::new(Uri::sip("example").with_user("1001")).with_tag("t"))
            .to(NameAddr::new(Uri::sip("example").with_user("1001")))
            .call_id("reg@10.0.0.1")
            .cseq(1)
            .build()
            .unwrap()
    }

    fn challenge(status: StatusCode, header: HeaderName, value: &str) -> Response {
        SimpleResponseBuilder::from_request(&register(), status, None)
            .header(header, value)
            .build()
    }

    fn authorization(request: &Request, header: &HeaderName) -> DigestResponse {
        request.header(header).unwrap().parse().unwrap()
    }

    #[test]
    fn test_answer_401_md5() {
        let mut ctx = AuthContext::new(Credentials::new("1001", "p"));
        let response = challenge(
            StatusCode::Unauthorized,
            HeaderName::WwwAuthenticate,
            r#"Digest realm="example", nonce="n1", qop="auth""#,
        );
        assert!(ctx.on_challenge(&response, false).unwrap());

        let mut request = register();
        assert!(ctx.authorize(&mut request).unwrap());
        let answer = authorization(&request, &HeaderName::Authorization);
        assert_eq!(answer.username, "1001");
        assert_eq!(answer.uri, "sip:example");
        assert_eq!(answer.nc, Some(1));
        assert_eq!(answer.cnonce.as_ref().map(String::len), Some(32));
        assert!(answer.verify("p", "REGISTER", b""));
        assert!(!answer.verify("wrong", "REGISTER", b""));
    }

    #[test]
    fn test_preemptive_reuse_increments_nonce_count() {
        let mut ctx = AuthContext::new(Credentials::new("1001", "p"));
        let response = challenge(
            StatusCode::Unauthorized,
            HeaderName::WwwAuthenticate,
            r#"Digest realm="example", nonce="n1", qop="auth""#,
        );
        ctx.on_challenge(&response, false).unwrap();

        let mut first = register();
        ctx.authorize(&mut first).unwrap();
        let mut second = register();
        ctx.authorize(&mut second).unwrap();
        assert_eq!(authorization(&first, &HeaderName::Authorization).nc, Some(1));
        let second = authorization(&second, &HeaderName::Authorization);
        assert_eq!(second.nc, Some(2));
        assert_eq!(second.nonce, "n1");
        assert!(second.to_string().contains("nc=00000002"));
    }

    #[test]
    fn test_second_challenge_needs_stale() {
        let mut ctx = AuthContext::new(Credentials::new("1001", "p"));
        let first = challenge(
            StatusCode::Unauthorized,
            HeaderName::WwwAuthenticate,
            r#"Digest realm="example", nonce="n1""#,
        );
        assert!(ctx.on_challenge(&first, false).unwrap());
        assert!(!ctx.on_challenge(&first, true).unwrap());

        let stale = challenge(
            StatusCode::Unauthorized,
            HeaderName::WwwAuthenticate,
            r#"Digest realm="example", nonce="n2", stale=true"#,
        );
        assert!(ctx.on_challenge(&stale, true).unwrap());
        assert_eq!(ctx.nonce_count(), 0);
    }

    #[test]
    fn test_407_uses_proxy_authorization() {
        let mut ctx = AuthContext::new(Credentials::new("1001", "p"));
        let response = challenge(
            StatusCode::ProxyAuthenticationRequired,
            HeaderName::ProxyAuthenticate,
            r#"Digest realm="proxy", nonce="pn", algorithm=SHA-256, qop="auth""#,
        );
        ctx.on_challenge(&response, false).unwrap();
        let mut request = register();
        ctx.authorize(&mut request).unwrap();
        assert!(request.header(&HeaderName::Authorization).is_none());
        let answer = authorization(&request, &HeaderName::ProxyAuthorization);
        assert_eq!(answer.response.len(), 64);
        assert!(answer.verify("p", "REGISTER", b""));
    }

    #[test]
    fn test_md5_sess_keeps_session_cnonce() {
        let mut ctx = AuthContext::new(Credentials::new("1001", "p"));
        let response = challenge(
            StatusCode::Unauthorized,
            HeaderName::WwwAuthenticate,
            r#"Digest realm="example", nonce="n1", algorithm=MD5-sess, qop="auth""#,
        );
        ctx.on_challenge(&response, false).unwrap();
        let mut first = register();
        ctx.authorize(&mut first).unwrap();
        let mut second = register();
        ctx.authorize(&mut second).unwrap();
        let first = authorization(&first, &HeaderName::Authorization);
        let second = authorization(&second, &HeaderName::Authorization);
        assert_eq!(first.cnonce, second.cnonce);
        assert!(second.verify("p", "REGISTER", b""));
    }

    #[test]
    fn test_missing_challenge_header() {
        let mut ctx = AuthContext::new(Credentials::new("1001", "p"));
        let response = SimpleResponseBuilder::from_request(&register(), StatusCode::Unauthorized, None)
            .build();
        assert!(ctx.on_challenge(&response, false).is_err());
        let mut request = register();
        assert!(!ctx.authorize(&mut request).unwrap());
    }
}
