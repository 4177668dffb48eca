use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::challenge::{parse_auth_params, AuthScheme, Challenge};
use crate::error::{Error, Result};

/// Digest hash algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Algorithm {
    #[default]
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl Algorithm {
    /// Lower-case hex digest of `data`
    pub fn hash(&self, data: &[u8]) -> String {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => format!("{:x}", md5::compute(data)),
            Algorithm::Sha256 | Algorithm::Sha256Sess => hex::encode(Sha256::digest(data)),
        }
    }

    /// `-sess` variants fold nonce and cnonce into HA1
    pub fn is_session(&self) -> bool {
        matches!(self, Algorithm::Md5Sess | Algorithm::Sha256Sess)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha256Sess => "SHA-256-sess",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Algorithm::Md5),
            "md5-sess" => Ok(Algorithm::Md5Sess),
            "sha-256" => Ok(Algorithm::Sha256),
            "sha-256-sess" => Ok(Algorithm::Sha256Sess),
            _ => Err(Error::AuthError(format!("Unsupported algorithm: {}", s))),
        }
    }
}

/// Quality of protection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Qop {
    Auth,
    AuthInt,
    Other(String),
}

impl fmt::Display for Qop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qop::Auth => f.write_str("auth"),
            Qop::AuthInt => f.write_str("auth-int"),
            Qop::Other(s) => f.write_str(s),
        }
    }
}

impl FromStr for Qop {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "auth" => Qop::Auth,
            "auth-int" => Qop::AuthInt,
            "" => return Err(Error::AuthError("Empty qop".into())),
            other => Qop::Other(other.to_string()),
        })
    }
}

/// HA1 = H(user:realm:password), extended with nonce and cnonce for `-sess`
pub fn compute_ha1(
    algorithm: Algorithm,
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: Option<&str>,
) -> String {
    let ha1 = algorithm.hash(format!("{}:{}:{}", username, realm, password).as_bytes());
    if algorithm.is_session() {
        let cnonce = cnonce.unwrap_or_default();
        algorithm.hash(format!("{}:{}:{}", ha1, nonce, cnonce).as_bytes())
    } else {
        ha1
    }
}

/// Request digest from a precomputed HA1.
///
/// Without qop this is the RFC 2069 form `H(HA1:nonce:HA2)`.
#[allow(clippy::too_many_arguments)]
pub fn compute_response(
    algorithm: Algorithm,
    ha1: &str,
    nonce: &str,
    nc: u32,
    cnonce: &str,
    qop: Option<&Qop>,
    method: &str,
    uri: &str,
    body: &[u8],
) -> String {
    let ha2 = match qop {
        Some(Qop::AuthInt) => {
            let body_hash = algorithm.hash(body);
            algorithm.hash(format!("{}:{}:{}", method, uri, body_hash).as_bytes())
        }
        _ => algorithm.hash(format!("{}:{}", method, uri).as_bytes()),
    };
    match qop {
        Some(qop) => algorithm.hash(
            format!("{}:{}:{:08x}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2).as_bytes(),
        ),
        None => algorithm.hash(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes()),
    }
}

/// Fresh client nonce, 128 random bits as 32 hex characters
pub fn generate_cnonce() -> String {
    let value: u128 = rand::thread_rng().gen();
    format!("{:032x}", value)
}

/// Credentials carried in Authorization / Proxy-Authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Algorithm,
    pub cnonce: Option<String>,
    pub qop: Option<Qop>,
    pub nc: Option<u32>,
    pub opaque: Option<String>,
}

impl DigestResponse {
    /// Answer `challenge` for a request.
    ///
    /// `auth` is preferred when offered; `auth-int` is used only when it is
    /// the sole qop. A random cnonce is generated when none is supplied.
    #[allow(clippy::too_many_arguments)]
    pub fn answer(
        challenge: &Challenge,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        body: &[u8],
        nc: u32,
        cnonce: Option<&str>,
    ) -> Result<Self> {
        let ha1 = compute_ha1(
            challenge.algorithm,
            username,
            &challenge.realm,
            password,
            &challenge.nonce,
            cnonce,
        );
        Self::answer_with_ha1(challenge, username, &ha1, method, uri, body, nc, cnonce)
    }

    /// Same as [`DigestResponse::answer`] with a cached HA1
    #[allow(clippy::too_many_arguments)]
    pub fn answer_with_ha1(
        challenge: &Challenge,
        username: &str,
        ha1: &str,
        method: &str,
        uri: &str,
        body: &[u8],
        nc: u32,
        cnonce: Option<&str>,
    ) -> Result<Self> {
        if challenge.scheme != AuthScheme::Digest {
            return Err(Error::AuthError(format!(
                "Unsupported scheme: {}",
                challenge.scheme
            )));
        }
        let qop = challenge.preferred_qop();
        let cnonce = match (&qop, cnonce) {
            (None, _) if !challenge.algorithm.is_session() => None,
            (_, Some(c)) => Some(c.to_string()),
            (_, None) => Some(generate_cnonce()),
        };
        let response = compute_response(
            challenge.algorithm,
            ha1,
            &challenge.nonce,
            nc,
            cnonce.as_deref().unwrap_or_default(),
            qop.as_ref(),
            method,
            uri,
            body,
        );
        Ok(DigestResponse {
            username: username.to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            algorithm: challenge.algorithm,
            nc: qop.as_ref().map(|_| nc),
            cnonce,
            qop,
            opaque: challenge.opaque.clone(),
        })
    }

    /// Recompute the digest with `password` and compare
    pub fn verify(&self, password: &str, method: &str, body: &[u8]) -> bool {
        let ha1 = compute_ha1(
            self.algorithm,
            &self.username,
            &self.realm,
            password,
            &self.nonce,
            self.cnonce.as_deref(),
        );
        let expected = compute_response(
            self.algorithm,
            &ha1,
            &self.nonce,
            self.nc.unwrap_or(0),
            self.cnonce.as_deref().unwrap_or_default(),
            self.qop.as_ref(),
            method,
            &self.uri,
            body,
        );
        expected.eq_ignore_ascii_case(&self.response)
    }
}

impl fmt::Display for DigestResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            self.username, self.realm, self.nonce, self.uri, self.response, self.algorithm
        )?;
        if let Some(cnonce) = &self.cnonce {
            write!(f, ", cnonce=\"{}\"", cnonce)?;
        }
        if let Some(qop) = &self.qop {
            write!(f, ", qop={}", qop)?;
        }
        if let Some(nc) = self.nc {
            write!(f, ", nc={:08x}", nc)?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        Ok(())
    }
}

impl FromStr for DigestResponse {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, params) = parse_auth_params(s)?;
        if scheme != AuthScheme::Digest {
            return Err(Error::AuthError(format!("Unsupported scheme: {}", scheme)));
        }
        let get = |name: &str| {
            params
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        let require = |name: &str| {
            get(name).ok_or_else(|| Error::AuthError(format!("Missing {} parameter", name)))
        };
        Ok(DigestResponse {
            username: require("username")?,
            realm: require("realm")?,
            nonce: require("nonce")?,
            uri: require("uri")?,
            response: require("response")?,
            algorithm: get("algorithm")
                .map(|a| a.parse())
                .transpose()?
                .unwrap_or_default(),
            cnonce: get("cnonce"),
            qop: get("qop").map(|q| q.parse()).transpose()?,
            nc: get("nc")
                .map(|nc| {
                    u32::from_str_radix(&nc, 16)
                        .map_err(|_| Error::AuthError(format!("Invalid nc: {}", nc)))
                })
                .transpose()?,
            opaque: get("opaque"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc2617_example() {
        // RFC 2617 Section 3.5
        let ha1 = compute_ha1(
            Algorithm::Md5,
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            None,
        );
        let response = compute_response(
            Algorithm::Md5,
            &ha1,
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            1,
            "0a4f113b",
            Some(&Qop::Auth),
            "GET",
            "/dir/index.html",
            b"",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_answer_without_qop_uses_rfc2069_form() {
        let challenge: Challenge = r#"Digest realm="biloxi.com", nonce="n1""#.parse().unwrap();
        let answer =
            DigestResponse::answer(&challenge, "bob", "zanzibar", "INVITE", "sip:bob@biloxi.com", b"", 1, None)
                .unwrap();
        assert_eq!(answer.qop, None);
        assert_eq!(answer.nc, None);
        assert_eq!(answer.cnonce, None);

        let ha1 = Algorithm::Md5.hash(b"bob:biloxi.com:zanzibar");
        let ha2 = Algorithm::Md5.hash(b"INVITE:sip:bob@biloxi.com");
        assert_eq!(answer.response, Algorithm::Md5.hash(format!("{}:n1:{}", ha1, ha2).as_bytes()));
    }

    #[test]
    fn test_sha256_answer_verifies() {
        let challenge: Challenge =
            r#"Digest realm="r", nonce="n", qop="auth,auth-int", algorithm=SHA-256, opaque="o""#
                .parse()
                .unwrap();
        let answer = DigestResponse::answer(&challenge, "u", "p", "REGISTER", "sip:r", b"", 3, Some("c"))
            .unwrap();
        assert_eq!(answer.qop, Some(Qop::Auth));
        assert_eq!(answer.response.len(), 64);
        assert!(answer.verify("p", "REGISTER", b""));
        assert!(!answer.verify("wrong", "REGISTER", b""));

        let header = answer.to_string();
        assert!(header.contains("nc=00000003"));
        assert!(header.contains("opaque=\"o\""));
        let parsed: DigestResponse = header.parse().unwrap();
        assert_eq!(parsed, answer);
    }

    #[test]
    fn test_md5_sess_folds_cnonce() {
        let plain = compute_ha1(Algorithm::Md5, "u", "r", "p", "n", Some("c"));
        let sess = compute_ha1(Algorithm::Md5Sess, "u", "r", "p", "n", Some("c"));
        assert_eq!(sess, Algorithm::Md5.hash(format!("{}:n:c", plain).as_bytes()));
    }

    #[test]
    fn test_auth_int_hashes_body() {
        let challenge: Challenge = r#"Digest realm="r", nonce="n", qop="auth-int""#.parse().unwrap();
        let a = DigestResponse::answer(&challenge, "u", "p", "MESSAGE", "sip:x", b"hello", 1, Some("c")).unwrap();
        let b = DigestResponse::answer(&challenge, "u", "p", "MESSAGE", "sip:x", b"world", 1, Some("c")).unwrap();
        assert_eq!(a.qop, Some(Qop::AuthInt));
        assert_ne!(a.response, b.response);
    }
}
