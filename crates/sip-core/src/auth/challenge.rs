//! WWW-Authenticate / Proxy-Authenticate challenges

use std::fmt;
use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, multispace0, space0, space1},
    combinator::{all_consuming, map, opt},
    multi::separated_list0,
    sequence::{delimited, separated_pair, terminated, tuple},
};
use serde::{Deserialize, Serialize};

use super::digest::{Algorithm, Qop};
use crate::error::{Error, Result};
use crate::parser::common::{quoted_string, token, ParseResult};

/// Authentication scheme
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthScheme {
    Digest,
    Basic,
    Other(String),
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Digest => f.write_str("Digest"),
            AuthScheme::Basic => f.write_str("Basic"),
            AuthScheme::Other(s) => f.write_str(s),
        }
    }
}

impl FromStr for AuthScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "digest" => Ok(AuthScheme::Digest),
            "basic" => Ok(AuthScheme::Basic),
            _ if !s.is_empty() => Ok(AuthScheme::Other(s.to_string())),
            _ => Err(Error::InvalidInput("Empty scheme name".to_string())),
        }
    }
}

fn auth_param(input: &str) -> ParseResult<(String, String)> {
    map(
        separated_pair(
            token,
            tuple((space0, char('='), space0)),
            alt((
                quoted_string,
                map(
                    take_while1(|c: char| c != ',' && !c.is_whitespace()),
                    str::to_string,
                ),
            )),
        ),
        |(name, value)| (name.to_string(), value),
    )(input)
}

fn challenge_params(input: &str) -> ParseResult<(&str, Vec<(String, String)>)> {
    tuple((
        terminated(token, space1),
        separated_list0(delimited(multispace0, char(','), multispace0), auth_param),
    ))(input)
}

/// Split `Scheme name=value, name="quoted, value"` into scheme and
/// unquoted parameters
pub fn parse_auth_params(s: &str) -> Result<(AuthScheme, Vec<(String, String)>)> {
    let (_, (scheme, params)) = all_consuming(terminated(
        challenge_params,
        opt(tuple((multispace0, opt(char(',')), multispace0))),
    ))(s.trim())
    .map_err(|_| Error::AuthError(format!("Malformed auth header: {}", s)))?;
    Ok((scheme.parse()?, params))
}

/// A parsed authentication challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub scheme: AuthScheme,
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Algorithm,
    /// Offered qop values, in server order
    pub qop: Vec<Qop>,
    pub stale: bool,
    pub domain: Option<String>,
}

impl Challenge {
    /// `auth` when offered, else the first offered value
    pub fn preferred_qop(&self) -> Option<Qop> {
        if self.qop.contains(&Qop::Auth) {
            Some(Qop::Auth)
        } else {
            self.qop.first().cloned()
        }
    }
}

impl FromStr for Challenge {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, params) = parse_auth_params(s)?;
        let get = |name: &str| {
            params
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };
        let realm = get("realm").ok_or_else(|| Error::AuthError("Challenge without realm".into()))?;
        let nonce = match scheme {
            AuthScheme::Digest => {
                get("nonce").ok_or_else(|| Error::AuthError("Challenge without nonce".into()))?
            }
            _ => get("nonce").unwrap_or_default(),
        };
        let qop = match get("qop") {
            Some(list) => list
                .split(',')
                .filter(|q| !q.trim().is_empty())
                .map(Qop::from_str)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Challenge {
            scheme,
            realm,
            nonce,
            opaque: get("opaque"),
            algorithm: get("algorithm")
                .map(|a| a.parse())
                .transpose()?
                .unwrap_or_default(),
            qop,
            stale: get("stale")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            domain: get("domain"),
        })
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} realm=\"{}\", nonce=\"{}\", algorithm={}",
            self.scheme, self.realm, self.nonce, self.algorithm
        )?;
        if !self.qop.is_empty() {
            let qop: Vec<String> = self.qop.iter().map(|q| q.to_string()).collect();
            write!(f, ", qop=\"{}\"", qop.join(","))?;
        }
        if let Some(opaque) = &self.opaque {
            write!(f, ", opaque=\"{}\"", opaque)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, ", domain=\"{}\"", domain)?;
        }
        if self.stale {
            f.write_str(", stale=TRUE")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge: Challenge = r#"Digest realm="atlanta.com", domain="sip:ss1.carrier.com",
            qop="auth", nonce="f84f1cec41e6cbe5aea9c8e88d359", opaque="", stale=FALSE, algorithm=MD5"#
            .parse()
            .unwrap();
        assert_eq!(challenge.scheme, AuthScheme::Digest);
        assert_eq!(challenge.realm, "atlanta.com");
        assert_eq!(challenge.nonce, "f84f1cec41e6cbe5aea9c8e88d359");
        assert_eq!(challenge.opaque.as_deref(), Some(""));
        assert_eq!(challenge.qop, vec![Qop::Auth]);
        assert!(!challenge.stale);
        assert_eq!(challenge.algorithm, Algorithm::Md5);
    }

    #[test]
    fn test_quoted_commas_do_not_split_params() {
        let (scheme, params) =
            parse_auth_params(r#"Digest realm="a, b", qop="auth,auth-int", nonce=xyz"#).unwrap();
        assert_eq!(scheme, AuthScheme::Digest);
        assert_eq!(params[0], ("realm".to_string(), "a, b".to_string()));
        assert_eq!(params[1].1, "auth,auth-int");
        assert_eq!(params[2].1, "xyz");
    }

    #[test]
    fn test_missing_nonce_rejected() {
        assert!(r#"Digest realm="r""#.parse::<Challenge>().is_err());
        assert!("Digest".parse::<Challenge>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let challenge: Challenge =
            r#"Digest realm="r", nonce="n", qop="auth", algorithm=SHA-256, stale=true"#
                .parse()
                .unwrap();
        let again: Challenge = challenge.to_string().parse().unwrap();
        assert_eq!(again, challenge);
    }
}
