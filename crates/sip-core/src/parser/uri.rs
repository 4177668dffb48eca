//! URI grammar (RFC 3261 Section 25.1, simplified)

use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{take_till1, take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, separated_pair, terminated},
};

use super::common::ParseResult;
use crate::error::{Error, Result};
use crate::types::param::Param;
use crate::types::uri::{Scheme, Uri};

fn scheme(input: &str) -> ParseResult<Scheme> {
    map_res(
        terminated(
            take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
            char(':'),
        ),
        Scheme::from_str,
    )(input)
}

fn userinfo(input: &str) -> ParseResult<(String, Option<String>)> {
    let (input, info) = terminated(
        take_till1(|c: char| c == '@' || c == '>' || c.is_whitespace()),
        char('@'),
    )(input)?;
    let parsed = match info.split_once(':') {
        Some((user, password)) => (user.to_string(), Some(password.to_string())),
        None => (info.to_string(), None),
    };
    Ok((input, parsed))
}

/// Host name, IPv4 address or bracketed IPv6 reference
pub(crate) fn host(input: &str) -> ParseResult<&str> {
    alt((
        recognize(delimited(
            char('['),
            take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
            char(']'),
        )),
        take_while1(|c: char| {
            !matches!(c, ':' | ';' | '?' | '<' | '>' | '@' | ',' | '"') && !c.is_whitespace()
        }),
    ))(input)
}

pub(crate) fn port(input: &str) -> ParseResult<u16> {
    preceded(char(':'), map_res(digit1, u16::from_str))(input)
}

fn is_uri_value_char(c: char) -> bool {
    !matches!(c, ';' | '?' | '>' | ',' | '&') && !c.is_whitespace()
}

fn uri_param(input: &str) -> ParseResult<Param> {
    let (input, (name, value)) = preceded(
        char(';'),
        pair(
            take_while1(|c: char| is_uri_value_char(c) && c != '='),
            opt(preceded(char('='), take_while(is_uri_value_char))),
        ),
    )(input)?;
    Ok((
        input,
        Param {
            name: name.to_string(),
            value: value.map(str::to_string),
        },
    ))
}

fn uri_headers(input: &str) -> ParseResult<Vec<(String, String)>> {
    let (input, pairs) = preceded(
        char('?'),
        separated_list1(
            char('&'),
            separated_pair(
                take_while1(|c: char| !matches!(c, '=' | '&' | '>') && !c.is_whitespace()),
                char('='),
                take_while(|c: char| !matches!(c, '&' | '>') && !c.is_whitespace()),
            ),
        ),
    )(input)?;
    Ok((
        input,
        pairs
            .into_iter()
            .map(|(n, v): (&str, &str)| (n.to_string(), v.to_string()))
            .collect(),
    ))
}

/// Parse a URI, stopping at the first character that cannot belong to it
pub fn uri(input: &str) -> ParseResult<Uri> {
    let (input, scheme) = scheme(input)?;
    let (input, info) = opt(userinfo)(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(port)(input)?;
    let (input, params) = many0(uri_param)(input)?;
    let (input, headers) = opt(uri_headers)(input)?;

    let (user, password) = match info {
        Some((user, password)) => (Some(user), password),
        None => (None, None),
    };
    Ok((
        input,
        Uri {
            scheme,
            user,
            password,
            host: host.to_string(),
            port,
            params,
            headers: headers.unwrap_or_default(),
        },
    ))
}

/// Parse a complete URI string
pub fn parse_uri(s: &str) -> Result<Uri> {
    all_consuming(uri)(s.trim())
        .map(|(_, uri)| uri)
        .map_err(|_| Error::InvalidUri(s.to_string()))
}
