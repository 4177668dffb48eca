//! name-addr / addr-spec grammar

use nom::{
    branch::alt,
    bytes::complete::take_till1,
    character::complete::{char, space0},
    combinator::{all_consuming, map, opt},
    sequence::{delimited, pair, terminated, tuple},
};

use super::common::{params, quoted_string, ParseResult};
use super::uri::uri;
use crate::error::{Error, Result};
use crate::types::address::NameAddr;

fn display_name(input: &str) -> ParseResult<Option<String>> {
    alt((
        map(quoted_string, Some),
        map(take_till1(|c| c == '<' || c == '"'), |s: &str| {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }),
    ))(input)
}

fn bracketed(input: &str) -> ParseResult<NameAddr> {
    let (input, (display_name, _, uri, params)) = tuple((
        opt(display_name),
        space0,
        delimited(char('<'), uri, char('>')),
        params,
    ))(input)?;
    Ok((
        input,
        NameAddr {
            display_name: display_name.flatten(),
            uri,
            params,
        },
    ))
}

/// Bare addr-spec: parameters after the URI belong to the header
fn addr_spec(input: &str) -> ParseResult<NameAddr> {
    let (input, (mut uri, trailing)) = pair(uri, params)(input)?;
    let mut header_params = std::mem::take(&mut uri.params);
    header_params.extend(trailing);
    Ok((
        input,
        NameAddr {
            display_name: None,
            uri,
            params: header_params,
        },
    ))
}

pub fn name_addr(input: &str) -> ParseResult<NameAddr> {
    alt((bracketed, addr_spec))(input)
}

/// Parse a complete From/To/Contact/Route value
pub fn parse_name_addr(s: &str) -> Result<NameAddr> {
    all_consuming(terminated(name_addr, space0))(s.trim())
        .map(|(_, addr)| addr)
        .map_err(|_| Error::header("name-addr", s))
}
