//! Via grammar (RFC 3261 Section 20.42)

use nom::{
    bytes::complete::{tag, tag_no_case},
    character::complete::{char, space0, space1},
    combinator::{all_consuming, opt},
    sequence::{terminated, tuple},
};

use super::common::{params, token, ParseResult};
use super::uri::{host, port};
use crate::error::{Error, Result};
use crate::types::via::{Via, MAX_BRANCH_LEN};

pub fn via(input: &str) -> ParseResult<Via> {
    let (input, (_, _, _, _, _, _, _, _, transport, _)) = tuple((
        tag_no_case("SIP"),
        space0,
        char('/'),
        space0,
        tag("2.0"),
        space0,
        char('/'),
        space0,
        token,
        space1,
    ))(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(port)(input)?;
    let (input, params) = params(input)?;

    Ok((
        input,
        Via {
            transport: transport.to_ascii_uppercase(),
            host: host.to_string(),
            port,
            params,
        },
    ))
}

/// Parse a single Via value
pub fn parse_via(s: &str) -> Result<Via> {
    let (_, via) = all_consuming(terminated(via, space0))(s.trim())
        .map_err(|_| Error::header("Via", s))?;
    if let Some(branch) = via.branch() {
        if branch.len() > MAX_BRANCH_LEN {
            return Err(Error::header(
                "Via",
                format!("branch longer than {} characters", MAX_BRANCH_LEN),
            ));
        }
    }
    Ok(via)
}
