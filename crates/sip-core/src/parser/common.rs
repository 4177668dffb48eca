//! Lexical building blocks shared by the header-value grammars

use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::{char, space0},
    combinator::{map, opt},
    error::{Error as NomError, ErrorKind},
    multi::many0,
    sequence::{pair, preceded, tuple},
    IResult,
};

use crate::types::param::Param;

/// Parser result over header text
pub type ParseResult<'a, O> = IResult<&'a str, O>;

/// RFC 3261 `token` characters
pub fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, b'-' | b'.' | b'!' | b'%' | b'*' | b'_' | b'+' | b'`' | b'\'' | b'~')
}

pub fn token(input: &str) -> ParseResult<&str> {
    take_while1(|c: char| c.is_ascii() && is_token_char(c as u8))(input)
}

/// Quoted string including its quotes, escapes left in place
pub fn quoted_raw(input: &str) -> ParseResult<&str> {
    let (rest, _) = char('"')(input)?;
    let mut escaped = false;
    for (idx, c) in rest.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => {
                let end = idx + 2;
                return Ok((&input[end..], &input[..end]));
            }
            _ => {}
        }
    }
    Err(nom::Err::Error(NomError::new(input, ErrorKind::Char)))
}

/// Quoted string with quotes stripped and escapes resolved
pub fn quoted_string(input: &str) -> ParseResult<String> {
    map(quoted_raw, unquote)(input)
}

/// Strip surrounding quotes and resolve `\x` escapes
pub fn unquote(raw: &str) -> String {
    let inner = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn is_param_value_char(c: char) -> bool {
    !matches!(c, ';' | ',' | '?' | '<' | '>' | '"') && !c.is_whitespace()
}

/// `name[=value]` where value is a token-like run or a quoted string
pub fn generic_param(input: &str) -> ParseResult<Param> {
    let (input, name) = token(input)?;
    let (input, value) = opt(preceded(
        tuple((space0, char('='), space0)),
        nom::branch::alt((quoted_raw, take_while(is_param_value_char))),
    ))(input)?;
    Ok((
        input,
        Param {
            name: name.to_string(),
            value: value.map(str::to_string),
        },
    ))
}

/// Zero or more `;param` entries
pub fn params(input: &str) -> ParseResult<Vec<Param>> {
    many0(preceded(
        pair(space0, pair(char(';'), space0)),
        generic_param,
    ))(input)
}

/// Split a header value on commas that are outside quotes and angle brackets.
/// Empty elements are dropped.
pub fn split_list(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut angle = 0usize;

    for (idx, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => angle += 1,
            '>' if !in_quotes => angle = angle.saturating_sub(1),
            ',' if !in_quotes && angle == 0 => {
                items.push(value[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    items.push(value[start..].trim());
    items.retain(|s| !s.is_empty());
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_raw_with_escapes() {
        let (rest, raw) = quoted_raw("\"a \\\"b\\\", c\";x").unwrap();
        assert_eq!(raw, "\"a \\\"b\\\", c\"");
        assert_eq!(rest, ";x");
        assert_eq!(unquote(raw), "a \"b\", c");
        assert!(quoted_raw("\"unterminated").is_err());
    }

    #[test]
    fn test_params() {
        let (rest, params) = params(";branch=z9hG4bK1 ; rport;received=10.0.0.1>").unwrap();
        assert_eq!(rest, ">");
        assert_eq!(params.len(), 3);
        assert_eq!(params[0], Param::new("branch", "z9hG4bK1"));
        assert_eq!(params[1], Param::flag("rport"));
        assert_eq!(params[2].value.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_split_list_respects_quotes_and_brackets() {
        let items = split_list("\"Doe, John\" <sip:j@x.com;a=1,2>, <sip:k@y.com> ,,");
        assert_eq!(items, vec!["\"Doe, John\" <sip:j@x.com;a=1,2>", "<sip:k@y.com>"]);
        assert_eq!(split_list("INVITE, ACK,BYE"), vec!["INVITE", "ACK", "BYE"]);
    }
}
