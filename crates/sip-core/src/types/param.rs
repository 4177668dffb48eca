//! Generic `name[=value]` parameters used by URIs and header values

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single `;name=value` or `;flag` parameter.
///
/// Values are kept verbatim, including surrounding quotes when the sender
/// used a quoted-string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: Option<String>,
}

impl Param {
    /// `name=value` parameter
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Value-less parameter such as `lr` or `rport`
    pub fn flag(name: impl Into<String>) -> Self {
        Param {
            name: name.into(),
            value: None,
        }
    }

    /// Value with surrounding quotes removed
    pub fn unquoted_value(&self) -> Option<&str> {
        self.value.as_deref().map(|v| {
            v.strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v)
        })
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// Look a parameter up by case-insensitive name.
///
/// Returns `Some(None)` for a flag parameter and `None` when absent.
pub fn find_param<'a>(params: &'a [Param], name: &str) -> Option<Option<&'a str>> {
    params
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .map(|p| p.unquoted_value())
}

/// Replace or append a parameter
pub fn set_param(params: &mut Vec<Param>, param: Param) {
    match params
        .iter_mut()
        .find(|p| p.name.eq_ignore_ascii_case(&param.name))
    {
        Some(existing) => *existing = param,
        None => params.push(param),
    }
}

pub(crate) fn write_params(f: &mut fmt::Formatter<'_>, params: &[Param]) -> fmt::Result {
    for param in params {
        write!(f, ";{}", param)?;
    }
    Ok(())
}
