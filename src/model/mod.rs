use std::{collections::BTreeMap, fmt::Display};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod input;

pub use input::{Input, Rev};

/// A loosely typed attribute bag, as exchanged with the fetcher cache and
/// accepted at the input boundary.
pub type Attrs = BTreeMap<String, Attr>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attr {
    Bool(bool),
    Int(u64),
    String(String),
}

impl Attr {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attr::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attr::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Attr::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Attr::Bool(_) => "a Boolean",
            Attr::Int(_) => "an integer",
            Attr::String(_) => "a string",
        }
    }
}

impl From<&str> for Attr {
    fn from(value: &str) -> Self {
        Attr::String(value.to_owned())
    }
}

impl From<String> for Attr {
    fn from(value: String) -> Self {
        Attr::String(value)
    }
}

impl From<bool> for Attr {
    fn from(value: bool) -> Self {
        Attr::Bool(value)
    }
}

impl From<u64> for Attr {
    fn from(value: u64) -> Self {
        Attr::Int(value)
    }
}

impl Display for Attr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attr::Bool(b) => write!(f, "{b}"),
            Attr::Int(i) => write!(f, "{i}"),
            Attr::String(s) => f.write_str(s),
        }
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Input type `{0}` is not supported by the Git fetcher")]
    UnsupportedType(String),
    #[error("Unsupported Git input attribute `{0}`")]
    UnsupportedAttribute(String),
    #[error("Missing attribute `{0}`")]
    MissingAttribute(String),
    #[error("Attribute `{name}` should be {expected} but is {actual}")]
    WrongType {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Invalid URL `{url}`: {source}")]
    Url {
        url: String,
        source: url::ParseError,
    },
    #[error("URL scheme `{0}` is not a Git scheme")]
    UnsupportedScheme(String),
    #[error("Invalid Git branch/tag name `{0}`")]
    BadRef(String),
    #[error("Invalid Git revision `{0}` (expected 40 hexadecimal digits)")]
    BadRev(String),
    #[error("Git input `{0}` has a commit hash but no branch/tag name")]
    RevWithoutRef(String),
}

pub(crate) fn get_str<'a>(attrs: &'a Attrs, name: &str) -> Result<Option<&'a str>, ParseError> {
    match attrs.get(name) {
        None => Ok(None),
        Some(Attr::String(s)) => Ok(Some(s)),
        Some(other) => Err(wrong_type(name, "a string", other)),
    }
}

pub(crate) fn get_bool(attrs: &Attrs, name: &str) -> Result<Option<bool>, ParseError> {
    match attrs.get(name) {
        None => Ok(None),
        Some(Attr::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(wrong_type(name, "a Boolean", other)),
    }
}

pub(crate) fn get_int(attrs: &Attrs, name: &str) -> Result<Option<u64>, ParseError> {
    match attrs.get(name) {
        None => Ok(None),
        Some(Attr::Int(i)) => Ok(Some(*i)),
        Some(other) => Err(wrong_type(name, "an integer", other)),
    }
}

fn wrong_type(name: &str, expected: &'static str, actual: &Attr) -> ParseError {
    ParseError::WrongType {
        name: name.to_owned(),
        expected,
        actual: actual.kind(),
    }
}
