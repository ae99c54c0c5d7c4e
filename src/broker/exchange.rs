//! Exchange definitions
//!
//! Exchanges never hold messages. They are named routing rules whose kind
//! decides how a binding key is compared with a publish routing key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of the always-present default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Fanout,
    Direct,
    Topic,
}

impl ExchangeKind {
    /// Does a binding with `binding_key` accept a publish with `routing_key`?
    pub fn matches(self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            Self::Fanout => true,
            Self::Direct => binding_key == routing_key,
            Self::Topic => topic_matches(binding_key, routing_key),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
            Self::Topic => "topic",
        };
        f.write_str(s)
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fanout" => Ok(Self::Fanout),
            "direct" => Ok(Self::Direct),
            "topic" => Ok(Self::Topic),
            other => Err(format!("unsupported exchange type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    /// Exchange that receives publishes this one cannot route anywhere.
    #[serde(default)]
    pub alternate_exchange: Option<String>,
}

impl Exchange {
    pub fn new(name: &str, kind: ExchangeKind, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            durable,
            alternate_exchange: None,
        }
    }

    pub fn with_alternate(mut self, alternate: &str) -> Self {
        self.alternate_exchange = Some(alternate.to_string());
        self
    }

    /// Describes the first parameter that differs, if any.
    pub(crate) fn incompatibility(&self, other: &Exchange) -> Option<String> {
        if self.kind != other.kind {
            return Some(format!("type {} != {}", self.kind, other.kind));
        }
        if self.durable != other.durable {
            return Some(format!("durable {} != {}", self.durable, other.durable));
        }
        if self.alternate_exchange != other.alternate_exchange {
            return Some("alternate exchange differs".to_string());
        }
        None
    }
}

/// Match a dot-delimited routing key against a topic pattern.
///
/// `*` matches exactly one segment, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            // collapse runs of '#'
            if rest.first() == Some(&"#") {
                return match_segments(rest, key);
            }
            (0..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((&"*", rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((segment, rest)) => {
            key.first() == Some(segment) && match_segments(rest, &key[1..])
        }
    }
}
