//! Target resolution.
//!
//! Turns an inbound scrape request into the canonical [`TargetId`] that keys
//! the exporter cache. Two requests that should share an exporter must
//! resolve to byte-identical ids, so every normalisation rule lives here.

use std::fmt;

use axum::http::Request;
use percent_encoding::percent_decode_str;
use serde::Serialize;

use crate::error::{ProxyError, Result};

/// Port assumed when a seed omits one.
pub const DEFAULT_PORT: u16 = 27017;

/// Query parameters accepted as the target address, in priority order.
pub const TARGET_PARAMS: [&str; 2] = ["target", "address"];

/// Canonical identity of a scrape target.
///
/// A sorted, de-duplicated, comma-joined list of `host:port` seeds with
/// lower-cased hosts, e.g. `10.0.0.1:27017,10.0.0.2:27017`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The individual `host:port` seeds of this target.
    pub fn seeds(&self) -> impl Iterator<Item = &str> {
        self.0.split(',')
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TargetId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stateless parser from scrape requests to [`TargetId`]s.
#[derive(Debug, Clone)]
pub struct TargetResolver {
    default_port: u16,
}

impl Default for TargetResolver {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

impl TargetResolver {
    /// Create a resolver that fills in `default_port` for bare hosts.
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }

    /// Resolve the target named by a request's query string.
    pub fn resolve<B>(&self, request: &Request<B>) -> Result<TargetId> {
        self.resolve_query(request.uri().query())
    }

    /// Resolve the target named by a raw (still escaped) query string.
    pub fn resolve_query(&self, query: Option<&str>) -> Result<TargetId> {
        let query = query.unwrap_or_default();

        let value = TARGET_PARAMS
            .iter()
            .find_map(|name| {
                form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.into_owned())
            })
            .ok_or_else(|| {
                ProxyError::malformed(format!(
                    "missing required query parameter '{}'",
                    TARGET_PARAMS[0]
                ))
            })?;

        self.parse_target(&value)
    }

    /// Canonicalise a comma-separated seed list.
    pub fn parse_target(&self, value: &str) -> Result<TargetId> {
        if value.trim().is_empty() {
            return Err(ProxyError::malformed("target parameter is empty"));
        }

        let mut seeds = value
            .split(',')
            .map(|seed| self.parse_seed(seed))
            .collect::<Result<Vec<_>>>()?;

        seeds.sort();
        seeds.dedup();

        Ok(TargetId(seeds.join(",")))
    }

    fn parse_seed(&self, raw: &str) -> Result<String> {
        let seed = raw.trim();
        if seed.is_empty() {
            return Err(ProxyError::malformed("empty seed in target list"));
        }

        let (host, port, bracketed) = if let Some(rest) = seed.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                ProxyError::malformed(format!("unterminated IPv6 literal in seed '{}'", seed))
            })?;
            let port = match tail {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(|| {
                    ProxyError::malformed(format!("unexpected characters after ']' in '{}'", seed))
                })?),
            };
            (host, port, true)
        } else {
            match seed.split_once(':') {
                Some((_, port)) if port.contains(':') => {
                    return Err(ProxyError::malformed(format!(
                        "IPv6 seed '{}' must be written as [host]:port",
                        seed
                    )));
                }
                Some((host, port)) => (host, Some(port), false),
                None => (seed, None, false),
            }
        };

        validate_host(host, seed)?;

        let port = match port {
            Some(port) => parse_port(port, seed)?,
            None => self.default_port,
        };

        let host = host.to_ascii_lowercase();
        if bracketed {
            Ok(format!("[{}]:{}", host, port))
        } else {
            Ok(format!("{}:{}", host, port))
        }
    }
}

fn validate_host(host: &str, seed: &str) -> Result<()> {
    if host.is_empty() {
        return Err(ProxyError::malformed(format!("missing host in seed '{}'", seed)));
    }
    if host
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#'))
    {
        return Err(ProxyError::malformed(format!(
            "invalid character in host of seed '{}'",
            seed
        )));
    }
    Ok(())
}

fn parse_port(port: &str, seed: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ProxyError::malformed(format!(
            "invalid port '{}' in seed '{}'",
            port, seed
        ))),
        Ok(port) => Ok(port),
    }
}

/// Decode a raw query string for diagnostics (`%XX` sequences and `+`).
///
/// Falls back to the raw query when the decoded bytes are not UTF-8.
pub fn unescape_query(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    match percent_decode_str(&plus_decoded).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}
