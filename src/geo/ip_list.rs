//! IP allow and deny lists.
//!
//! Entries are literal addresses, `*` wildcards (`192.168.*`, `*`) or CIDR
//! networks. Lists are copy-on-write snapshots: request paths read them
//! without locking and admin writes swap in a new vector.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::middleware::ip::parse_ip;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpListError {
    #[error("invalid IP pattern '{0}'")]
    InvalidPattern(String),
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(IpAddr),
    Network(IpNet),
    Wildcard(Regex),
}

/// One parsed list entry, keeping its original spelling.
#[derive(Debug, Clone)]
pub struct IpPattern {
    raw: String,
    matcher: Matcher,
}

impl IpPattern {
    pub fn parse(raw: &str) -> Result<Self, IpListError> {
        let trimmed = raw.trim();
        let invalid = || IpListError::InvalidPattern(raw.to_string());

        let matcher = if trimmed.contains('*') {
            if !trimmed
                .chars()
                .all(|c| c.is_ascii_hexdigit() || matches!(c, '.' | ':' | '*'))
            {
                return Err(invalid());
            }
            let pattern = format!("^{}$", regex::escape(trimmed).replace(r"\*", ".*"));
            Matcher::Wildcard(Regex::new(&pattern).map_err(|_| invalid())?)
        } else if trimmed.contains('/') {
            let net: IpNet = trimmed.parse().map_err(|_| invalid())?;
            Matcher::Network(net.trunc())
        } else {
            Matcher::Exact(parse_ip(trimmed).ok_or_else(invalid)?)
        };

        Ok(Self {
            raw: trimmed.to_string(),
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `ip` is the resolved identity string; wildcards match on its text.
    pub fn matches(&self, ip: &str, parsed: Option<IpAddr>) -> bool {
        match &self.matcher {
            Matcher::Exact(addr) => parsed == Some(*addr),
            Matcher::Network(net) => parsed.is_some_and(|addr| net.contains(&addr)),
            Matcher::Wildcard(re) => parsed.is_some() && re.is_match(ip),
        }
    }
}

/// Parse every pattern, skipping invalid ones.
pub fn parse_patterns(raw: &[String]) -> Vec<IpPattern> {
    raw.iter()
        .filter_map(|p| match IpPattern::parse(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring IP list entry");
                None
            }
        })
        .collect()
}

pub fn matches_any(patterns: &[IpPattern], ip: &str) -> bool {
    let parsed = parse_ip(ip);
    patterns.iter().any(|p| p.matches(ip, parsed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Allow,
    Deny,
}

impl std::str::FromStr for ListKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(ListKind::Allow),
            "deny" => Ok(ListKind::Deny),
            other => Err(format!("unknown list '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IpListsListing {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Admin-managed allow and deny lists.
pub struct IpLists {
    allow: ArcSwap<Vec<IpPattern>>,
    deny: ArcSwap<Vec<IpPattern>>,
}

impl IpLists {
    pub fn new(allow: &[String], deny: &[String]) -> Self {
        Self {
            allow: ArcSwap::from_pointee(parse_patterns(allow)),
            deny: ArcSwap::from_pointee(parse_patterns(deny)),
        }
    }

    fn list(&self, kind: ListKind) -> &ArcSwap<Vec<IpPattern>> {
        match kind {
            ListKind::Allow => &self.allow,
            ListKind::Deny => &self.deny,
        }
    }

    pub fn is_allowed(&self, ip: &str) -> bool {
        matches_any(&self.allow.load(), ip)
    }

    pub fn is_denied(&self, ip: &str) -> bool {
        matches_any(&self.deny.load(), ip)
    }

    /// Add a pattern. Returns `false` if it was already present.
    pub fn add(&self, kind: ListKind, raw: &str) -> Result<bool, IpListError> {
        let pattern = IpPattern::parse(raw)?;
        let mut added = false;
        self.list(kind).rcu(|current| {
            let mut next = Vec::clone(current);
            added = !next.iter().any(|p| p.raw == pattern.raw);
            if added {
                next.push(pattern.clone());
            }
            Arc::new(next)
        });
        Ok(added)
    }

    /// Remove a pattern by its spelling. Returns `false` if absent.
    pub fn remove(&self, kind: ListKind, raw: &str) -> bool {
        let raw = raw.trim();
        let mut removed = false;
        self.list(kind).rcu(|current| {
            let mut next = Vec::clone(current);
            let before = next.len();
            next.retain(|p| p.raw != raw);
            removed = next.len() != before;
            Arc::new(next)
        });
        removed
    }

    pub fn listing(&self) -> IpListsListing {
        let names = |list: &ArcSwap<Vec<IpPattern>>| -> Vec<String> {
            list.load().iter().map(|p| p.raw.clone()).collect()
        };
        IpListsListing {
            allow: names(&self.allow),
            deny: names(&self.deny),
        }
    }
}

impl Default for IpLists {
    fn default() -> Self {
        Self::new(&[], &[])
    }
}
