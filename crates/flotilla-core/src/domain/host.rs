//! Hosts and host filters.
//!
//! The engine itself only reads `ip` and `envs`; the remaining metadata is
//! there for host selection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Host env keys are injected with this prefix.
pub const HOST_ENV_PREFIX: &str = "ARGS_";

/// Machine classes recognized by host selection.
pub const RECOGNIZED_CLASSES: [&str; 2] = ["physical", "virtual"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub ip: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_class")]
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

fn default_class() -> String {
    "virtual".to_string()
}

impl Host {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            envs: BTreeMap::new(),
            enabled: true,
            class: default_class(),
            zone: None,
            tags: BTreeMap::new(),
        }
    }

    /// Add an env var, applying the host prefix when missing.
    pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        let key = if key.starts_with(HOST_ENV_PREFIX) {
            key.to_string()
        } else {
            format!("{HOST_ENV_PREFIX}{}", key.to_uppercase())
        };
        self.envs.insert(key, value.into());
        self
    }
}

/// One named predicate of a host filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPredicate {
    /// Network zone equals.
    Zone(String),
    /// Tag `key` equals `value`.
    Tag { key: String, value: String },
    /// IP matches a pattern where `*` matches any run of characters.
    IpPattern(String),
    /// IP is one of the listed addresses.
    IpIn(Vec<String>),
}

impl HostPredicate {
    pub fn matches(&self, host: &Host) -> bool {
        match self {
            HostPredicate::Zone(zone) => host.zone.as_deref() == Some(zone.as_str()),
            HostPredicate::Tag { key, value } => host.tags.get(key) == Some(value),
            HostPredicate::IpPattern(pattern) => wildcard_match(pattern, &host.ip),
            HostPredicate::IpIn(ips) => ips.iter().any(|ip| ip == &host.ip),
        }
    }
}

/// Ordered list of predicates combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostFilter(pub Vec<HostPredicate>);

impl HostFilter {
    pub fn ips(ips: Vec<String>) -> Self {
        Self(vec![HostPredicate::IpIn(ips)])
    }

    /// Applies the explicit predicates plus the two defaults: the host is
    /// enabled and its class is recognized.
    pub fn matches(&self, host: &Host) -> bool {
        host.enabled
            && RECOGNIZED_CLASSES.contains(&host.class.as_str())
            && self.0.iter().all(|p| p.matches(host))
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
