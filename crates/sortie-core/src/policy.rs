//! Scope policy
//!
//! The core never decides authorization itself; it asks a [`ScopePolicy`]
//! before dispatching anything. [`AuthorizedScope`] is the policy a session
//! builds from its scope specifiers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::action::ActionRequest;
use crate::error::{OrchestratorError, Result};
use crate::registry::ModuleDescriptor;

/// Policy collaborator consulted before dispatch
pub trait ScopePolicy: Send + Sync + fmt::Debug {
    fn is_in_scope(&self, target: &str) -> bool;
}

/// An IP network in CIDR notation (v4 or v6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Network {
    base: IpAddr,
    prefix: u8,
}

impl Network {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let max = max_prefix(addr);
        if prefix > max {
            return Err(OrchestratorError::Validation(format!(
                "prefix /{} is too long for {}",
                prefix, addr
            )));
        }
        let bits = to_bits(addr) & mask(prefix, max);
        Ok(Self {
            base: from_bits(addr, bits),
            prefix,
        })
    }

    pub fn single(addr: IpAddr) -> Self {
        Self {
            base: addr,
            prefix: max_prefix(addr),
        }
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        if self.base.is_ipv4() != addr.is_ipv4() {
            return false;
        }
        let max = max_prefix(addr);
        to_bits(addr) & mask(self.prefix, max) == to_bits(self.base)
    }

    /// Whether `other` lies wholly inside this network
    pub fn contains_network(&self, other: &Network) -> bool {
        other.prefix >= self.prefix && self.contains(other.base)
    }
}

impl FromStr for Network {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || OrchestratorError::Validation(format!("invalid network '{}'", s));
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
                Network::new(addr, prefix)
            }
            None => s.parse::<IpAddr>().map(Network::single).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

fn max_prefix(addr: IpAddr) -> u8 {
    if addr.is_ipv4() {
        32
    } else {
        128
    }
}

fn to_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_bits(like: IpAddr, bits: u128) -> IpAddr {
    match like {
        IpAddr::V4(_) => IpAddr::V4((bits as u32).into()),
        IpAddr::V6(_) => IpAddr::V6(bits.into()),
    }
}

fn mask(prefix: u8, width: u8) -> u128 {
    if prefix == 0 {
        return 0;
    }
    let full: u128 = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
    full & !((1u128 << (width - prefix)) - 1)
}

/// A target specifier as it appears in a request parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Network(Network),
    Host(String),
}

impl TargetSpec {
    /// Parse a target, URL or `host:port` into the part the policy judges
    pub fn parse(raw: &str) -> Option<TargetSpec> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if raw.contains("://") {
            let url = url::Url::parse(raw).ok()?;
            return match url.host()? {
                url::Host::Ipv4(v4) => Some(TargetSpec::Network(Network::single(IpAddr::V4(v4)))),
                url::Host::Ipv6(v6) => Some(TargetSpec::Network(Network::single(IpAddr::V6(v6)))),
                url::Host::Domain(d) => Some(TargetSpec::Host(d.to_ascii_lowercase())),
            };
        }

        if let Ok(network) = raw.parse::<Network>() {
            return Some(TargetSpec::Network(network));
        }

        // host:port, but not a bare IPv6 address
        let host = match raw.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
            _ => raw,
        };
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Some(TargetSpec::Network(Network::single(addr)));
        }
        if host.contains('/') || host.chars().any(char::is_whitespace) {
            return None;
        }
        Some(TargetSpec::Host(host.trim_end_matches('.').to_ascii_lowercase()))
    }
}

/// The set of targets a session is authorized to touch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct AuthorizedScope {
    networks: BTreeSet<Network>,
    hosts: BTreeSet<String>,

    /// `*.example.com` entries, stored as `example.com`
    domains: BTreeSet<String>,
}

impl AuthorizedScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scope from specifiers: IPs, CIDR networks, host names and
    /// `*.domain` wildcards
    pub fn from_specifiers<I, S>(specifiers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scope = Self::new();
        for spec in specifiers {
            scope.allow(spec.as_ref())?;
        }
        Ok(scope)
    }

    pub fn allow(&mut self, specifier: &str) -> Result<&mut Self> {
        let specifier = specifier.trim();
        if let Some(domain) = specifier.strip_prefix("*.") {
            if domain.is_empty() {
                return Err(OrchestratorError::Validation("empty wildcard domain".into()));
            }
            self.domains.insert(domain.to_ascii_lowercase());
            return Ok(self);
        }
        match TargetSpec::parse(specifier) {
            Some(TargetSpec::Network(network)) => {
                self.networks.insert(network);
            }
            Some(TargetSpec::Host(host)) => {
                self.hosts.insert(host);
            }
            None => {
                return Err(OrchestratorError::Validation(format!(
                    "invalid scope specifier '{}'",
                    specifier
                )))
            }
        }
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty() && self.hosts.is_empty() && self.domains.is_empty()
    }

    pub fn specifiers(&self) -> Vec<String> {
        let networks = self.networks.iter().map(|n| {
            if n.prefix == max_prefix(n.base) {
                n.base.to_string()
            } else {
                n.to_string()
            }
        });
        let hosts = self.hosts.iter().cloned();
        let domains = self.domains.iter().map(|d| format!("*.{}", d));
        networks.chain(hosts).chain(domains).collect()
    }
}

impl ScopePolicy for AuthorizedScope {
    fn is_in_scope(&self, target: &str) -> bool {
        match TargetSpec::parse(target) {
            Some(TargetSpec::Network(requested)) => {
                self.networks.iter().any(|n| n.contains_network(&requested))
            }
            Some(TargetSpec::Host(host)) => {
                self.hosts.contains(&host)
                    || self
                        .domains
                        .iter()
                        .any(|d| host.len() > d.len() && host.ends_with(d.as_str()) && host[..host.len() - d.len()].ends_with('.'))
            }
            None => false,
        }
    }
}

impl TryFrom<Vec<String>> for AuthorizedScope {
    type Error = OrchestratorError;

    fn try_from(specifiers: Vec<String>) -> Result<Self> {
        Self::from_specifiers(specifiers)
    }
}

impl From<AuthorizedScope> for Vec<String> {
    fn from(scope: AuthorizedScope) -> Self {
        scope.specifiers()
    }
}

/// Reject a request whose target-typed parameters leave the scope.
///
/// Only parameters declared as `target` or `url` are inspected; array values
/// are checked element by element.
pub fn check_request(policy: &dyn ScopePolicy, descriptor: &ModuleDescriptor, request: &ActionRequest) -> Result<()> {
    for (name, spec) in &descriptor.parameters {
        if !spec.kind.is_target() {
            continue;
        }
        let Some(value) = request.parameters.get(name) else {
            continue;
        };
        let targets: Vec<&str> = match value {
            serde_json::Value::String(s) => vec![s.as_str()],
            serde_json::Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
            _ => Vec::new(),
        };
        for target in targets {
            if !policy.is_in_scope(target) {
                tracing::warn!(
                    request_id = %request.id,
                    action = %request.action,
                    target,
                    "target outside authorized scope"
                );
                return Err(OrchestratorError::ScopeViolation {
                    action: request.action.clone(),
                    target: target.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ParameterKind, ParameterSpec};
    use crate::types::ParameterMap;

    fn scope() -> AuthorizedScope {
        AuthorizedScope::from_specifiers(["10.0.0.0/24", "192.168.1.10", "app.internal", "*.corp.example"]).unwrap()
    }

    #[test]
    fn ip_and_network_containment() {
        let scope = scope();
        assert!(scope.is_in_scope("10.0.0.5"));
        assert!(scope.is_in_scope("10.0.0.0/24"));
        assert!(scope.is_in_scope("10.0.0.128/25"));
        assert!(!scope.is_in_scope("10.0.0.0/16"));
        assert!(!scope.is_in_scope("10.0.1.5"));
        assert!(scope.is_in_scope("192.168.1.10:22"));
        assert!(!scope.is_in_scope("192.168.1.11"));
    }

    #[test]
    fn hosts_urls_and_wildcards() {
        let scope = scope();
        assert!(scope.is_in_scope("APP.internal"));
        assert!(scope.is_in_scope("http://10.0.0.5:8080/login"));
        assert!(scope.is_in_scope("https://vpn.corp.example/"));
        assert!(!scope.is_in_scope("corp.example"));
        assert!(!scope.is_in_scope("evilcorp.example"));
        assert!(!scope.is_in_scope("https://example.org"));
        assert!(!scope.is_in_scope(""));
    }

    #[test]
    fn network_masks_base_address() {
        let net: Network = "10.0.0.77/24".parse().unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/24");
        assert!("10.0.0.0/33".parse::<Network>().is_err());
        let any: Network = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains("8.8.8.8".parse().unwrap()));
        let v6: Network = "fd00::/8".parse().unwrap();
        assert!(v6.contains("fd12::1".parse().unwrap()));
        assert!(!v6.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn scope_round_trips_through_specifiers() {
        let json = serde_json::to_string(&scope()).unwrap();
        let back: AuthorizedScope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scope());
        assert!(serde_json::from_str::<AuthorizedScope>(r#"["not a host/"]"#).is_err());
    }

    #[test]
    fn check_request_inspects_target_parameters_only() {
        let descriptor = ModuleDescriptor::new("web_scan")
            .with_parameter("target", ParameterSpec::required(ParameterKind::Target))
            .with_parameter("path", ParameterSpec::optional(ParameterKind::Text));

        let mut params = ParameterMap::new();
        params.insert("target".into(), serde_json::json!("10.0.0.5"));
        params.insert("path".into(), serde_json::json!("8.8.8.8"));
        let ok = ActionRequest::new("web_scan", params.clone());
        assert!(check_request(&scope(), &descriptor, &ok).is_ok());

        params.insert("target".into(), serde_json::json!("8.8.8.8"));
        let bad = ActionRequest::new("web_scan", params);
        let err = check_request(&scope(), &descriptor, &bad).unwrap_err();
        assert!(matches!(err, OrchestratorError::ScopeViolation { target, .. } if target == "8.8.8.8"));
    }
}
