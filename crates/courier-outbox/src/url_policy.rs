//! Outbound URL policy.
//!
//! Stored webhook targets are long-lived, so the policy is applied right
//! before every send and every replay, not only when the target is saved.
//! Before a send the host name is also resolved and every address it maps
//! to must pass the same private-range checks as a literal IP.

use async_trait::async_trait;
use courier_core::UrlPolicyConfig;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use url::{Host, Url};

/// Hosts that are never valid webhook targets regardless of how they resolve.
const BLOCKED_HOSTS: &[&str] = &[
    "169.254.169.254",          // AWS/GCP/Azure metadata
    "metadata.google.internal", // GCP metadata
    "metadata.azure.internal",
    "100.100.100.200", // Alibaba metadata
    "localhost",
    "0.0.0.0",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlRejection {
    #[error("invalid URL: {0}")]
    Invalid(String),

    #[error("scheme '{0}' is not allowed")]
    Scheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("host {0} is a private or internal address")]
    PrivateHost(String),

    #[error("host {0} is not in the allow-list")]
    NotAllowed(String),

    #[error("host {0} is denied")]
    Denied(String),

    #[error("host {host} resolves to private address {addr}")]
    PrivateAddress { host: String, addr: IpAddr },

    #[error("could not resolve host {host}: {reason}")]
    Unresolved { host: String, reason: String },
}

impl UrlRejection {
    /// Value stored in `last_error_code` when a send is skipped or fails for this reason.
    pub fn code(&self) -> &'static str {
        match self {
            UrlRejection::Invalid(_) | UrlRejection::MissingHost => "url_invalid",
            UrlRejection::Unresolved { .. } => "dns_error",
            _ => "url_blocked",
        }
    }

    /// Lookup failures may clear up on their own and count as a failed attempt.
    /// Everything else is a policy decision.
    pub fn is_transient(&self) -> bool {
        matches!(self, UrlRejection::Unresolved { .. })
    }
}

/// URL-validation capability consulted before every webhook send.
#[async_trait]
pub trait UrlValidator: Send + Sync {
    /// Static checks on the URL text, no network access.
    fn validate(&self, raw: &str) -> Result<Url, UrlRejection>;

    /// [`validate`](Self::validate) plus checks on what the host resolves to.
    async fn validate_resolved(&self, raw: &str) -> Result<Url, UrlRejection> {
        self.validate(raw)
    }
}

/// Name resolution used by [`UrlPolicy`] before a send.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// The operating system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Scheme and host rules built from [`UrlPolicyConfig`].
#[derive(Clone)]
pub struct UrlPolicy {
    allow_http: bool,
    allowed_hosts: Vec<String>,
    denied_hosts: Vec<String>,
    resolver: Arc<dyn HostResolver>,
}

impl fmt::Debug for UrlPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlPolicy")
            .field("allow_http", &self.allow_http)
            .field("allowed_hosts", &self.allowed_hosts)
            .field("denied_hosts", &self.denied_hosts)
            .finish_non_exhaustive()
    }
}

impl UrlPolicy {
    pub fn new(config: &UrlPolicyConfig) -> Self {
        let normalize = |hosts: &[String]| {
            hosts
                .iter()
                .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect()
        };
        Self {
            allow_http: config.allow_http,
            allowed_hosts: normalize(&config.allowed_hosts),
            denied_hosts: normalize(&config.denied_hosts),
            resolver: Arc::new(SystemResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    fn matches(list: &[String], host: &str) -> bool {
        list.iter()
            .any(|entry| host == entry || host.ends_with(&format!(".{entry}")))
    }
}

#[async_trait]
impl UrlValidator for UrlPolicy {
    fn validate(&self, raw: &str) -> Result<Url, UrlRejection> {
        let parsed = Url::parse(raw).map_err(|e| UrlRejection::Invalid(e.to_string()))?;

        match parsed.scheme() {
            "https" => {}
            "http" if self.allow_http => {
                warn!(url = %raw, "webhook target uses plain HTTP");
            }
            other => return Err(UrlRejection::Scheme(other.to_string())),
        }

        let host = parsed
            .host_str()
            .ok_or(UrlRejection::MissingHost)?
            .trim_end_matches('.')
            .to_ascii_lowercase();

        if is_private_host(&host) {
            return Err(UrlRejection::PrivateHost(host));
        }
        if Self::matches(&self.denied_hosts, &host) {
            return Err(UrlRejection::Denied(host));
        }
        if !self.allowed_hosts.is_empty() && !Self::matches(&self.allowed_hosts, &host) {
            return Err(UrlRejection::NotAllowed(host));
        }

        Ok(parsed)
    }

    async fn validate_resolved(&self, raw: &str) -> Result<Url, UrlRejection> {
        let url = self.validate(raw)?;
        // literal addresses were checked by validate
        let Some(Host::Domain(domain)) = url.host() else {
            return Ok(url);
        };
        let host = domain.trim_end_matches('.').to_ascii_lowercase();
        let port = url.port_or_known_default().unwrap_or(443);

        let addrs = self
            .resolver
            .resolve(&host, port)
            .await
            .map_err(|e| UrlRejection::Unresolved {
                host: host.clone(),
                reason: e.to_string(),
            })?;
        if addrs.is_empty() {
            return Err(UrlRejection::Unresolved {
                host,
                reason: "no addresses".into(),
            });
        }
        if let Some(addr) = addrs.iter().copied().find(|addr| is_private_ip(*addr)) {
            return Err(UrlRejection::PrivateAddress { host, addr });
        }
        debug!(host = %host, addrs = addrs.len(), "webhook host resolved");
        Ok(url)
    }
}

/// Host string as stored in `target_url_host`.
pub fn host_of(url: &Url) -> String {
    url.host_str()
        .unwrap_or_default()
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn is_private_host(host: &str) -> bool {
    // url keeps the brackets around IPv6 literals
    let normalized = host
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(host);

    if BLOCKED_HOSTS.contains(&normalized)
        || normalized.ends_with(".localhost")
        || normalized.ends_with(".internal")
    {
        return true;
    }

    normalized.parse::<IpAddr>().is_ok_and(is_private_ip)
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (64..=127).contains(&b))
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}
