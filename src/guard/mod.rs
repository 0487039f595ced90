//! URL canonicalization and SSRF guard
//!
//! Every URL entering the engine passes through here exactly once per
//! hop: `canonicalize` produces the normal form used for cache keys and
//! crawl dedup, and `UrlGuard::validate` rejects anything that resolves
//! to a private, loopback, link-local, or cloud-metadata address, or
//! targets a blocked port. Redirect-following callers re-validate every
//! hop.

use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use url::Url;

use crate::config::SsrfConfig;
use crate::error::{GuardReason, HarvestError, HarvestResult};

/// Ports that are never fetchable regardless of configuration.
const BLOCKED_PORTS: &[u16] = &[22, 23, 25, 53, 135, 139, 445, 1433, 3306, 5432, 6379, 27017];

/// Hostnames that are cloud metadata endpoints by name.
const METADATA_HOSTS: &[&str] = &["metadata.google.internal", "metadata.goog"];

/// IPv4 literals that are cloud metadata endpoints.
const METADATA_V4: &[Ipv4Addr] = &[
    Ipv4Addr::new(169, 254, 169, 254),
    Ipv4Addr::new(100, 100, 100, 200),
];

/// A URL in canonical form.
///
/// Invariants: scheme is http or https, host is lowercase (punycoded by
/// the parser), the path has `..` resolved, query keys are sorted, the
/// fragment is dropped, and credentials are stripped. Canonicalization
/// is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalUrl(Url);

impl CanonicalUrl {
    /// Parse and normalize a raw URL string.
    pub fn parse(raw: &str) -> HarvestResult<Self> {
        let mut url = Url::parse(raw.trim())
            .map_err(|e| HarvestError::InvalidArgument(format!("url parse: {e}")))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(HarvestError::BlockedByGuard {
                    reason: GuardReason::Scheme,
                    detail: format!("scheme '{other}' is not http(s)"),
                });
            }
        }
        if url.host_str().is_none() {
            return Err(HarvestError::InvalidArgument("url has no host".into()));
        }

        // Credentials never survive canonicalization.
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_fragment(None);

        // Stable query ordering so `a=1&b=2` and `b=2&a=1` share a
        // fingerprint. BTreeSet also drops exact duplicate pairs.
        if url.query().is_some() {
            let pairs: BTreeSet<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if pairs.is_empty() {
                url.set_query(None);
            } else {
                let joined = pairs
                    .iter()
                    .map(|(k, v)| {
                        if v.is_empty() {
                            urlencoding::encode(k).into_owned()
                        } else {
                            format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("&");
                url.set_query(Some(&joined));
            }
        }

        Ok(Self(url))
    }

    #[must_use]
    pub fn as_url(&self) -> &Url {
        &self.0
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Lowercased host, ASCII/punycoded.
    #[must_use]
    pub fn host(&self) -> &str {
        self.0.host_str().unwrap_or_default()
    }

    /// Explicit port or the scheme default.
    #[must_use]
    pub fn port_or_default(&self) -> u16 {
        self.0.port_or_known_default().unwrap_or(443)
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.0.path()
    }

    /// Resolve a possibly-relative link against this URL and
    /// canonicalize the result.
    pub fn join(&self, link: &str) -> HarvestResult<Self> {
        let joined = self
            .0
            .join(link.trim())
            .map_err(|e| HarvestError::InvalidArgument(format!("join '{link}': {e}")))?;
        Self::parse(joined.as_str())
    }

    /// Approximate registrable domain: the last two labels of the host.
    ///
    /// `docs.example.com` and `example.com` compare equal; IP literals
    /// compare by the full address.
    #[must_use]
    pub fn registrable_domain(&self) -> String {
        let host = self.host();
        if host.parse::<IpAddr>().is_ok() {
            return host.to_string();
        }
        let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
        if labels.len() <= 2 {
            host.to_string()
        } else {
            labels[labels.len() - 2..].join(".")
        }
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for CanonicalUrl {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// DNS resolution seam. Production uses tokio's resolver; tests inject
/// fixed answers so no guard test touches the network.
pub trait Resolver: Send + Sync {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, std::io::Result<Vec<IpAddr>>>;
}

/// System resolver backed by `tokio::net::lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, std::io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            // Port is irrelevant for address resolution.
            let addrs = tokio::net::lookup_host((host, 80)).await?;
            Ok(addrs.map(|sa| sa.ip()).collect())
        })
    }
}

/// Fixed-answer resolver for tests and offline runs.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    entries: std::collections::HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.entries.insert(host.to_ascii_lowercase(), addrs);
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve<'a>(&'a self, host: &'a str) -> BoxFuture<'a, std::io::Result<Vec<IpAddr>>> {
        let answer = self.entries.get(&host.to_ascii_lowercase()).cloned();
        Box::pin(async move {
            answer.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no static entry")
            })
        })
    }
}

/// The SSRF guard. Shared by the fetcher, crawler, and webhook
/// dispatcher.
pub struct UrlGuard {
    config: SsrfConfig,
    resolver: Arc<dyn Resolver>,
}

impl UrlGuard {
    #[must_use]
    pub fn new(config: SsrfConfig, resolver: Arc<dyn Resolver>) -> Self {
        Self { config, resolver }
    }

    /// Canonicalize then validate in one step.
    pub async fn admit(&self, raw: &str) -> HarvestResult<CanonicalUrl> {
        let url = CanonicalUrl::parse(raw)?;
        self.validate(&url).await?;
        Ok(url)
    }

    /// Validate an already-canonical URL against the SSRF policy.
    ///
    /// Rejects when ANY resolved address falls in a blocked range; an
    /// attacker controlling one A record out of many must not get
    /// through.
    pub async fn validate(&self, url: &CanonicalUrl) -> HarvestResult<()> {
        let host = url.host();
        let port = url.port_or_default();

        if BLOCKED_PORTS.contains(&port) {
            return Err(HarvestError::BlockedByGuard {
                reason: GuardReason::BlockedPort,
                detail: format!("port {port}"),
            });
        }

        if METADATA_HOSTS.contains(&host) {
            return Err(HarvestError::BlockedByGuard {
                reason: GuardReason::MetadataHost,
                detail: host.to_string(),
            });
        }

        for blocked in &self.config.extra_blocked_hosts {
            let blocked = blocked.to_ascii_lowercase();
            if host == blocked || host.ends_with(&format!(".{blocked}")) {
                return Err(HarvestError::BlockedByGuard {
                    reason: GuardReason::BlockedHost,
                    detail: host.to_string(),
                });
            }
        }

        let addrs = if let Ok(literal) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            vec![literal]
        } else {
            self.resolver.resolve(host).await.map_err(|e| {
                HarvestError::BlockedByGuard {
                    reason: GuardReason::ResolutionFailed,
                    detail: format!("{host}: {e}"),
                }
            })?
        };

        if addrs.is_empty() {
            return Err(HarvestError::BlockedByGuard {
                reason: GuardReason::ResolutionFailed,
                detail: format!("{host}: empty answer"),
            });
        }

        for addr in addrs {
            if let Some(reason) = classify_blocked(addr, self.config.block_private) {
                return Err(HarvestError::BlockedByGuard {
                    reason,
                    detail: format!("{host} -> {addr}"),
                });
            }
        }

        Ok(())
    }
}

/// Classify an address against the blocked ranges. Returns `None` when
/// the address is publicly routable.
fn classify_blocked(addr: IpAddr, block_private: bool) -> Option<GuardReason> {
    match addr {
        IpAddr::V4(v4) => classify_v4(v4, block_private),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return classify_v4(mapped, block_private);
            }
            classify_v6(v6, block_private)
        }
    }
}

fn classify_v4(v4: Ipv4Addr, block_private: bool) -> Option<GuardReason> {
    if METADATA_V4.contains(&v4) {
        return Some(GuardReason::MetadataHost);
    }
    if !block_private {
        return None;
    }
    let octets = v4.octets();
    if v4.is_loopback() || v4.is_unspecified() || v4.is_broadcast() {
        return Some(GuardReason::PrivateAddress);
    }
    if v4.is_private() || v4.is_link_local() {
        return Some(GuardReason::PrivateAddress);
    }
    // 100.64.0.0/10 carrier-grade NAT; includes some vendor metadata
    // endpoints.
    if octets[0] == 100 && (octets[1] & 0xc0) == 64 {
        return Some(GuardReason::PrivateAddress);
    }
    None
}

fn classify_v6(v6: Ipv6Addr, block_private: bool) -> Option<GuardReason> {
    if !block_private {
        return None;
    }
    if v6.is_loopback() || v6.is_unspecified() {
        return Some(GuardReason::PrivateAddress);
    }
    let segments = v6.segments();
    // fe80::/10 link-local
    if (segments[0] & 0xffc0) == 0xfe80 {
        return Some(GuardReason::PrivateAddress);
    }
    // fc00::/7 unique local
    if (segments[0] & 0xfe00) == 0xfc00 {
        return Some(GuardReason::PrivateAddress);
    }
    None
}
