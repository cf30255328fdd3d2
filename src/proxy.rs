//! Proxy configuration, environment discovery, and bypass matching.

use std::net::Ipv4Addr;
use std::time::Duration;

use http::HeaderMap;
use url::Url;

use crate::error::{Error, Result};

/// Structured proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy URL (`http` or `https` scheme).
    pub url: Url,
    /// Basic credentials sent to the proxy.
    pub auth: Option<(String, String)>,
    /// Hosts that bypass the proxy. Patterns: `*`, exact hostname,
    /// domain suffix (`.foo.com`), `host:port`, IPv4 CIDR.
    pub bypass: Vec<String>,
    /// Extra headers sent to the proxy.
    pub headers: HeaderMap,
    /// Use CONNECT tunneling for plain-HTTP origins too.
    pub tunnel: bool,
    /// Negotiate HTTP/2 to the proxy itself.
    pub http2: bool,
    /// Connect timeout for the proxy hop.
    pub connect_timeout: Option<Duration>,
}

impl ProxyConfig {
    /// Parse a proxy URL. SOCKS schemes are unsupported and rejected
    /// here, at configuration time.
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.scheme().starts_with("socks") {
            return Err(Error::Unsupported(format!(
                "SOCKS proxies are not supported ({url})"
            )));
        }
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "unrecognized proxy scheme {}",
                url.scheme()
            )));
        }
        Ok(Self {
            url,
            auth: None,
            bypass: Vec::new(),
            headers: HeaderMap::new(),
            tunnel: true,
            http2: false,
            connect_timeout: None,
        })
    }

    /// Attach basic credentials.
    #[must_use]
    pub fn with_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    /// Replace the bypass list.
    #[must_use]
    pub fn with_bypass(mut self, bypass: Vec<String>) -> Self {
        self.bypass = bypass;
        self
    }
}

/// Resolves the effective proxy for each outgoing URL.
///
/// Scheme-specific configuration wins over the catch-all; the bypass list
/// is consulted for hostname, `host:port`, suffix, and IPv4 CIDR matches.
#[derive(Debug, Clone, Default)]
pub struct ProxySelector {
    http: Option<ProxyConfig>,
    https: Option<ProxyConfig>,
    all: Option<ProxyConfig>,
    no_proxy: Vec<String>,
}

impl ProxySelector {
    /// A selector that never proxies.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Route everything through one explicit proxy.
    #[must_use]
    pub fn explicit(config: ProxyConfig) -> Self {
        Self {
            http: None,
            https: None,
            no_proxy: config.bypass.clone(),
            all: Some(config),
        }
    }

    /// Discover proxies from `HTTP_PROXY`, `HTTPS_PROXY`, `ALL_PROXY`,
    /// and `NO_PROXY`, case-insensitively.
    pub fn from_env() -> Result<Self> {
        let read = |name: &str| {
            std::env::var(name)
                .or_else(|_| std::env::var(name.to_ascii_lowercase()))
                .ok()
                .filter(|v| !v.trim().is_empty())
        };
        Self::from_vars(
            read("HTTP_PROXY").as_deref(),
            read("HTTPS_PROXY").as_deref(),
            read("ALL_PROXY").as_deref(),
            read("NO_PROXY").as_deref(),
        )
    }

    /// Build a selector from explicit variable values (testable form of
    /// [`from_env`](Self::from_env)).
    pub fn from_vars(
        http_proxy: Option<&str>,
        https_proxy: Option<&str>,
        all_proxy: Option<&str>,
        no_proxy: Option<&str>,
    ) -> Result<Self> {
        let parse = |value: Option<&str>| -> Result<Option<ProxyConfig>> {
            value.map(ProxyConfig::new).transpose()
        };
        Ok(Self {
            http: parse(http_proxy)?,
            https: parse(https_proxy)?,
            all: parse(all_proxy)?,
            no_proxy: no_proxy
                .map(|raw| {
                    raw.split(',')
                        .map(|p| p.trim().to_string())
                        .filter(|p| !p.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Whether any proxy is configured at all.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.http.is_some() || self.https.is_some() || self.all.is_some()
    }

    /// The effective proxy for `url`, after bypass evaluation.
    #[must_use]
    pub fn for_url(&self, url: &Url) -> Option<&ProxyConfig> {
        let candidate = match url.scheme() {
            "http" => self.http.as_ref().or(self.all.as_ref()),
            "https" => self.https.as_ref().or(self.all.as_ref()),
            _ => self.all.as_ref(),
        }?;
        let host = url.host_str()?;
        let port = url.port_or_known_default();
        let bypassed = self
            .no_proxy
            .iter()
            .chain(candidate.bypass.iter())
            .any(|pattern| bypass_matches(pattern, host, port));
        if bypassed {
            None
        } else {
            Some(candidate)
        }
    }
}

/// Whether a single bypass pattern covers `host` (and `port`).
#[must_use]
pub fn bypass_matches(pattern: &str, host: &str, port: Option<u16>) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }
    let host = host.to_ascii_lowercase();

    // host:port
    if let Some((pattern_host, pattern_port)) = pattern.rsplit_once(':') {
        if let Ok(pattern_port) = pattern_port.parse::<u16>() {
            return Some(pattern_port) == port
                && host_pattern_matches(pattern_host, &host);
        }
    }
    // IPv4 CIDR
    if let Some((network, prefix)) = pattern.split_once('/') {
        if let (Ok(network), Ok(prefix)) =
            (network.parse::<Ipv4Addr>(), prefix.parse::<u32>())
        {
            if let Ok(addr) = host.parse::<Ipv4Addr>() {
                return cidr_contains(network, prefix, addr);
            }
            return false;
        }
    }
    host_pattern_matches(pattern, &host)
}

fn host_pattern_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix('.') {
        return host == suffix || host.ends_with(&pattern);
    }
    host == pattern
}

fn cidr_contains(network: Ipv4Addr, prefix: u32, addr: Ipv4Addr) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 32 {
        return false;
    }
    let mask = u32::MAX << (32 - prefix);
    (u32::from(network) & mask) == (u32::from(addr) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn socks_fails_at_configuration_time() {
        let err = ProxyConfig::new("socks5://localhost:1080").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn scheme_specific_wins_over_all_proxy() {
        let selector = ProxySelector::from_vars(
            Some("http://plain:8080"),
            Some("http://secure:8080"),
            Some("http://fallback:8080"),
            None,
        )
        .unwrap();
        assert_eq!(
            selector.for_url(&url("http://a.com/")).unwrap().url.as_str(),
            "http://plain:8080/"
        );
        assert_eq!(
            selector.for_url(&url("https://a.com/")).unwrap().url.as_str(),
            "http://secure:8080/"
        );
        let ws_only = ProxySelector::from_vars(
            None,
            None,
            Some("http://fallback:8080"),
            None,
        )
        .unwrap();
        assert!(ws_only.for_url(&url("https://a.com/")).is_some());
    }

    #[test]
    fn bypass_list_from_no_proxy() {
        let selector = ProxySelector::from_vars(
            Some("http://proxy:8080"),
            None,
            None,
            Some("localhost,.internal.com,192.168.0.0/16"),
        )
        .unwrap();
        assert!(selector.for_url(&url("http://localhost/x")).is_none());
        assert!(selector.for_url(&url("http://api.internal.com/x")).is_none());
        assert!(selector.for_url(&url("http://192.168.5.5/x")).is_none());
        assert_eq!(
            selector.for_url(&url("http://public.com/x")).unwrap().url.as_str(),
            "http://proxy:8080/"
        );
    }

    #[test]
    fn bypass_pattern_shapes() {
        assert!(bypass_matches("*", "anything.com", Some(80)));
        assert!(bypass_matches("exact.com", "exact.com", Some(80)));
        assert!(!bypass_matches("exact.com", "sub.exact.com", Some(80)));
        assert!(bypass_matches(".foo.com", "bar.foo.com", Some(443)));
        assert!(bypass_matches(".foo.com", "foo.com", Some(443)));
        assert!(bypass_matches("host.com:8443", "host.com", Some(8443)));
        assert!(!bypass_matches("host.com:8443", "host.com", Some(443)));
        assert!(bypass_matches("10.0.0.0/8", "10.1.2.3", None));
        assert!(!bypass_matches("10.0.0.0/8", "11.1.2.3", None));
        assert!(!bypass_matches("10.0.0.0/8", "not-an-ip.com", None));
    }

    #[test]
    fn explicit_selector_uses_config_bypass() {
        let config = ProxyConfig::new("http://proxy:8080")
            .unwrap()
            .with_bypass(vec!["skip.me".into()]);
        let selector = ProxySelector::explicit(config);
        assert!(selector.for_url(&url("http://skip.me/")).is_none());
        assert!(selector.for_url(&url("http://use.me/")).is_some());
    }
}
