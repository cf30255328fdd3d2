//! The agent manager: per-domain connection pools over the wrapped HTTP
//! client, sized from the declared concurrency.

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use url::Url;

use crate::error::{Error, Result};
use crate::proxy::{ProxyConfig, ProxySelector};

/// Minimum TLS protocol versions the transport can pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls1_0,
    /// TLS 1.1
    Tls1_1,
    /// TLS 1.2
    Tls1_2,
    /// TLS 1.3
    Tls1_3,
}

impl From<TlsVersion> for reqwest::tls::Version {
    fn from(value: TlsVersion) -> Self {
        match value {
            TlsVersion::Tls1_0 => reqwest::tls::Version::TLS_1_0,
            TlsVersion::Tls1_1 => reqwest::tls::Version::TLS_1_1,
            TlsVersion::Tls1_2 => reqwest::tls::Version::TLS_1_2,
            TlsVersion::Tls1_3 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

/// TLS options applied when building a pool.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Minimum accepted protocol version
    pub min_version: Option<TlsVersion>,
    /// Maximum accepted protocol version
    pub max_version: Option<TlsVersion>,
    /// Extra root certificates, PEM
    pub ca_pem: Option<Vec<u8>>,
    /// Client identity (certificate + key), PEM
    pub identity_pem: Option<Vec<u8>>,
    /// Verify the server certificate (default true)
    pub reject_unauthorized: Option<bool>,
    /// Cipher list; the wrapped client cannot pin ciphers
    pub ciphers: Option<Vec<String>>,
    /// ALPN protocol list; the wrapped client negotiates its own
    pub alpn_protocols: Option<Vec<String>>,
    /// SNI override; the wrapped client derives SNI from the URL
    pub servername: Option<String>,
}

/// DNS options applied when building a pool.
#[derive(Debug, Clone, Default)]
pub struct DnsConfig {
    /// Custom resolver addresses; the wrapped client cannot change them
    pub servers: Vec<String>,
    /// Prefer A records over AAAA
    pub prefer_ipv4: bool,
    /// Static host overrides
    pub overrides: Vec<(String, SocketAddr)>,
}

/// HTTP/2 opt-in and tuning.
#[derive(Debug, Clone, Copy)]
pub struct Http2Config {
    /// Negotiate HTTP/2 via ALPN when possible
    pub enabled: bool,
    /// Advisory cap on concurrent streams per connection
    pub max_concurrent_streams: Option<u32>,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self { enabled: true, max_concurrent_streams: None }
    }
}

/// Proxy override carried on a single request.
#[derive(Debug, Clone)]
pub enum ProxyOverride {
    /// Bypass every configured proxy for this request
    Disabled,
    /// Use this proxy for this request
    Proxy(ProxyConfig),
}

/// Per-request transport overrides. A request carrying hints gets a
/// dedicated, uncached pool built for it.
#[derive(Debug, Clone, Default)]
pub struct TransportHints {
    /// HTTP/2 override
    pub http2: Option<Http2Config>,
    /// TLS override
    pub tls: Option<TlsConfig>,
    /// Proxy override
    pub proxy: Option<ProxyOverride>,
    /// DNS override
    pub dns: Option<DnsConfig>,
    /// Connect-timeout override (maps to the pool's connect dial)
    pub connect_timeout: Option<Duration>,
}

impl TransportHints {
    /// Whether any override is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.http2.is_none()
            && self.tls.is_none()
            && self.proxy.is_none()
            && self.dns.is_none()
            && self.connect_timeout.is_none()
    }
}

/// Connection pool parameters.
#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// Per-pool socket cap; derived from the global concurrency when
    /// unset.
    pub connections: Option<usize>,
    /// HTTP/1.1 pipelining depth. Advisory: kept at 1 unless a batch
    /// pool raises it.
    pub pipelining: usize,
    /// Maintain one pool per origin host.
    pub per_domain_pooling: bool,
    /// Reuse idle connections.
    pub keep_alive: bool,
    /// How long an idle connection is kept.
    pub keep_alive_timeout: Duration,
    /// Upper bound on idle lifetime across reuse cycles.
    pub keep_alive_max_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            connections: None,
            pipelining: 1,
            per_domain_pooling: false,
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(30),
            keep_alive_max_timeout: Duration::from_secs(120),
        }
    }
}

/// Per-pool socket count derived from the declared global concurrency.
#[must_use]
pub fn default_connections(global_max: Option<usize>) -> usize {
    match global_max {
        Some(max) => std::cmp::max(6, max.div_ceil(2)),
        None => 6,
    }
}

/// Owns the global pool and, when per-domain pooling is on, one pool per
/// origin host. The transport asks for a pool per dispatch.
pub struct AgentManager {
    config: AgentConfig,
    global_max: Option<usize>,
    tls: Option<TlsConfig>,
    dns: Option<DnsConfig>,
    http2: Option<Http2Config>,
    connect_timeout: Option<Duration>,
    proxies: ProxySelector,
    pools: DashMap<String, reqwest::Client>,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("per_domain_pooling", &self.config.per_domain_pooling)
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl AgentManager {
    /// Create a manager. The configuration is validated eagerly so
    /// unsupported TLS/DNS options fail at construction, not dispatch.
    pub fn new(
        config: AgentConfig,
        global_max: Option<usize>,
        tls: Option<TlsConfig>,
        dns: Option<DnsConfig>,
        http2: Option<Http2Config>,
        connect_timeout: Option<Duration>,
        proxies: ProxySelector,
    ) -> Result<Self> {
        if let Some(tls) = &tls {
            validate_tls(tls)?;
        }
        if let Some(dns) = &dns {
            validate_dns(dns)?;
        }
        Ok(Self {
            config,
            global_max,
            tls,
            dns,
            http2,
            connect_timeout,
            proxies,
            pools: DashMap::new(),
        })
    }

    /// The pool serving `url`, honoring per-request hints.
    pub fn for_url(
        &self,
        url: &Url,
        hints: Option<&TransportHints>,
    ) -> Result<reqwest::Client> {
        if let Some(hints) = hints.filter(|h| !h.is_empty()) {
            return self.build_hinted(url, hints);
        }
        let proxy = self.proxies.for_url(url);
        let key = if self.config.per_domain_pooling {
            url.host_str().unwrap_or("global").to_ascii_lowercase()
        } else {
            match proxy {
                Some(proxy) => format!("proxy:{}", proxy.url),
                None => "global".to_string(),
            }
        };
        if let Some(pool) = self.pools.get(&key) {
            return Ok(pool.value().clone());
        }
        let pool = self.build_pool(proxy, None, self.connections())?;
        self.pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// The pool for an origin host (https assumed for proxy selection).
    pub fn for_host(&self, host: &str) -> Result<reqwest::Client> {
        let url = Url::parse(&format!("https://{host}/"))
            .map_err(|_| Error::Config(format!("invalid host {host}")))?;
        self.for_url(&url, None)
    }

    /// A throwaway pool sized for one large batch.
    pub fn batch_pool(
        &self,
        batch_size: usize,
        concurrency: usize,
    ) -> Result<reqwest::Client> {
        let connections = concurrency.min(batch_size).max(1);
        self.build_pool(None, None, connections)
    }

    /// Close the pool for one origin host.
    pub fn close_host(&self, host: &str) {
        self.pools.remove(&host.to_ascii_lowercase());
    }

    /// Close every pool. New dispatches rebuild lazily.
    pub fn close_all(&self) {
        self.pools.clear();
    }

    fn connections(&self) -> usize {
        self.config
            .connections
            .unwrap_or_else(|| default_connections(self.global_max))
    }

    fn build_hinted(
        &self,
        url: &Url,
        hints: &TransportHints,
    ) -> Result<reqwest::Client> {
        let proxy = match &hints.proxy {
            Some(ProxyOverride::Disabled) => None,
            Some(ProxyOverride::Proxy(proxy)) => Some(proxy),
            None => self.proxies.for_url(url),
        };
        self.build_pool(proxy, Some(hints), self.connections())
    }

    fn build_pool(
        &self,
        proxy: Option<&ProxyConfig>,
        hints: Option<&TransportHints>,
        connections: usize,
    ) -> Result<reqwest::Client> {
        let tls = hints.and_then(|h| h.tls.as_ref()).or(self.tls.as_ref());
        let dns = hints.and_then(|h| h.dns.as_ref()).or(self.dns.as_ref());
        let http2 =
            hints.and_then(|h| h.http2).or(self.http2).unwrap_or_default();
        let connect_timeout =
            hints.and_then(|h| h.connect_timeout).or(self.connect_timeout);

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();

        builder = if self.config.keep_alive {
            builder
                .pool_max_idle_per_host(connections)
                .pool_idle_timeout(Some(self.config.keep_alive_timeout))
                .tcp_keepalive(Some(self.config.keep_alive_timeout))
        } else {
            builder.pool_max_idle_per_host(0)
        };

        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if !http2.enabled {
            builder = builder.http1_only();
        }
        if let Some(tls) = tls {
            validate_tls(tls)?;
            if let Some(min) = tls.min_version {
                builder = builder.min_tls_version(min.into());
            }
            if let Some(max) = tls.max_version {
                builder = builder.max_tls_version(max.into());
            }
            if let Some(ca) = &tls.ca_pem {
                let cert = reqwest::tls::Certificate::from_pem(ca)
                    .map_err(|e| Error::Config(format!("invalid ca: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            if let Some(identity) = &tls.identity_pem {
                let identity = reqwest::tls::Identity::from_pem(identity)
                    .map_err(|e| {
                        Error::Config(format!("invalid identity: {e}"))
                    })?;
                builder = builder.identity(identity);
            }
            if tls.reject_unauthorized == Some(false) {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }
        if let Some(dns) = dns {
            validate_dns(dns)?;
            for (host, addr) in &dns.overrides {
                builder = builder.resolve(host, *addr);
            }
        }
        if let Some(proxy) = proxy {
            let mut reqwest_proxy = reqwest::Proxy::all(proxy.url.clone())
                .map_err(|e| Error::Config(format!("invalid proxy: {e}")))?;
            if let Some((username, password)) = &proxy.auth {
                reqwest_proxy = reqwest_proxy.basic_auth(username, password);
            }
            if !proxy.headers.is_empty() {
                reqwest_proxy = reqwest_proxy.headers(proxy.headers.clone());
            }
            builder = builder.proxy(reqwest_proxy);
        }

        builder.build().map_err(|e| {
            Error::Config(format!("failed to build connection pool: {e}"))
        })
    }
}

fn validate_tls(tls: &TlsConfig) -> Result<()> {
    if tls.ciphers.as_ref().is_some_and(|c| !c.is_empty()) {
        return Err(Error::Unsupported(
            "pinning TLS ciphers is not supported by the transport".into(),
        ));
    }
    if tls.alpn_protocols.as_ref().is_some_and(|p| !p.is_empty()) {
        return Err(Error::Unsupported(
            "custom ALPN protocol lists are not supported by the transport"
                .into(),
        ));
    }
    if tls.servername.is_some() {
        return Err(Error::Unsupported(
            "SNI overrides are not supported by the transport".into(),
        ));
    }
    Ok(())
}

fn validate_dns(dns: &DnsConfig) -> Result<()> {
    if !dns.servers.is_empty() {
        return Err(Error::Unsupported(
            "custom DNS servers are not supported by the transport".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(config: AgentConfig) -> AgentManager {
        AgentManager::new(
            config,
            Some(10),
            None,
            None,
            None,
            None,
            ProxySelector::disabled(),
        )
        .unwrap()
    }

    #[test]
    fn connections_derive_from_global_concurrency() {
        assert_eq!(default_connections(None), 6);
        assert_eq!(default_connections(Some(4)), 6);
        assert_eq!(default_connections(Some(20)), 10);
        assert_eq!(default_connections(Some(21)), 11);
    }

    #[test]
    fn per_domain_pools_are_cached_and_closable() {
        let manager = manager(AgentConfig {
            per_domain_pooling: true,
            ..AgentConfig::default()
        });
        let a = Url::parse("https://a.example/").unwrap();
        let b = Url::parse("https://b.example/").unwrap();
        manager.for_url(&a, None).unwrap();
        manager.for_url(&b, None).unwrap();
        assert_eq!(manager.pools.len(), 2);
        manager.close_host("a.example");
        assert_eq!(manager.pools.len(), 1);
        manager.close_all();
        assert_eq!(manager.pools.len(), 0);
    }

    #[test]
    fn shared_pool_without_per_domain() {
        let manager = manager(AgentConfig::default());
        let a = Url::parse("https://a.example/").unwrap();
        let b = Url::parse("https://b.example/").unwrap();
        manager.for_url(&a, None).unwrap();
        manager.for_url(&b, None).unwrap();
        assert_eq!(manager.pools.len(), 1);
    }

    #[test]
    fn unsupported_tls_options_fail_at_construction() {
        let result = AgentManager::new(
            AgentConfig::default(),
            None,
            Some(TlsConfig {
                ciphers: Some(vec!["TLS_AES_128_GCM_SHA256".into()]),
                ..TlsConfig::default()
            }),
            None,
            None,
            None,
            ProxySelector::disabled(),
        );
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn unsupported_dns_servers_fail_at_construction() {
        let result = AgentManager::new(
            AgentConfig::default(),
            None,
            None,
            Some(DnsConfig {
                servers: vec!["1.1.1.1".into()],
                ..DnsConfig::default()
            }),
            None,
            None,
            ProxySelector::disabled(),
        );
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
