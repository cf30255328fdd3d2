//! RFC 7234 caching middleware: directive-aware freshness, Vary-keyed
//! storage, conditional revalidation, stale-while-revalidate, and
//! stale-if-error.

pub mod directives;
pub mod fingerprint;
pub mod storage;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, Version};
use url::Url;

use crate::cache::directives::{MaxStale, RequestDirectives};
use crate::cache::fingerprint::{fingerprint, invalidation_key, vary_fingerprint};
use crate::cache::storage::{CacheEntry, CacheStorage};
use crate::error::{Error, Result};
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// `x-cache` header: how the cache produced this response.
pub const XCACHE: &str = "x-cache";
/// `x-cache-age` header: entry age in seconds for cache-served responses.
pub const XCACHE_AGE: &str = "x-cache-age";
/// `warning` header per RFC 7234 §5.5.
pub const WARNING: &str = "warning";

/// Origin of a response as advertised in `x-cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTag {
    /// Served fresh from cache
    Hit,
    /// Served stale from cache
    Stale,
    /// Served from cache after a `304 Not Modified`
    Revalidated,
    /// Served stale because the network failed
    StaleError,
    /// Fetched from the network
    Miss,
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "hit"),
            Self::Stale => write!(f, "stale"),
            Self::Revalidated => write!(f, "revalidated"),
            Self::StaleError => write!(f, "stale-error"),
            Self::Miss => write!(f, "miss"),
        }
    }
}

/// Cache lookup/fetch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Serve cached (even stale) when present, else fetch and store
    CacheFirst,
    /// Fetch; fall back to a cached entry on network error
    NetworkFirst,
    /// Always fetch; store if cacheable
    NetworkOnly,
    /// Serve cached immediately, refresh stale entries in the background
    StaleWhileRevalidate,
    /// Honor request and response directives strictly, revalidating stale
    /// entries with conditional requests
    #[default]
    RfcCompliant,
}

/// Per-request strategy override, carried in request extensions.
#[derive(Debug, Clone, Copy)]
pub struct CacheStrategyOverride(pub CacheStrategy);

/// Marker a conditional request carries so the cache middleware does not
/// re-enter itself for requests it already decorated.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RevalidationMarker;

/// Custom cache key generator.
pub type CacheKeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Cache middleware configuration.
#[derive(Clone)]
pub struct CacheConfig {
    /// Lookup/fetch strategy.
    pub strategy: CacheStrategy,
    /// Storage-level TTL applied to every stored entry.
    pub ttl: Option<Duration>,
    /// Methods the cache manages. Unsafe methods outside this set still
    /// invalidate on 2xx.
    pub methods: Vec<Method>,
    /// Parse and honor request/response `Cache-Control`.
    pub respect_cache_control: bool,
    /// Partition entries by the resource's `Vary` header.
    pub respect_vary: bool,
    /// Client-side tolerance for serving stale entries without
    /// revalidation.
    pub max_stale: Option<Duration>,
    /// Revalidate every hit regardless of freshness.
    pub force_revalidate: bool,
    /// Override the fingerprint-based cache key.
    pub key_generator: Option<CacheKeyFn>,
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("strategy", &self.strategy)
            .field("ttl", &self.ttl)
            .field("methods", &self.methods)
            .field("respect_cache_control", &self.respect_cache_control)
            .field("respect_vary", &self.respect_vary)
            .field("max_stale", &self.max_stale)
            .field("force_revalidate", &self.force_revalidate)
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::default(),
            ttl: None,
            methods: vec![Method::GET],
            respect_cache_control: true,
            respect_vary: true,
            max_stale: None,
            force_revalidate: false,
            key_generator: None,
        }
    }
}

// rfc7231 §6.1 cacheable-by-default status codes
const CACHEABLE_STATUSES: &[u16] =
    &[200, 203, 204, 300, 301, 308, 404, 405, 410, 414, 501];

const UNSAFE_METHODS: &[&str] = &[
    "POST", "PUT", "PATCH", "DELETE", "PURGE", "PROPPATCH", "MKCOL", "MOVE",
    "COPY", "LOCK", "UNLOCK",
];

// What fetch_and_store needs to key and partition the stored response
// after the request has been consumed by the chain.
struct StoreContext {
    url: Url,
    request_headers: http::HeaderMap,
}

/// The caching middleware.
pub struct CacheMiddleware {
    storage: Arc<dyn CacheStorage>,
    config: CacheConfig,
}

impl fmt::Debug for CacheMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMiddleware").field("config", &self.config).finish()
    }
}

impl CacheMiddleware {
    /// Create the middleware over a storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn CacheStorage>, config: CacheConfig) -> Self {
        Self { storage, config }
    }

    fn key_for(&self, req: &Request) -> String {
        match &self.config.key_generator {
            Some(generator) => generator(req),
            None => fingerprint(req),
        }
    }

    async fn get_quiet(&self, key: &str) -> Option<CacheEntry> {
        match self.storage.get(key).await {
            Ok(entry) => entry,
            Err(err) => {
                log::debug!("cache read failed for {key}: {err}");
                None
            }
        }
    }

    async fn set_quiet(&self, key: &str, entry: CacheEntry) {
        if let Err(err) =
            self.storage.set(key, entry, self.config.ttl).await
        {
            log::debug!("cache write failed for {key}: {err}");
        }
    }

    async fn invalidate(&self, url: &Url) {
        for method in ["GET", "HEAD"] {
            let key = invalidation_key(method, url);
            if let Err(err) = self.storage.delete(&key).await {
                log::debug!("cache invalidation failed for {key}: {err}");
            }
        }
    }

    fn serve(
        &self,
        entry: &CacheEntry,
        tag: CacheTag,
        now: SystemTime,
    ) -> Result<Response> {
        let url = Url::parse(&entry.url)?;
        let status = StatusCode::from_u16(entry.status)
            .map_err(|e| Error::parse("status", e))?;
        let mut response = Response::new(
            status,
            url.clone(),
            entry.header_map(),
            Version::HTTP_11,
            Bytes::from(entry.body.clone()),
        );
        decorate(&mut response, tag, Some(entry.age(now)));
        match tag {
            CacheTag::Stale => {
                add_warning(&mut response, &url, 110, "Response is stale");
            }
            CacheTag::StaleError => {
                add_warning(&mut response, &url, 111, "Revalidation failed");
            }
            _ => {}
        }
        Ok(response)
    }

    fn synthesize_gateway_timeout(&self, url: &Url) -> Response {
        let mut response = Response::new(
            StatusCode::GATEWAY_TIMEOUT,
            url.clone(),
            http::HeaderMap::new(),
            Version::HTTP_11,
            Bytes::from_static(b"GatewayTimeout"),
        );
        decorate(&mut response, CacheTag::Miss, None);
        response
    }

    // Fresh enough to serve without touching the network?
    fn satisfies_fresh(
        &self,
        entry: &CacheEntry,
        req_dirs: &RequestDirectives,
        now: SystemTime,
    ) -> bool {
        !self.config.force_revalidate
            && !req_dirs.no_cache
            && !entry.directives.no_cache
            && entry.is_fresh(now)
            && req_dirs.max_age.is_none_or(|n| entry.age(now) <= n)
            && req_dirs
                .min_fresh
                .is_none_or(|n| entry.remaining_freshness(now) >= n)
    }

    // Stale, but within an allowed staleness tolerance?
    fn allowed_stale(
        &self,
        entry: &CacheEntry,
        req_dirs: &RequestDirectives,
        now: SystemTime,
    ) -> bool {
        if entry.is_fresh(now)
            || entry.directives.must_revalidate
            || entry.directives.no_cache
            || req_dirs.no_cache
            || self.config.force_revalidate
        {
            return false;
        }
        let staleness = entry.staleness(now);
        match req_dirs.max_stale {
            Some(MaxStale::Unbounded) => true,
            Some(MaxStale::Seconds(tolerance)) => staleness <= tolerance,
            None => self
                .config
                .max_stale
                .is_some_and(|tolerance| staleness <= tolerance.as_secs()),
        }
    }

    fn stale_if_error_ok(&self, entry: &CacheEntry, now: SystemTime) -> bool {
        entry
            .directives
            .stale_if_error
            .is_some_and(|window| entry.staleness(now) <= window)
    }

    fn conditional_request(
        &self,
        req: &Request,
        entry: &CacheEntry,
    ) -> Result<Option<Request>> {
        if entry.etag.is_none() && entry.last_modified.is_none() {
            return Ok(None);
        }
        let mut conditional = req.try_clone()?;
        if let Some(etag) = &entry.etag {
            conditional.headers_mut().insert(
                http::header::IF_NONE_MATCH,
                HeaderValue::from_str(etag)?,
            );
        }
        if let Some(last_modified) = &entry.last_modified {
            conditional.headers_mut().insert(
                http::header::IF_MODIFIED_SINCE,
                HeaderValue::from_str(last_modified)?,
            );
        }
        // A 304 must survive the status-check stage.
        conditional.set_throw_http_errors(false);
        conditional.extensions_mut().insert(RevalidationMarker);
        Ok(Some(conditional))
    }

    async fn fetch_and_store(
        &self,
        req: Request,
        next: Next,
        base_key: &str,
        now: SystemTime,
    ) -> Result<Response> {
        let ctx = StoreContext {
            url: req.url().clone(),
            request_headers: req.headers().clone(),
        };
        let mut response = next.run(req).await?;
        self.maybe_store(&mut response, &ctx, base_key, now).await;
        decorate(&mut response, CacheTag::Miss, None);
        Ok(response)
    }

    async fn maybe_store(
        &self,
        response: &mut Response,
        ctx: &StoreContext,
        base_key: &str,
        now: SystemTime,
    ) {
        if !CACHEABLE_STATUSES.contains(&response.status().as_u16()) {
            return;
        }
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                log::debug!("not caching unreadable body: {err}");
                return;
            }
        };
        let entry = CacheEntry::from_parts(
            response.status(),
            response.headers(),
            body.to_vec(),
            &ctx.url,
            now,
        );
        if self.config.respect_cache_control {
            if entry.directives.no_store {
                return;
            }
            // Without any freshness source or validator there is nothing
            // a later lookup could do with the entry.
            let storable = entry.lifetime().is_some()
                || entry.etag.is_some()
                || entry.last_modified.is_some();
            if !storable {
                return;
            }
        }
        if self.config.respect_vary {
            if let Some(vary) = entry.vary.clone() {
                if vary.trim() == "*" {
                    return;
                }
                let vary_key =
                    vary_fingerprint(base_key, &vary, &ctx.request_headers);
                let marker = CacheEntry::vary_marker(&vary, &ctx.url, now);
                self.set_quiet(base_key, marker).await;
                self.set_quiet(&vary_key, entry).await;
                return;
            }
        }
        self.set_quiet(base_key, entry).await;
    }

    async fn revalidate(
        &self,
        req: Request,
        next: Next,
        mut entry: CacheEntry,
        base_key: &str,
        effective_key: &str,
        now: SystemTime,
    ) -> Result<Response> {
        let conditional = match self.conditional_request(&req, &entry) {
            Ok(Some(conditional)) => conditional,
            // No validators (or a one-shot body): plain refetch.
            Ok(None) | Err(_) => {
                return self.fetch_and_store(req, next, base_key, now).await
            }
        };
        let ctx = StoreContext {
            url: req.url().clone(),
            request_headers: req.headers().clone(),
        };
        match next.clone().run(conditional).await {
            Ok(mut response) => {
                if response.status() == StatusCode::NOT_MODIFIED {
                    entry.refresh_from_304(response.headers(), now);
                    self.set_quiet(effective_key, entry.clone()).await;
                    return self.serve(&entry, CacheTag::Revalidated, now);
                }
                if response.status().is_server_error()
                    && self.stale_if_error_ok(&entry, now)
                {
                    return self.serve(&entry, CacheTag::StaleError, now);
                }
                self.maybe_store(&mut response, &ctx, base_key, now).await;
                decorate(&mut response, CacheTag::Miss, None);
                Ok(response)
            }
            Err(err) => {
                if err.is_retriable() && self.stale_if_error_ok(&entry, now) {
                    return self.serve(&entry, CacheTag::StaleError, now);
                }
                Err(err)
            }
        }
    }

    fn spawn_refresh(
        &self,
        req: &Request,
        next: Next,
        effective_key: String,
        entry: CacheEntry,
    ) {
        let refresh = match self.conditional_request(req, &entry) {
            Ok(Some(conditional)) => conditional,
            Ok(None) => match req.try_clone() {
                Ok(mut plain) => {
                    plain.set_throw_http_errors(false);
                    plain.extensions_mut().insert(RevalidationMarker);
                    plain
                }
                Err(_) => return,
            },
            Err(_) => return,
        };
        let storage = Arc::clone(&self.storage);
        let ttl = self.config.ttl;
        tokio::spawn(async move {
            let now = SystemTime::now();
            match next.run(refresh).await {
                Ok(mut response) => {
                    if response.status() == StatusCode::NOT_MODIFIED {
                        let mut refreshed = entry;
                        refreshed.refresh_from_304(response.headers(), now);
                        if let Err(err) =
                            storage.set(&effective_key, refreshed, ttl).await
                        {
                            log::debug!("background refresh store: {err}");
                        }
                        return;
                    }
                    if !CACHEABLE_STATUSES
                        .contains(&response.status().as_u16())
                    {
                        return;
                    }
                    let Ok(body) = response.bytes().await else { return };
                    let refreshed = CacheEntry::from_parts(
                        response.status(),
                        response.headers(),
                        body.to_vec(),
                        response.url(),
                        now,
                    );
                    if let Err(err) =
                        storage.set(&effective_key, refreshed, ttl).await
                    {
                        log::debug!("background refresh store: {err}");
                    }
                }
                Err(err) => {
                    log::debug!("background revalidation failed: {err}");
                }
            }
        });
    }

    async fn rfc_flow(
        &self,
        req: Request,
        next: Next,
        entry: Option<CacheEntry>,
        base_key: &str,
        effective_key: &str,
        req_dirs: &RequestDirectives,
        now: SystemTime,
    ) -> Result<Response> {
        let Some(entry) = entry else {
            return self.fetch_and_store(req, next, base_key, now).await;
        };
        if self.satisfies_fresh(&entry, req_dirs, now) {
            return self.serve(&entry, CacheTag::Hit, now);
        }
        if self.allowed_stale(&entry, req_dirs, now) {
            return self.serve(&entry, CacheTag::Stale, now);
        }
        self.revalidate(req, next, entry, base_key, effective_key, now).await
    }
}

#[async_trait::async_trait]
impl Middleware for CacheMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response> {
        // Idempotence on re-entry: conditional requests this middleware
        // built flow straight through.
        if req.extensions().get::<RevalidationMarker>().is_some() {
            return next.run(req).await;
        }
        let method = req.method().clone();
        if !self.config.methods.contains(&method) {
            if UNSAFE_METHODS.contains(&method.as_str()) {
                let url = req.url().clone();
                let response = next.run(req).await?;
                if response.status().is_success() {
                    self.invalidate(&url).await;
                }
                return Ok(response);
            }
            return next.run(req).await;
        }

        let now = SystemTime::now();
        let req_dirs = if self.config.respect_cache_control {
            RequestDirectives::parse(req.headers())
        } else {
            RequestDirectives::default()
        };
        if req_dirs.no_store {
            return next.run(req).await;
        }
        let strategy = req
            .extensions()
            .get::<CacheStrategyOverride>()
            .map(|o| o.0)
            .unwrap_or(self.config.strategy);

        // Two-level lookup: a marker at the base key names the Vary set;
        // the full entry lives at the vary-adjusted key.
        let base_key = self.key_for(&req);
        let mut effective_key = base_key.clone();
        let mut entry = self.get_quiet(&base_key).await;
        if let Some(found) = &entry {
            if found.vary_marker && self.config.respect_vary {
                if let Some(vary) = found.vary.clone() {
                    effective_key =
                        vary_fingerprint(&base_key, &vary, req.headers());
                    entry = self.get_quiet(&effective_key).await;
                }
            }
        }
        let entry = entry.filter(|found| !found.vary_marker);

        if req_dirs.only_if_cached {
            if let Some(entry) = entry {
                if self.satisfies_fresh(&entry, &req_dirs, now) {
                    return self.serve(&entry, CacheTag::Hit, now);
                }
                if self.allowed_stale(&entry, &req_dirs, now) {
                    return self.serve(&entry, CacheTag::Stale, now);
                }
            }
            return Ok(self.synthesize_gateway_timeout(req.url()));
        }

        match strategy {
            CacheStrategy::NetworkOnly => {
                self.fetch_and_store(req, next, &base_key, now).await
            }
            CacheStrategy::CacheFirst => match entry {
                Some(entry) => {
                    let tag = if entry.is_fresh(now) {
                        CacheTag::Hit
                    } else {
                        CacheTag::Stale
                    };
                    self.serve(&entry, tag, now)
                }
                None => self.fetch_and_store(req, next, &base_key, now).await,
            },
            CacheStrategy::NetworkFirst => {
                match self
                    .fetch_and_store(req, next, &base_key, now)
                    .await
                {
                    Ok(response) => Ok(response),
                    Err(err) if err.is_retriable() => match entry {
                        Some(entry) => {
                            self.serve(&entry, CacheTag::StaleError, now)
                        }
                        None => Err(err),
                    },
                    Err(err) => Err(err),
                }
            }
            CacheStrategy::StaleWhileRevalidate => match entry {
                Some(entry) => {
                    if entry.is_fresh(now) {
                        return self.serve(&entry, CacheTag::Hit, now);
                    }
                    self.spawn_refresh(
                        &req,
                        next,
                        effective_key.clone(),
                        entry.clone(),
                    );
                    self.serve(&entry, CacheTag::Stale, now)
                }
                None => self.fetch_and_store(req, next, &base_key, now).await,
            },
            CacheStrategy::RfcCompliant => {
                self.rfc_flow(
                    req,
                    next,
                    entry,
                    &base_key,
                    &effective_key,
                    &req_dirs,
                    now,
                )
                .await
            }
        }
    }

    fn name(&self) -> &'static str {
        "cache"
    }
}

fn decorate(response: &mut Response, tag: CacheTag, age: Option<u64>) {
    if let Ok(value) = HeaderValue::from_str(&tag.to_string()) {
        response.headers_mut().insert(XCACHE, value);
    }
    if let Some(age) = age {
        response.headers_mut().insert(XCACHE_AGE, HeaderValue::from(age));
    }
}

// warning-value = warn-code SP warn-agent SP warn-text [SP warn-date]
// (RFC 7234 §5.5)
fn add_warning(response: &mut Response, url: &Url, code: u16, message: &str) {
    let host = url.host_str().unwrap_or("unknown");
    let value = format!(
        "{code} {host} \"{message}\" \"{}\"",
        httpdate::fmt_http_date(SystemTime::now())
    );
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().append(WARNING, value);
    }
}
