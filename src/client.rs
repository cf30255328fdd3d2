//! The client façade: URL building, default merging, chain composition,
//! and the batch/paginate conveniences.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use http::header::{HeaderName, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method};
use serde::Serialize;
use url::Url;

use crate::agent::{
    AgentConfig, AgentManager, DnsConfig, Http2Config, TlsConfig,
    TransportHints,
};
use crate::cache::storage::CacheStorage;
use crate::cache::{CacheConfig, CacheMiddleware, CacheStrategy, CacheStrategyOverride};
use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::middleware::{
    CompressionConfig, CompressionMiddleware, DedupConfig, DedupMiddleware,
    LoggerMiddleware, Middleware, Next, RetryConfig, RetryMiddleware,
    StatusCheckMiddleware, XsrfConfig, XsrfMiddleware,
};
use crate::pool::{PoolConfig, RequestPoolMiddleware};
use crate::progress::ProgressSink;
use crate::proxy::{ProxyConfig, ProxySelector};
use crate::request::{
    Body, CancelToken, Part, RedirectPolicy, Request, TimeoutPolicy,
};
use crate::response::Response;
use crate::runner::{BatchOutcome, RequestRunner, RunnerConfig};
use crate::transport::Transport;

/// Hook run before dispatch; may return a replacement request.
pub type BeforeRequestHook =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Request>> + Send + Sync>;

/// Hook run after a response; may return a replacement response.
pub type AfterResponseHook = Arc<
    dyn Fn(Response) -> BoxFuture<'static, Result<Response>> + Send + Sync,
>;

/// Hook run on error; the first hook returning a response swallows the
/// error and supplies that response.
pub type OnErrorHook = Arc<
    dyn for<'a> Fn(&'a Error) -> BoxFuture<'a, Option<Response>>
        + Send
        + Sync,
>;

/// Selector extracting the next page URL from a response. The default
/// reads `Link: <...>; rel="next"`.
pub type NextPageFn = Arc<dyn Fn(&Response) -> Option<String> + Send + Sync>;

/// Declared concurrency: the global pool, the batch runner, and the
/// agent pools all derive from it.
#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Global in-flight cap.
    pub max: Option<usize>,
    /// Token-bucket rate: tokens per interval.
    pub requests_per_interval: Option<u32>,
    /// Token-bucket interval.
    pub interval: Duration,
    /// Batch runner defaults.
    pub runner: RunnerConfig,
    /// Connection pool parameters.
    pub agent: AgentConfig,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max: None,
            requests_per_interval: None,
            interval: Duration::from_secs(1),
            runner: RunnerConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl From<usize> for ConcurrencyConfig {
    fn from(max: usize) -> Self {
        Self { max: Some(max), ..Self::default() }
    }
}

struct HooksMiddleware {
    before_request: Vec<BeforeRequestHook>,
    after_response: Vec<AfterResponseHook>,
    on_error: Vec<OnErrorHook>,
}

impl HooksMiddleware {
    fn is_empty(&self) -> bool {
        self.before_request.is_empty()
            && self.after_response.is_empty()
            && self.on_error.is_empty()
    }
}

#[async_trait::async_trait]
impl Middleware for HooksMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response> {
        let mut req = req;
        for hook in &self.before_request {
            req = hook(req).await?;
        }
        match next.run(req).await {
            Ok(mut response) => {
                for hook in &self.after_response {
                    response = hook(response).await?;
                }
                Ok(response)
            }
            Err(err) => {
                for hook in &self.on_error {
                    if let Some(response) = hook(&err).await {
                        return Ok(response);
                    }
                }
                Err(err)
            }
        }
    }

    fn name(&self) -> &'static str {
        "hooks"
    }
}

/// Builder collecting configuration before the chain is composed.
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    default_params: HashMap<String, String>,
    timeout: TimeoutPolicy,
    redirect: RedirectPolicy,
    throw_http_errors: bool,
    max_response_size: Option<u64>,
    debug_log: bool,
    observability: bool,
    concurrency: ConcurrencyConfig,
    dedup: Option<DedupConfig>,
    retry: Option<RetryConfig>,
    cache: Option<(CacheConfig, Arc<dyn CacheStorage>)>,
    compression: Option<CompressionConfig>,
    xsrf: Option<XsrfConfig>,
    cookies: bool,
    proxy: Option<ProxyConfig>,
    env_proxy: bool,
    tls: Option<TlsConfig>,
    dns: Option<DnsConfig>,
    http2: Option<Http2Config>,
    before_request: Vec<BeforeRequestHook>,
    after_response: Vec<AfterResponseHook>,
    on_error: Vec<OnErrorHook>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("cookies", &self.cookies)
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            default_params: HashMap::new(),
            timeout: TimeoutPolicy::default(),
            redirect: RedirectPolicy::standard(),
            throw_http_errors: true,
            max_response_size: None,
            debug_log: false,
            observability: true,
            concurrency: ConcurrencyConfig::default(),
            dedup: None,
            retry: None,
            cache: None,
            compression: None,
            xsrf: None,
            cookies: false,
            proxy: None,
            env_proxy: true,
            tls: None,
            dns: None,
            http2: None,
            before_request: Vec::new(),
            after_response: Vec::new(),
            on_error: Vec::new(),
            middlewares: Vec::new(),
        }
    }
}

impl ClientBuilder {
    /// Start a builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Base URL joined with relative request paths.
    pub fn base_url(mut self, base: &str) -> Result<Self> {
        self.base_url = Some(Url::parse(base)?);
        Ok(self)
    }

    /// Add a default header sent with every request (request headers win
    /// on conflict).
    pub fn default_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.default_headers.insert(
            name.parse::<HeaderName>()?,
            HeaderValue::from_str(value)?,
        );
        Ok(self)
    }

    /// Add a default `:name` substitution / query parameter.
    #[must_use]
    pub fn default_param(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_params.insert(name.into(), value.into());
        self
    }

    /// Timeout dials applied to every request.
    #[must_use]
    pub fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    /// Redirect policy applied to every request.
    #[must_use]
    pub fn redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = redirect;
        self
    }

    /// Whether 4xx/5xx reject with [`Error::HttpStatus`] (default true).
    #[must_use]
    pub fn throw_http_errors(mut self, throw: bool) -> Self {
        self.throw_http_errors = throw;
        self
    }

    /// Response size cap in bytes, inclusive.
    #[must_use]
    pub fn max_response_size(mut self, max: u64) -> Self {
        self.max_response_size = Some(max);
        self
    }

    /// Log request/response lines at debug level.
    #[must_use]
    pub fn debug_log(mut self, enabled: bool) -> Self {
        self.debug_log = enabled;
        self
    }

    /// Record timings and connection metadata (default true).
    #[must_use]
    pub fn observability(mut self, enabled: bool) -> Self {
        self.observability = enabled;
        self
    }

    /// Declared concurrency (global cap, rate, runner, agent pools).
    #[must_use]
    pub fn concurrency(
        mut self,
        concurrency: impl Into<ConcurrencyConfig>,
    ) -> Self {
        self.concurrency = concurrency.into();
        self
    }

    /// Collapse concurrent identical requests into one dispatch.
    #[must_use]
    pub fn dedup(mut self, config: DedupConfig) -> Self {
        self.dedup = Some(config);
        self
    }

    /// Retry retriable failures.
    #[must_use]
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Cache responses in `storage` under `config`.
    #[must_use]
    pub fn cache(
        mut self,
        config: CacheConfig,
        storage: Arc<dyn CacheStorage>,
    ) -> Self {
        self.cache = Some((config, storage));
        self
    }

    /// Negotiate and transparently decode compressed bodies.
    #[must_use]
    pub fn compression(mut self, config: CompressionConfig) -> Self {
        self.compression = Some(config);
        self
    }

    /// Mirror an XSRF cookie into a header (implies a cookie jar).
    #[must_use]
    pub fn xsrf(mut self, config: XsrfConfig) -> Self {
        self.xsrf = Some(config);
        self.cookies = true;
        self
    }

    /// Maintain an RFC 6265 cookie jar.
    #[must_use]
    pub fn cookies(mut self, enabled: bool) -> Self {
        self.cookies = enabled;
        self
    }

    /// Route requests through an explicit proxy (disables env discovery).
    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Consult `HTTP_PROXY`/`HTTPS_PROXY`/`ALL_PROXY`/`NO_PROXY` when no
    /// explicit proxy is set (default true).
    #[must_use]
    pub fn env_proxy(mut self, enabled: bool) -> Self {
        self.env_proxy = enabled;
        self
    }

    /// TLS options for origin connections.
    #[must_use]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// DNS options.
    #[must_use]
    pub fn dns(mut self, dns: DnsConfig) -> Self {
        self.dns = Some(dns);
        self
    }

    /// HTTP/2 opt-in and tuning.
    #[must_use]
    pub fn http2(mut self, http2: Http2Config) -> Self {
        self.http2 = Some(http2);
        self
    }

    /// Register a `before_request` hook.
    #[must_use]
    pub fn before_request(mut self, hook: BeforeRequestHook) -> Self {
        self.before_request.push(hook);
        self
    }

    /// Register an `after_response` hook.
    #[must_use]
    pub fn after_response(mut self, hook: AfterResponseHook) -> Self {
        self.after_response.push(hook);
        self
    }

    /// Register an `on_error` hook.
    #[must_use]
    pub fn on_error(mut self, hook: OnErrorHook) -> Self {
        self.on_error.push(hook);
        self
    }

    /// Register a user middleware (runs between cache and hooks, in
    /// registration order).
    #[must_use]
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Compose the chain and build the client.
    pub fn build(self) -> Result<Client> {
        let jar = self.cookies.then(|| Arc::new(CookieJar::new()));
        let proxies = match self.proxy {
            Some(proxy) => ProxySelector::explicit(proxy),
            None if self.env_proxy => ProxySelector::from_env()?,
            None => ProxySelector::disabled(),
        };
        let agents = AgentManager::new(
            self.concurrency.agent,
            self.concurrency.max,
            self.tls,
            self.dns,
            self.http2,
            self.timeout.connect,
            proxies,
        )?;
        let transport = Arc::new(
            Transport::new(agents, jar.clone())
                .with_observability(self.observability),
        );

        let mut prefix: Vec<Arc<dyn Middleware>> = Vec::new();
        if self.debug_log {
            prefix.push(Arc::new(LoggerMiddleware));
        }
        let pool = PoolConfig {
            max: self.concurrency.max,
            requests_per_interval: self.concurrency.requests_per_interval,
            interval: self.concurrency.interval,
        };
        if pool.is_enabled() {
            prefix.push(Arc::new(RequestPoolMiddleware::new(pool)?));
        }
        if let Some(dedup) = self.dedup {
            prefix.push(Arc::new(DedupMiddleware::new(dedup)));
        }
        if let Some(retry) = self.retry {
            prefix.push(Arc::new(RetryMiddleware::new(retry)));
        }
        if let Some((config, storage)) = self.cache {
            prefix.push(Arc::new(CacheMiddleware::new(storage, config)));
        }
        if let Some(compression) = self.compression {
            prefix.push(Arc::new(CompressionMiddleware::new(compression)));
        }
        if let Some(xsrf) = self.xsrf {
            match jar.clone() {
                Some(jar) => {
                    prefix.push(Arc::new(XsrfMiddleware::new(xsrf, jar)));
                }
                None => {
                    return Err(Error::Config(
                        "xsrf requires the cookie jar".into(),
                    ))
                }
            }
        }

        let mut suffix: Vec<Arc<dyn Middleware>> = Vec::new();
        let hooks = HooksMiddleware {
            before_request: self.before_request,
            after_response: self.after_response,
            on_error: self.on_error,
        };
        if !hooks.is_empty() {
            suffix.push(Arc::new(hooks));
        }
        suffix.push(Arc::new(StatusCheckMiddleware));

        let inner = ClientInner {
            base_url: self.base_url,
            default_headers: self.default_headers,
            default_params: self.default_params,
            timeout: self.timeout,
            redirect: self.redirect,
            throw_http_errors: self.throw_http_errors,
            max_response_size: self.max_response_size,
            runner_config: self.concurrency.runner,
            transport,
            jar,
            prefix,
            suffix,
            user: RwLock::new(self.middlewares),
            chain: RwLock::new(Arc::from(
                Vec::<Arc<dyn Middleware>>::new(),
            )),
        };
        inner.recompose();
        Ok(Client { inner: Arc::new(inner) })
    }
}

struct ClientInner {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    default_params: HashMap<String, String>,
    timeout: TimeoutPolicy,
    redirect: RedirectPolicy,
    throw_http_errors: bool,
    max_response_size: Option<u64>,
    runner_config: RunnerConfig,
    transport: Arc<Transport>,
    jar: Option<Arc<CookieJar>>,
    prefix: Vec<Arc<dyn Middleware>>,
    suffix: Vec<Arc<dyn Middleware>>,
    user: RwLock<Vec<Arc<dyn Middleware>>>,
    // The composed chain; swapped atomically so readers observe either
    // the old or the new composition, never a half-built one.
    chain: RwLock<Arc<[Arc<dyn Middleware>]>>,
}

impl ClientInner {
    fn recompose(&self) {
        let user = self.user.read().expect("middleware list poisoned");
        let mut composed: Vec<Arc<dyn Middleware>> = Vec::with_capacity(
            self.prefix.len() + user.len() + self.suffix.len(),
        );
        composed.extend(self.prefix.iter().cloned());
        composed.extend(user.iter().cloned());
        composed.extend(self.suffix.iter().cloned());
        drop(user);
        *self.chain.write().expect("chain poisoned") = Arc::from(composed);
    }

    fn chain(&self) -> Arc<[Arc<dyn Middleware>]> {
        Arc::clone(&self.chain.read().expect("chain poisoned"))
    }
}

/// The HTTP client façade.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field(
                "base_url",
                &self.inner.base_url.as_ref().map(Url::as_str),
            )
            .field("middlewares", &self.inner.chain().len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start building a client.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// A client with default configuration and no base URL.
    pub fn new() -> Result<Self> {
        ClientBuilder::new().build()
    }

    /// The shared cookie jar, when cookies are enabled.
    #[must_use]
    pub fn cookie_jar(&self) -> Option<&Arc<CookieJar>> {
        self.inner.jar.as_ref()
    }

    /// The connection pool manager.
    #[must_use]
    pub fn agents(&self) -> &AgentManager {
        self.inner.transport.agents()
    }

    /// Append a middleware to the user section and recompose the chain.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner
            .user
            .write()
            .expect("middleware list poisoned")
            .push(middleware);
        self.inner.recompose();
    }

    /// Begin a request.
    #[must_use]
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, path)
    }

    /// Begin a GET request.
    #[must_use]
    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    /// Begin a POST request.
    #[must_use]
    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    /// Begin a PUT request.
    #[must_use]
    pub fn put(&self, path: &str) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    /// Begin a PATCH request.
    #[must_use]
    pub fn patch(&self, path: &str) -> RequestBuilder {
        self.request(Method::PATCH, path)
    }

    /// Begin a DELETE request.
    #[must_use]
    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Begin a HEAD request.
    #[must_use]
    pub fn head(&self, path: &str) -> RequestBuilder {
        self.request(Method::HEAD, path)
    }

    /// Dispatch a prepared request through the composed chain.
    pub async fn send(&self, req: Request) -> Result<Response> {
        let chain = self.inner.chain();
        Next::new(chain, Arc::clone(&self.inner.transport)).run(req).await
    }

    /// Dispatch several requests through the batch runner; errors come
    /// back as values alongside runner statistics.
    pub async fn batch(
        &self,
        requests: Vec<Request>,
    ) -> BatchOutcome<Response> {
        self.batch_with(requests, self.inner.runner_config, 0).await
    }

    /// [`batch`](Self::batch) with explicit runner configuration and
    /// priority.
    pub async fn batch_with(
        &self,
        requests: Vec<Request>,
        config: RunnerConfig,
        priority: i32,
    ) -> BatchOutcome<Response> {
        let runner = RequestRunner::new(config);
        let slots: Arc<Vec<std::sync::Mutex<Option<Request>>>> = Arc::new(
            requests
                .into_iter()
                .map(|req| std::sync::Mutex::new(Some(req)))
                .collect(),
        );
        let client = self.clone();
        runner
            .run(
                (0..slots.len()).collect::<Vec<usize>>(),
                move |index| {
                    let client = client.clone();
                    let slots = Arc::clone(&slots);
                    async move {
                        let req = slots[index]
                            .lock()
                            .expect("batch slot poisoned")
                            .take()
                            .ok_or_else(|| {
                                Error::network(
                                    "batch request already consumed",
                                )
                            })?;
                        client.send(req).await
                    }
                },
                priority,
            )
            .await
    }

    /// Dispatch several requests concurrently without the runner.
    pub async fn multi(
        &self,
        requests: Vec<Request>,
    ) -> Vec<Result<Response>> {
        futures::future::join_all(
            requests.into_iter().map(|req| self.send(req)),
        )
        .await
    }

    /// A lazy stream of page responses. The selector extracts the next
    /// URL from each page; the default follows `Link: rel="next"`.
    pub fn paginate(
        &self,
        path: &str,
        next_page: Option<NextPageFn>,
    ) -> BoxStream<'static, Result<Response>> {
        let selector: NextPageFn =
            next_page.unwrap_or_else(|| Arc::new(link_rel_next));
        let first = self.build_url(path, &HashMap::new());
        let client = self.clone();
        let state = match first {
            Ok(url) => Some(url),
            Err(err) => {
                return Box::pin(futures::stream::once(async move {
                    Err(err)
                }))
            }
        };
        Box::pin(futures::stream::try_unfold(state, move |state| {
            let client = client.clone();
            let selector = Arc::clone(&selector);
            async move {
                let Some(url) = state else { return Ok(None) };
                let req = client.prepare(Method::GET, url.clone());
                let response = client.send(req).await?;
                let next = selector(&response)
                    .and_then(|href| url.join(&href).ok());
                Ok(Some((response, next)))
            }
        }))
    }

    /// Alias for [`paginate`](Self::paginate).
    pub fn pages(
        &self,
        path: &str,
        next_page: Option<NextPageFn>,
    ) -> BoxStream<'static, Result<Response>> {
        self.paginate(path, next_page)
    }

    // A request with client defaults applied, for internal dispatches
    // that bypass the request builder.
    fn prepare(&self, method: Method, url: Url) -> Request {
        let mut req = Request::new(method, url);
        *req.headers_mut() = self.inner.default_headers.clone();
        req.set_timeout(self.inner.timeout);
        req.set_redirect(self.inner.redirect.clone());
        req.set_throw_http_errors(self.inner.throw_http_errors);
        req.set_max_response_size(self.inner.max_response_size);
        req
    }

    /// Build an absolute URL from `path`: an absolute `path` overrides
    /// the base URL, `:name` placeholders are substituted from params,
    /// and unused params become query arguments.
    pub fn build_url(
        &self,
        path: &str,
        params: &HashMap<String, String>,
    ) -> Result<Url> {
        let mut merged = self.inner.default_params.clone();
        merged.extend(params.clone());
        let substituted = substitute_placeholders(path, &mut merged);
        let mut url = match Url::parse(&substituted) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.inner.base_url.as_ref().ok_or_else(|| {
                    Error::Config(format!(
                        "relative path {substituted:?} with no base_url"
                    ))
                })?;
                base.join(&substituted)?
            }
            Err(err) => return Err(err.into()),
        };
        if !merged.is_empty() {
            let mut leftovers: Vec<(String, String)> =
                merged.into_iter().collect();
            leftovers.sort();
            let mut pairs = url.query_pairs_mut();
            for (name, value) in leftovers {
                pairs.append_pair(&name, &value);
            }
            drop(pairs);
        }
        Ok(url)
    }
}

// Longest keys first so ":id" never clobbers ":idx".
fn substitute_placeholders(
    path: &str,
    params: &mut HashMap<String, String>,
) -> String {
    let mut keys: Vec<String> = params.keys().cloned().collect();
    keys.sort_by_key(|key| std::cmp::Reverse(key.len()));
    let mut out = path.to_string();
    for key in keys {
        let token = format!(":{key}");
        if out.contains(&token) {
            if let Some(value) = params.remove(&key) {
                out = out.replace(&token, &value);
            }
        }
    }
    out
}

fn link_rel_next(response: &Response) -> Option<String> {
    let link = response.header("link")?;
    for part in link.split(',') {
        let part = part.trim();
        let mut sections = part.split(';');
        let target = sections.next()?.trim();
        let is_next = sections.any(|section| {
            let section = section.trim().to_ascii_lowercase();
            section == "rel=\"next\"" || section == "rel=next"
        });
        if is_next {
            return Some(
                target
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string(),
            );
        }
    }
    None
}

/// Per-request options, resolved into a [`Request`] at `send`.
pub struct RequestBuilder {
    client: Client,
    method: Method,
    path: String,
    headers: HeaderMap,
    params: HashMap<String, String>,
    body: Body,
    timeout: Option<TimeoutPolicy>,
    redirect: Option<RedirectPolicy>,
    throw_http_errors: Option<bool>,
    max_response_size: Option<u64>,
    signal: Option<CancelToken>,
    hints: Option<TransportHints>,
    cache_strategy: Option<CacheStrategy>,
    dedup_disabled: bool,
    on_upload_progress: Option<ProgressSink>,
    on_download_progress: Option<ProgressSink>,
    deferred_error: Option<Error>,
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RequestBuilder {
    fn new(client: Client, method: Method, path: &str) -> Self {
        Self {
            client,
            method,
            path: path.to_string(),
            headers: HeaderMap::new(),
            params: HashMap::new(),
            body: Body::Empty,
            timeout: None,
            redirect: None,
            throw_http_errors: None,
            max_response_size: None,
            signal: None,
            hints: None,
            cache_strategy: None,
            dedup_disabled: false,
            on_upload_progress: None,
            on_download_progress: None,
            deferred_error: None,
        }
    }

    /// Set a header, replacing any client default of the same name.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => {
                self.deferred_error = Some(Error::Config(format!(
                    "invalid header {name}: {value}"
                )));
            }
        }
        self
    }

    /// Add a `:name` substitution / query parameter.
    #[must_use]
    pub fn param(
        mut self,
        name: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// JSON body with `Content-Type: application/json`.
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(encoded) => {
                self.body = Body::Bytes(Bytes::from(encoded));
                self.headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            Err(err) => {
                self.deferred_error = Some(Error::parse("json", err));
            }
        }
        self
    }

    /// Plain text body.
    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Text(body.into());
        self
    }

    /// Raw bytes body.
    #[must_use]
    pub fn bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    /// URL-encoded form body.
    #[must_use]
    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = Body::Form(pairs);
        self
    }

    /// Multipart body.
    #[must_use]
    pub fn multipart(mut self, parts: Vec<Part>) -> Self {
        self.body = Body::multipart(parts);
        self
    }

    /// Streaming body with an optional known length.
    #[must_use]
    pub fn stream(
        mut self,
        stream: crate::request::BodyStream,
        len: Option<u64>,
    ) -> Self {
        self.body = Body::Stream { stream, len };
        self
    }

    /// Override the timeout dials.
    #[must_use]
    pub fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override only the total dial.
    #[must_use]
    pub fn total_timeout(mut self, total: Duration) -> Self {
        let mut timeout = self.timeout.unwrap_or(self.client.inner.timeout);
        timeout.total = Some(total);
        self.timeout = Some(timeout);
        self
    }

    /// Override the redirect policy.
    #[must_use]
    pub fn redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = Some(redirect);
        self
    }

    /// Override status-error behavior.
    #[must_use]
    pub fn throw_http_errors(mut self, throw: bool) -> Self {
        self.throw_http_errors = Some(throw);
        self
    }

    /// Override the response size cap.
    #[must_use]
    pub fn max_response_size(mut self, max: u64) -> Self {
        self.max_response_size = Some(max);
        self
    }

    /// Attach an external cancellation handle.
    #[must_use]
    pub fn signal(mut self, token: CancelToken) -> Self {
        self.signal = Some(token);
        self
    }

    /// Per-request transport overrides.
    #[must_use]
    pub fn hints(mut self, hints: TransportHints) -> Self {
        self.hints = Some(hints);
        self
    }

    /// Override the cache strategy for this request.
    #[must_use]
    pub fn cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = Some(strategy);
        self
    }

    /// Opt this request out of dedup.
    #[must_use]
    pub fn no_dedup(mut self) -> Self {
        self.dedup_disabled = true;
        self
    }

    /// Observe upload progress.
    #[must_use]
    pub fn on_upload_progress(mut self, sink: ProgressSink) -> Self {
        self.on_upload_progress = Some(sink);
        self
    }

    /// Observe download progress.
    #[must_use]
    pub fn on_download_progress(mut self, sink: ProgressSink) -> Self {
        self.on_download_progress = Some(sink);
        self
    }

    /// Resolve into a [`Request`] without dispatching.
    pub fn build(self) -> Result<Request> {
        if let Some(err) = self.deferred_error {
            return Err(err);
        }
        let inner = &self.client.inner;
        let url = self.client.build_url(&self.path, &self.params)?;
        let mut req = Request::new(self.method, url);

        let mut headers = inner.default_headers.clone();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        *req.headers_mut() = headers;
        req.set_body(self.body);
        req.set_timeout(self.timeout.unwrap_or(inner.timeout));
        req.set_redirect(
            self.redirect.unwrap_or_else(|| inner.redirect.clone()),
        );
        req.set_throw_http_errors(
            self.throw_http_errors.unwrap_or(inner.throw_http_errors),
        );
        req.set_max_response_size(
            self.max_response_size.or(inner.max_response_size),
        );
        if let Some(signal) = self.signal {
            req.set_external_cancel(signal);
        }
        if let Some(hints) = self.hints {
            req.set_hints(Some(Arc::new(hints)));
        }
        if let Some(strategy) = self.cache_strategy {
            req.extensions_mut().insert(CacheStrategyOverride(strategy));
        }
        if self.dedup_disabled {
            req.extensions_mut().insert(crate::middleware::DedupDisabled);
        }
        req.set_on_upload_progress(self.on_upload_progress);
        req.set_on_download_progress(self.on_download_progress);
        Ok(req)
    }

    /// Build and dispatch.
    pub async fn send(self) -> Result<Response> {
        let client = self.client.clone();
        let req = self.build()?;
        client.send(req).await
    }
}
