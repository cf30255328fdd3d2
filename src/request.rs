//! The request type carried through the middleware chain.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use http::{Extensions, HeaderMap, HeaderValue, Method};
use tokio::sync::watch;
use url::Url;

use crate::agent::TransportHints;
use crate::error::{Error, Result, TimeoutKind};
use crate::progress::ProgressSink;

/// Why a request's cancellation handle fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// Aborted through an external signal or explicit `cancel()`
    Cancelled,
    /// Aborted by the total-timeout timer
    TimedOut,
}

/// A cancellation handle shared between the caller and the pipeline.
///
/// Cloning yields another handle to the same underlying state. Aborting
/// wakes every in-flight wait; waiters in the request pool and runner
/// observe the signal before admission, admitted requests observe it at
/// the next suspension point inside the transport.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Option<AbortKind>>>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken").field("state", &self.state()).finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a new, un-fired token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Abort the request. Idempotent; the first abort wins.
    pub fn cancel(&self) {
        self.fire(AbortKind::Cancelled);
    }

    pub(crate) fn fire(&self, kind: AbortKind) {
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(kind);
                true
            } else {
                false
            }
        });
    }

    /// The abort state, if the token has fired.
    #[must_use]
    pub fn state(&self) -> Option<AbortKind> {
        *self.tx.borrow()
    }

    /// Whether the token has fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state().is_some()
    }

    /// Resolves once the token fires. If it already fired, resolves
    /// immediately.
    pub async fn aborted(&self) -> AbortKind {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(kind) = *rx.borrow_and_update() {
                return kind;
            }
            if rx.changed().await.is_err() {
                // Sender kept alive by self; unreachable in practice.
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Map the abort state to the pipeline error it surfaces as.
    pub(crate) fn abort_error(kind: AbortKind, elapsed: Duration) -> Error {
        match kind {
            AbortKind::Cancelled => Error::Cancelled,
            AbortKind::TimedOut => {
                Error::Timeout { kind: TimeoutKind::Total, elapsed }
            }
        }
    }
}

/// The four timeout dials, all optional, in wall-clock milliseconds when
/// built from client configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Socket connect (including TLS handshake)
    pub connect: Option<Duration>,
    /// Time to first byte of the response head
    pub headers: Option<Duration>,
    /// Per-read inactivity while streaming the body
    pub body: Option<Duration>,
    /// Total wall clock for the dispatch, redirects included
    pub total: Option<Duration>,
}

/// What a `before_redirect` hook decided.
#[derive(Debug, Clone)]
pub enum RedirectDecision {
    /// Follow the redirect as proposed
    Follow,
    /// Stop following; surface the 3xx response to the caller
    Stop,
    /// Follow, but to this URL instead of the proposed one
    Rewrite(String),
}

/// Hook invoked on each redirect hop with `(from, to, status)`.
pub type RedirectHook =
    Arc<dyn Fn(&Url, &Url, u16) -> RedirectDecision + Send + Sync>;

/// Redirect behavior for a request.
#[derive(Clone, Default)]
pub struct RedirectPolicy {
    /// Whether redirects are followed at all. Defaults to true.
    pub follow: bool,
    /// Maximum hops before the transport fails with a network error.
    pub max_redirects: usize,
    /// Optional per-hop veto/rewrite hook.
    pub before_redirect: Option<RedirectHook>,
}

impl fmt::Debug for RedirectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedirectPolicy")
            .field("follow", &self.follow)
            .field("max_redirects", &self.max_redirects)
            .field("before_redirect", &self.before_redirect.is_some())
            .finish()
    }
}

impl RedirectPolicy {
    /// The default policy: follow up to 10 hops.
    #[must_use]
    pub fn standard() -> Self {
        Self { follow: true, max_redirects: 10, before_redirect: None }
    }

    /// Never follow redirects.
    #[must_use]
    pub fn none() -> Self {
        Self { follow: false, max_redirects: 0, before_redirect: None }
    }
}

/// One part of a multipart request body.
#[derive(Debug, Clone)]
pub struct Part {
    /// Form field name
    pub name: String,
    /// Optional file name for the `Content-Disposition` header
    pub file_name: Option<String>,
    /// Optional part content type
    pub content_type: Option<String>,
    /// Part payload
    pub data: Bytes,
}

/// A streaming body producer. Single-shot; requests carrying one cannot be
/// cloned for retry, dedup, or redirect replay.
pub type BodyStream =
    Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + Sync>>;

/// The request body shapes the pipeline understands.
pub enum Body {
    /// No body
    Empty,
    /// Raw bytes, `application/octet-stream` unless a type is set
    Bytes(Bytes),
    /// UTF-8 text, `text/plain; charset=utf-8` unless a type is set
    Text(String),
    /// URL-encoded form pairs, `application/x-www-form-urlencoded`
    Form(Vec<(String, String)>),
    /// Multipart form with a generated boundary
    Multipart {
        /// The boundary token used between parts
        boundary: String,
        /// The parts in emission order
        parts: Vec<Part>,
    },
    /// A one-shot streaming producer with an optional known length
    Stream {
        /// The chunk stream; taken by the transport at dispatch
        stream: BodyStream,
        /// Known total length, used for upload progress totals
        len: Option<u64>,
    },
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Body::Empty"),
            Self::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Self::Text(t) => write!(f, "Body::Text({} chars)", t.len()),
            Self::Form(pairs) => write!(f, "Body::Form({} pairs)", pairs.len()),
            Self::Multipart { parts, .. } => {
                write!(f, "Body::Multipart({} parts)", parts.len())
            }
            Self::Stream { len, .. } => write!(f, "Body::Stream(len={len:?})"),
        }
    }
}

impl Body {
    /// Generate a multipart body with a random boundary.
    #[must_use]
    pub fn multipart(parts: Vec<Part>) -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let tail: String =
            (0..24).map(|_| rng.random_range('a'..='z')).collect();
        Self::Multipart { boundary: format!("pipeline-{tail}"), parts }
    }

    /// Whether this body shape can be duplicated for replay.
    #[must_use]
    pub fn is_cloneable(&self) -> bool {
        !matches!(self, Self::Stream { .. })
    }

    /// Whether there is any payload at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(b) => b.is_empty(),
            Self::Text(t) => t.is_empty(),
            Self::Form(p) => p.is_empty(),
            Self::Multipart { parts, .. } => parts.is_empty(),
            Self::Stream { .. } => false,
        }
    }

    /// The `Content-Type` implied by the body shape, if any.
    #[must_use]
    pub fn implied_content_type(&self) -> Option<String> {
        match self {
            Self::Empty | Self::Stream { .. } => None,
            Self::Bytes(_) => Some("application/octet-stream".into()),
            Self::Text(_) => Some("text/plain; charset=utf-8".into()),
            Self::Form(_) => Some("application/x-www-form-urlencoded".into()),
            Self::Multipart { boundary, .. } => {
                Some(format!("multipart/form-data; boundary={boundary}"))
            }
        }
    }

    /// Serialize the body to bytes, if it is a buffered shape.
    ///
    /// Returns `None` for streaming bodies; used for fingerprint body
    /// hashes and replay.
    pub fn to_bytes(&self) -> Option<Result<Bytes>> {
        match self {
            Self::Empty => Some(Ok(Bytes::new())),
            Self::Bytes(b) => Some(Ok(b.clone())),
            Self::Text(t) => Some(Ok(Bytes::copy_from_slice(t.as_bytes()))),
            Self::Form(pairs) => Some(
                serde_urlencoded::to_string(pairs)
                    .map(Bytes::from)
                    .map_err(|e| Error::parse("form", e)),
            ),
            Self::Multipart { boundary, parts } => {
                Some(Ok(encode_multipart(boundary, parts)))
            }
            Self::Stream { .. } => None,
        }
    }

    /// Known content length, when the shape allows computing one cheaply.
    #[must_use]
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Bytes(b) => Some(b.len() as u64),
            Self::Text(t) => Some(t.len() as u64),
            Self::Stream { len, .. } => *len,
            Self::Form(_) | Self::Multipart { .. } => None,
        }
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(match self {
            Self::Empty => Self::Empty,
            Self::Bytes(b) => Self::Bytes(b.clone()),
            Self::Text(t) => Self::Text(t.clone()),
            Self::Form(p) => Self::Form(p.clone()),
            Self::Multipart { boundary, parts } => Self::Multipart {
                boundary: boundary.clone(),
                parts: parts.clone(),
            },
            Self::Stream { .. } => return Err(Error::BodyNotCloneable),
        })
    }
}

fn encode_multipart(boundary: &str, parts: &[Part]) -> Bytes {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        let mut disposition =
            format!("Content-Disposition: form-data; name=\"{}\"", part.name);
        if let Some(file_name) = &part.file_name {
            disposition.push_str(&format!("; filename=\"{file_name}\""));
        }
        disposition.push_str("\r\n");
        out.extend_from_slice(disposition.as_bytes());
        if let Some(content_type) = &part.content_type {
            out.extend_from_slice(
                format!("Content-Type: {content_type}\r\n").as_bytes(),
            );
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&part.data);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Bytes::from(out)
}

/// A request travelling down the middleware chain.
///
/// The URL is absolute before the first middleware sees it. Requests are
/// mutated only by hooks that return a replacement and by the transport
/// internals (conditional headers, cookie injection).
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Body,
    timeout: TimeoutPolicy,
    redirect: RedirectPolicy,
    throw_http_errors: bool,
    max_response_size: Option<u64>,
    cancel: CancelToken,
    external_cancel: Option<CancelToken>,
    on_upload_progress: Option<ProgressSink>,
    on_download_progress: Option<ProgressSink>,
    hints: Option<Arc<TransportHints>>,
    extensions: Extensions,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Create a request for an absolute URL with default policies.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::Empty,
            timeout: TimeoutPolicy::default(),
            redirect: RedirectPolicy::standard(),
            throw_http_errors: true,
            max_response_size: None,
            cancel: CancelToken::new(),
            external_cancel: None,
            on_upload_progress: None,
            on_download_progress: None,
            hints: None,
            extensions: Extensions::new(),
        }
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The absolute request URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Mutable access to the URL, used by the transport's redirect loop.
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// The request headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// A single header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set a header, replacing existing values.
    pub fn set_header(
        &mut self,
        name: http::header::HeaderName,
        value: HeaderValue,
    ) {
        self.headers.insert(name, value);
    }

    /// The request body.
    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Take the body out, leaving [`Body::Empty`] behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::replace(&mut self.body, Body::Empty)
    }

    /// The timeout dials for this request.
    #[must_use]
    pub fn timeout(&self) -> &TimeoutPolicy {
        &self.timeout
    }

    /// Replace the timeout dials.
    pub fn set_timeout(&mut self, timeout: TimeoutPolicy) {
        self.timeout = timeout;
    }

    /// The redirect policy for this request.
    #[must_use]
    pub fn redirect(&self) -> &RedirectPolicy {
        &self.redirect
    }

    /// Replace the redirect policy.
    pub fn set_redirect(&mut self, redirect: RedirectPolicy) {
        self.redirect = redirect;
    }

    /// Whether 4xx/5xx statuses surface as [`Error::HttpStatus`].
    #[must_use]
    pub fn throw_http_errors(&self) -> bool {
        self.throw_http_errors
    }

    /// Toggle status-error behavior (the cache middleware disables it for
    /// conditional revalidation so a `304` survives the status check).
    pub fn set_throw_http_errors(&mut self, throw: bool) {
        self.throw_http_errors = throw;
    }

    /// Maximum response size in bytes, inclusive.
    #[must_use]
    pub fn max_response_size(&self) -> Option<u64> {
        self.max_response_size
    }

    /// Set the maximum response size.
    pub fn set_max_response_size(&mut self, max: Option<u64>) {
        self.max_response_size = max;
    }

    /// The internal cancellation handle.
    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Attach an external cancellation handle. Aborting it aborts this
    /// request as if its own handle fired.
    pub fn set_external_cancel(&mut self, token: CancelToken) {
        self.external_cancel = Some(token);
    }

    /// Resolves when either the internal or external handle fires.
    pub async fn aborted(&self) -> AbortKind {
        match &self.external_cancel {
            Some(external) => tokio::select! {
                kind = self.cancel.aborted() => kind,
                kind = external.aborted() => kind,
            },
            None => self.cancel.aborted().await,
        }
    }

    /// An owned future resolving when either handle fires; usable from
    /// spawned tasks and body wrappers that outlive the dispatch call.
    #[must_use]
    pub fn abort_signal(
        &self,
    ) -> impl std::future::Future<Output = AbortKind> + Send + 'static {
        let internal = self.cancel.clone();
        let external = self.external_cancel.clone();
        async move {
            match external {
                Some(external) => tokio::select! {
                    kind = internal.aborted() => kind,
                    kind = external.aborted() => kind,
                },
                None => internal.aborted().await,
            }
        }
    }

    /// Non-blocking abort check.
    #[must_use]
    pub fn abort_state(&self) -> Option<AbortKind> {
        self.cancel
            .state()
            .or_else(|| self.external_cancel.as_ref().and_then(CancelToken::state))
    }

    /// Upload progress sink, if any.
    #[must_use]
    pub fn on_upload_progress(&self) -> Option<&ProgressSink> {
        self.on_upload_progress.as_ref()
    }

    /// Set the upload progress sink.
    pub fn set_on_upload_progress(&mut self, sink: Option<ProgressSink>) {
        self.on_upload_progress = sink;
    }

    /// Download progress sink, if any.
    #[must_use]
    pub fn on_download_progress(&self) -> Option<&ProgressSink> {
        self.on_download_progress.as_ref()
    }

    /// Set the download progress sink.
    pub fn set_on_download_progress(&mut self, sink: Option<ProgressSink>) {
        self.on_download_progress = sink;
    }

    /// Per-request transport overrides (HTTP/2, TLS, proxy, DNS).
    #[must_use]
    pub fn hints(&self) -> Option<&Arc<TransportHints>> {
        self.hints.as_ref()
    }

    /// Set per-request transport overrides.
    pub fn set_hints(&mut self, hints: Option<Arc<TransportHints>>) {
        self.hints = hints;
    }

    /// Typed per-request extensions for middleware coordination.
    #[must_use]
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Mutable access to the extensions.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Duplicate the request for replay (retry, dedup, revalidation).
    ///
    /// Fails with [`Error::BodyNotCloneable`] when the body is a one-shot
    /// stream. The clone shares the cancellation handles and progress sinks.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
            timeout: self.timeout,
            redirect: self.redirect.clone(),
            throw_http_errors: self.throw_http_errors,
            max_response_size: self.max_response_size,
            cancel: self.cancel.clone(),
            external_cancel: self.external_cancel.clone(),
            on_upload_progress: self.on_upload_progress.clone(),
            on_download_progress: self.on_download_progress.clone(),
            hints: self.hints.clone(),
            extensions: self.extensions.clone(),
        })
    }
}
