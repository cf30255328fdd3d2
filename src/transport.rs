//! The terminal transport: wraps the system HTTP client, enforces the
//! redirect policy and timeout dials, applies cookies, instruments
//! progress, and enforces the response size cap.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::Either;
use futures::{Stream, StreamExt};
use http::header::{
    CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION,
};
use http::{HeaderValue, Method};
use url::Url;

use crate::agent::AgentManager;
use crate::cookies::CookieJar;
use crate::error::{Error, Result, TimeoutKind};
use crate::progress::{Direction, ProgressMeter, ProgressSink};
use crate::request::{
    AbortKind, Body, BodyStream, CancelToken, RedirectDecision, Request,
};
use crate::response::{ChunkStream, ConnectionInfo, Response, Timings};

const UPLOAD_CHUNK: usize = 16 * 1024;

enum Outgoing {
    None,
    Bytes(Bytes),
    Stream { stream: Option<BodyStream>, len: Option<u64> },
}

/// Terminal dispatcher. One request in, one response out.
pub struct Transport {
    agents: AgentManager,
    jar: Option<Arc<CookieJar>>,
    record_timings: bool,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("cookies", &self.jar.is_some())
            .field("record_timings", &self.record_timings)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Create a transport over the given pools, optionally sharing a
    /// cookie jar.
    #[must_use]
    pub fn new(agents: AgentManager, jar: Option<Arc<CookieJar>>) -> Self {
        Self { agents, jar, record_timings: true }
    }

    /// Toggle timing/connection observability.
    #[must_use]
    pub fn with_observability(mut self, enabled: bool) -> Self {
        self.record_timings = enabled;
        self
    }

    /// The shared cookie jar, when one is configured.
    #[must_use]
    pub fn cookie_jar(&self) -> Option<&Arc<CookieJar>> {
        self.jar.as_ref()
    }

    /// The connection pool manager.
    #[must_use]
    pub fn agents(&self) -> &AgentManager {
        &self.agents
    }

    /// Dispatch one request and produce a response with a lazy body.
    pub async fn dispatch(&self, mut req: Request) -> Result<Response> {
        let started = Instant::now();
        if let Some(kind) = req.abort_state() {
            return Err(CancelToken::abort_error(kind, Duration::ZERO));
        }
        // The total dial arms a timer that fires the cancellation handle,
        // so a still-streaming body is cut off too.
        if let Some(total) = req.timeout().total {
            let token = req.cancel_token().clone();
            tokio::spawn(async move {
                tokio::time::sleep(total).await;
                token.fire(AbortKind::TimedOut);
            });
        }
        let abort = req.abort_signal();
        futures::pin_mut!(abort);
        let inner = self.dispatch_hops(&mut req, started);
        futures::pin_mut!(inner);
        match futures::future::select(inner, abort).await {
            Either::Left((result, _)) => result,
            Either::Right((kind, _)) => {
                Err(CancelToken::abort_error(kind, started.elapsed()))
            }
        }
    }

    async fn dispatch_hops(
        &self,
        req: &mut Request,
        started: Instant,
    ) -> Result<Response> {
        let client = self
            .agents
            .for_url(req.url(), req.hints().map(Arc::as_ref))?;

        let implied_content_type = req.body().implied_content_type();
        let mut outgoing = match req.take_body() {
            Body::Stream { stream, len } => {
                Outgoing::Stream { stream: Some(stream), len }
            }
            body => match body.to_bytes() {
                Some(bytes) => {
                    let bytes = bytes?;
                    if bytes.is_empty() {
                        Outgoing::None
                    } else {
                        Outgoing::Bytes(bytes)
                    }
                }
                None => Outgoing::None,
            },
        };

        let policy = req.redirect().clone();
        let headers_timeout = req.timeout().headers;
        let mut hops: Vec<Url> = Vec::new();
        let mut method = req.method().clone();
        let mut url = req.url().clone();
        let mut body_stripped = false;

        let upstream = loop {
            let mut headers = req.headers().clone();
            if body_stripped {
                headers.remove(CONTENT_TYPE);
                headers.remove(CONTENT_LENGTH);
                headers.remove(CONTENT_ENCODING);
            } else if !headers.contains_key(CONTENT_TYPE) {
                if let Some(content_type) = &implied_content_type {
                    if let Ok(value) = HeaderValue::from_str(content_type) {
                        headers.insert(CONTENT_TYPE, value);
                    }
                }
            }
            if let Some(jar) = &self.jar {
                if let Some(cookie_header) = jar.header_for_url(&url) {
                    headers.insert(
                        COOKIE,
                        HeaderValue::from_str(&cookie_header)?,
                    );
                }
            }

            let mut builder =
                client.request(method.clone(), url.clone()).headers(headers);
            if !body_stripped {
                builder = attach_body(
                    builder,
                    &mut outgoing,
                    req.on_upload_progress().cloned(),
                )?;
            }

            let send = builder.send();
            let response = match headers_timeout {
                Some(dial) => match tokio::time::timeout(dial, send).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(Error::Timeout {
                            kind: TimeoutKind::Headers,
                            elapsed: started.elapsed(),
                        })
                    }
                },
                None => send.await,
            }
            .map_err(map_send_error)?;

            if let Some(jar) = &self.jar {
                jar.store_from_response(&url, response.headers());
            }

            let status = response.status();
            let is_redirect =
                matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308);
            if !is_redirect || !policy.follow {
                break response;
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let Some(location) = location else { break response };
            if hops.len() >= policy.max_redirects {
                return Err(Error::network(format!(
                    "maximum redirects ({}) exceeded",
                    policy.max_redirects
                )));
            }
            let mut target = url.join(&location)?;
            if let Some(hook) = &policy.before_redirect {
                match hook(&url, &target, status.as_u16()) {
                    RedirectDecision::Follow => {}
                    RedirectDecision::Stop => break response,
                    RedirectDecision::Rewrite(replacement) => {
                        target = url.join(&replacement)?;
                    }
                }
            }
            match status.as_u16() {
                // 303 always degrades to a bodyless GET.
                303 => {
                    method = Method::GET;
                    outgoing = Outgoing::None;
                    body_stripped = true;
                }
                // Legacy practice: keep the method, drop the body.
                301 | 302 => {
                    if method != Method::GET && method != Method::HEAD {
                        outgoing = Outgoing::None;
                        body_stripped = true;
                    }
                }
                // 307/308 replay method and body; a consumed one-shot
                // stream cannot be replayed.
                _ => {
                    if matches!(
                        outgoing,
                        Outgoing::Stream { stream: None, .. }
                    ) {
                        return Err(Error::BodyNotCloneable);
                    }
                }
            }
            log::debug!("redirect {} {url} -> {target}", status.as_u16());
            hops.push(url.clone());
            url = target;
        };

        let ttfb = started.elapsed();
        let status = upstream.status();
        let declared = upstream
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let (Some(max), Some(declared)) =
            (req.max_response_size(), declared)
        {
            // Fail before any body byte is read.
            if declared > max {
                return Err(Error::MaxSizeExceeded {
                    max_size: max,
                    actual_size: declared,
                });
            }
        }

        let response_headers = upstream.headers().clone();
        let version = upstream.version();
        let remote_addr = upstream.remote_addr();
        let final_url = upstream.url().clone();
        let total_cell = self
            .record_timings
            .then(|| Arc::new(OnceLock::<Duration>::new()));
        let body = instrument_body(
            upstream.bytes_stream(),
            req.max_response_size(),
            declared,
            req.on_download_progress().cloned(),
            req.timeout().body,
            req.cancel_token().clone(),
            started,
            total_cell.clone(),
        );

        let mut response = Response::from_stream(
            status,
            final_url,
            response_headers,
            version,
            body,
        );
        response.set_redirects(hops);
        if self.record_timings {
            response.set_timings(Timings {
                dns: None,
                connect: None,
                tls: None,
                ttfb: Some(ttfb),
                // Baseline until the body is drained and the cell stamps
                // the end-to-end time.
                total: Some(ttfb),
            });
            response.set_connection(ConnectionInfo {
                protocol: Some(format!("{version:?}")),
                cipher: None,
                remote_addr,
            });
            if let Some(cell) = total_cell {
                response.set_total_cell(cell);
            }
        }
        Ok(response)
    }
}

fn attach_body(
    builder: reqwest::RequestBuilder,
    outgoing: &mut Outgoing,
    progress: Option<ProgressSink>,
) -> Result<reqwest::RequestBuilder> {
    Ok(match outgoing {
        Outgoing::None => builder,
        Outgoing::Bytes(bytes) => match progress {
            Some(sink) => builder
                .body(reqwest::Body::wrap_stream(chunked_upload(
                    bytes.clone(),
                    sink,
                )))
                .header(CONTENT_LENGTH, bytes.len()),
            None => builder.body(bytes.clone()),
        },
        Outgoing::Stream { stream, len } => {
            let stream =
                stream.take().ok_or(Error::BodyNotCloneable)?;
            let instrumented: BodyStream = match progress {
                Some(sink) => {
                    let mut meter =
                        ProgressMeter::new(sink, Direction::Upload, *len);
                    Box::pin(stream.map(move |item| {
                        if let Ok(chunk) = &item {
                            meter.record(chunk.len());
                        } else {
                            meter.finish();
                        }
                        item
                    }))
                }
                None => stream,
            };
            builder.body(reqwest::Body::wrap_stream(instrumented))
        }
    })
}

fn chunked_upload(
    bytes: Bytes,
    sink: ProgressSink,
) -> impl Stream<Item = Result<Bytes>> + Send {
    let total = bytes.len() as u64;
    let meter = ProgressMeter::new(sink, Direction::Upload, Some(total));
    futures::stream::unfold(
        (bytes, 0usize, meter),
        |(bytes, offset, mut meter)| async move {
            if offset >= bytes.len() {
                meter.finish();
                return None;
            }
            let end = (offset + UPLOAD_CHUNK).min(bytes.len());
            let chunk = bytes.slice(offset..end);
            meter.record(chunk.len());
            Some((Ok(chunk), (bytes, end, meter)))
        },
    )
}

#[allow(clippy::too_many_arguments)]
fn instrument_body(
    upstream: impl Stream<Item = reqwest::Result<Bytes>> + Send + Sync + 'static,
    max_size: Option<u64>,
    declared: Option<u64>,
    progress: Option<ProgressSink>,
    body_timeout: Option<Duration>,
    cancel: CancelToken,
    started: Instant,
    total_cell: Option<Arc<OnceLock<Duration>>>,
) -> ChunkStream {
    let meter = progress
        .map(|sink| ProgressMeter::new(sink, Direction::Download, declared));
    let state = (Box::pin(upstream), meter, 0u64);
    Box::pin(futures::stream::try_unfold(
        state,
        move |(mut stream, mut meter, mut seen)| {
            let cancel = cancel.clone();
            let total_cell = total_cell.clone();
            async move {
                let next = async {
                    match body_timeout {
                        Some(dial) => {
                            match tokio::time::timeout(dial, stream.next())
                                .await
                            {
                                Ok(item) => Ok(item),
                                Err(_) => Err(Error::Timeout {
                                    kind: TimeoutKind::Body,
                                    elapsed: dial,
                                }),
                            }
                        }
                        None => Ok(stream.next().await),
                    }
                };
                let item = tokio::select! {
                    biased;
                    kind = cancel.aborted() => {
                        return Err(CancelToken::abort_error(
                            kind,
                            Duration::ZERO,
                        ));
                    }
                    item = next => item?,
                };
                match item {
                    None => {
                        if let Some(meter) = meter.as_mut() {
                            meter.finish();
                        }
                        if let Some(cell) = &total_cell {
                            let _ = cell.set(started.elapsed());
                        }
                        Ok(None)
                    }
                    Some(Err(err)) => Err(Error::from(err)),
                    Some(Ok(chunk)) => {
                        seen += chunk.len() as u64;
                        if let Some(max) = max_size {
                            // Best-effort enforcement when no length was
                            // declared up front.
                            if seen > max {
                                return Err(Error::MaxSizeExceeded {
                                    max_size: max,
                                    actual_size: seen,
                                });
                            }
                        }
                        if let Some(meter) = meter.as_mut() {
                            meter.record(chunk.len());
                        }
                        Ok(Some((chunk, (stream, meter, seen))))
                    }
                }
            }
        },
    ))
}

fn map_send_error(err: reqwest::Error) -> Error {
    if err.is_connect() {
        if err.is_timeout() {
            Error::Timeout {
                kind: TimeoutKind::Connect,
                elapsed: Duration::ZERO,
            }
        } else {
            Error::Network {
                message: "connection failed".into(),
                source: Some(Box::new(err)),
            }
        }
    } else if err.is_timeout() {
        Error::Timeout { kind: TimeoutKind::Headers, elapsed: Duration::ZERO }
    } else {
        Error::Network { message: err.to_string(), source: Some(Box::new(err)) }
    }
}
