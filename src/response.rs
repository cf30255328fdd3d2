//! The response type produced by the transport and decorated by middleware.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{Error, Result};

/// Granular phase timings for one dispatch.
///
/// Phases the wrapped HTTP client does not expose stay `None`; time to
/// first byte and total wall clock are always recorded unless
/// observability is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    /// DNS resolution
    pub dns: Option<Duration>,
    /// TCP connect
    pub connect: Option<Duration>,
    /// TLS handshake
    pub tls: Option<Duration>,
    /// Time to first byte of the response head
    pub ttfb: Option<Duration>,
    /// Total wall clock. Matches head completion until the body has been
    /// fully consumed; afterwards it covers the whole transfer.
    pub total: Option<Duration>,
}

/// Connection metadata attached to a response.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Negotiated protocol, e.g. `h2`
    pub protocol: Option<String>,
    /// Negotiated TLS cipher, when the transport exposes it
    pub cipher: Option<String>,
    /// Peer socket address
    pub remote_addr: Option<SocketAddr>,
}

/// One server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `id:` field, if sent
    pub id: Option<String>,
    /// `event:` field, if sent
    pub event: Option<String>,
    /// Concatenated `data:` lines joined with `\n`
    pub data: String,
    /// `retry:` field in milliseconds, if sent and numeric
    pub retry: Option<u64>,
}

/// The raw response chunk stream.
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + Sync>>;

enum ResponseBody {
    Buffered(Bytes),
    Stream(ChunkStream),
    Taken,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            Self::Stream(_) => write!(f, "Stream"),
            Self::Taken => write!(f, "Taken"),
        }
    }
}

/// An HTTP response with a lazy, single-consumption body.
///
/// The convenience accessors buffer the body in place, so they may be
/// called repeatedly once the first has resolved. The streaming accessors
/// ([`read`](Self::read), [`sse`](Self::sse), [`ndjson`](Self::ndjson))
/// take the body; afterwards buffering accessors fail.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    url: Url,
    headers: HeaderMap,
    version: Version,
    body: ResponseBody,
    timings: Timings,
    // Stamped by the transport's body instrumentation when the stream is
    // fully drained; merged into `timings().total`.
    total_cell: Option<Arc<OnceLock<Duration>>>,
    connection: ConnectionInfo,
    redirects: Vec<Url>,
    retry_count: u32,
}

impl Response {
    /// Assemble a response around a buffered body.
    #[must_use]
    pub fn new(
        status: StatusCode,
        url: Url,
        headers: HeaderMap,
        version: Version,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            url,
            headers,
            version,
            body: ResponseBody::Buffered(body),
            timings: Timings::default(),
            total_cell: None,
            connection: ConnectionInfo::default(),
            redirects: Vec::new(),
            retry_count: 0,
        }
    }

    /// Assemble a response around a chunk stream.
    #[must_use]
    pub fn from_stream(
        status: StatusCode,
        url: Url,
        headers: HeaderMap,
        version: Version,
        stream: ChunkStream,
    ) -> Self {
        Self {
            status,
            url,
            headers,
            version,
            body: ResponseBody::Stream(stream),
            timings: Timings::default(),
            total_cell: None,
            connection: ConnectionInfo::default(),
            redirects: Vec::new(),
            retry_count: 0,
        }
    }

    /// The response status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The canonical reason phrase for the status, when defined.
    #[must_use]
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    /// Whether the status is in the 2xx range.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// The final URL after redirects.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the response headers (cache decoration).
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// A single header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The negotiated HTTP version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Phase timings for the dispatch that produced this response.
    ///
    /// `total` is finalized once the body has been fully consumed (by any
    /// of the buffering accessors, or by draining the stream from
    /// [`read`](Self::read)); until then it reflects head completion.
    #[must_use]
    pub fn timings(&self) -> Timings {
        let mut timings = self.timings;
        if let Some(total) =
            self.total_cell.as_ref().and_then(|cell| cell.get())
        {
            timings.total = Some(*total);
        }
        timings
    }

    /// Set the timings (transport internal).
    pub fn set_timings(&mut self, timings: Timings) {
        self.timings = timings;
    }

    /// Attach the cell the body instrumentation stamps with end-to-end
    /// wall clock when the stream is fully drained.
    pub(crate) fn set_total_cell(&mut self, cell: Arc<OnceLock<Duration>>) {
        self.total_cell = Some(cell);
    }

    /// Connection metadata.
    #[must_use]
    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// Set the connection metadata (transport internal).
    pub fn set_connection(&mut self, connection: ConnectionInfo) {
        self.connection = connection;
    }

    /// The redirect chain followed, oldest hop first.
    #[must_use]
    pub fn redirects(&self) -> &[Url] {
        &self.redirects
    }

    /// Record the redirect chain (transport internal).
    pub fn set_redirects(&mut self, redirects: Vec<Url>) {
        self.redirects = redirects;
    }

    /// How many retry attempts preceded this response.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Record the retry count (retry middleware internal).
    pub fn set_retry_count(&mut self, count: u32) {
        self.retry_count = count;
    }

    /// Buffer the body and return it. Idempotent once buffered.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        match &mut self.body {
            ResponseBody::Buffered(bytes) => Ok(bytes.clone()),
            ResponseBody::Stream(stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                let bytes = buf.freeze();
                self.body = ResponseBody::Buffered(bytes.clone());
                Ok(bytes)
            }
            ResponseBody::Taken => {
                Err(Error::parse("body", "body already consumed"))
            }
        }
    }

    /// Buffer the body and decode it as UTF-8 text.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::parse("text", e))
    }

    /// Buffer the body and deserialize it as JSON.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| Error::parse("json", e))
    }

    /// Buffer the body and return it as an owned byte vector.
    pub async fn blob(&mut self) -> Result<Vec<u8>> {
        Ok(self.bytes().await?.to_vec())
    }

    /// Buffer the body and deserialize it as a URL-encoded form.
    pub async fn form<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_urlencoded::from_bytes(&bytes)
            .map_err(|e| Error::parse("form", e))
    }

    /// Take the raw chunk stream. A buffered body yields a single chunk.
    pub fn read(&mut self) -> Result<ChunkStream> {
        match std::mem::replace(&mut self.body, ResponseBody::Taken) {
            ResponseBody::Buffered(bytes) => {
                Ok(Box::pin(futures::stream::once(async move { Ok(bytes) })))
            }
            ResponseBody::Stream(stream) => Ok(stream),
            ResponseBody::Taken => {
                Err(Error::parse("body", "body already consumed"))
            }
        }
    }

    /// Consume the body as a lazy stream of server-sent events.
    pub fn sse(&mut self) -> Result<BoxStream<'static, Result<SseEvent>>> {
        let chunks = self.read()?;
        Ok(Box::pin(futures::stream::try_unfold(
            SseState { chunks, decoder: SseDecoder::default(), done: false },
            |mut state| async move {
                loop {
                    if let Some(event) = state.decoder.pop() {
                        return Ok(Some((event, state)));
                    }
                    if state.done {
                        return Ok(None);
                    }
                    match state.chunks.next().await {
                        Some(chunk) => state.decoder.push(&chunk?)?,
                        None => {
                            state.done = true;
                            state.decoder.flush();
                        }
                    }
                }
            },
        )))
    }

    /// Consume the body as a lazy stream of newline-delimited JSON records.
    pub fn ndjson<T: DeserializeOwned + Send + 'static>(
        &mut self,
    ) -> Result<BoxStream<'static, Result<T>>> {
        let chunks = self.read()?;
        Ok(Box::pin(futures::stream::try_unfold(
            NdjsonState { chunks, buf: String::new(), done: false },
            |mut state| async move {
                loop {
                    if let Some(line) = state.next_line() {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let record = serde_json::from_str::<T>(&line)
                            .map_err(|e| Error::parse("ndjson", e))?;
                        return Ok(Some((record, state)));
                    }
                    if state.done {
                        return Ok(None);
                    }
                    match state.chunks.next().await {
                        Some(chunk) => {
                            let chunk = chunk?;
                            let text = std::str::from_utf8(&chunk)
                                .map_err(|e| Error::parse("ndjson", e))?;
                            state.buf.push_str(text);
                        }
                        None => state.done = true,
                    }
                }
            },
        )))
    }

    /// Duplicate the response, teeing the body.
    ///
    /// The underlying stream is buffered eagerly; both this response and
    /// the returned clone hold the same bytes afterwards. Middlewares that
    /// inspect bodies (cache storage, dedup fan-out) clone before reading.
    pub async fn try_clone(&mut self) -> Result<Response> {
        let bytes = self.bytes().await?;
        Ok(Response {
            status: self.status,
            url: self.url.clone(),
            headers: self.headers.clone(),
            version: self.version,
            body: ResponseBody::Buffered(bytes),
            // Buffering above drained the stream, so the merged timings
            // already carry the finalized total.
            timings: self.timings(),
            total_cell: self.total_cell.clone(),
            connection: self.connection.clone(),
            redirects: self.redirects.clone(),
            retry_count: self.retry_count,
        })
    }
}

struct SseState {
    chunks: ChunkStream,
    decoder: SseDecoder,
    done: bool,
}

struct NdjsonState {
    chunks: ChunkStream,
    buf: String,
    done: bool,
}

impl NdjsonState {
    fn next_line(&mut self) -> Option<String> {
        if let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            return Some(line.trim_end_matches(['\n', '\r']).to_string());
        }
        if self.done && !self.buf.is_empty() {
            return Some(std::mem::take(&mut self.buf));
        }
        None
    }
}

/// Incremental decoder for the `text/event-stream` format.
#[derive(Default)]
struct SseDecoder {
    buf: String,
    pending: std::collections::VecDeque<SseEvent>,
    current: SseEvent,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<()> {
        let text =
            std::str::from_utf8(chunk).map_err(|e| Error::parse("sse", e))?;
        self.buf.push_str(text);
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.feed_line(line);
        }
        Ok(())
    }

    fn feed_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
            }
            "event" => self.current.event = Some(value.to_string()),
            "id" => self.current.id = Some(value.to_string()),
            "retry" => self.current.retry = value.parse().ok(),
            _ => {}
        }
    }

    fn dispatch(&mut self) {
        let event = std::mem::take(&mut self.current);
        if !event.data.is_empty() || event.event.is_some() {
            self.pending.push_back(event);
        }
    }

    fn flush(&mut self) {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.feed_line(line.trim_end_matches(['\n', '\r']));
        }
        self.dispatch();
    }

    fn pop(&mut self) -> Option<SseEvent> {
        self.pending.pop_front()
    }
}
