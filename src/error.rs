use std::time::Duration;

use thiserror::Error;
use url::Url;

/// A `Result` typedef to use with the [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The timeout dial that expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Establishing the TCP connection (and TLS handshake) took too long
    Connect,
    /// The response head (status line + headers) did not arrive in time
    Headers,
    /// No body bytes arrived within the per-read inactivity window
    Body,
    /// Total wall clock for the request expired
    Total,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Headers => write!(f, "headers"),
            Self::Body => write!(f, "body"),
            Self::Total => write!(f, "request"),
        }
    }
}

/// A typed error for the request pipeline.
///
/// Middlewares let errors flow unless they explicitly recover: the retry
/// middleware re-invokes the chain on retriable kinds, the cache middleware
/// may substitute a stale response, and `on_error` hooks may supply a
/// fallback response. Everything else re-throws.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection refused, DNS failure, TLS failure, connection reset
    #[error("network error: {message}")]
    Network {
        /// Human readable description of the failure
        message: String,
        /// Underlying transport error, when one exists
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// One of the four timeout dials expired
    #[error("{kind} timeout after {elapsed:?}")]
    Timeout {
        /// Which dial expired
        kind: TimeoutKind,
        /// Wall clock elapsed when the timer fired
        elapsed: Duration,
    },

    /// The request was aborted through its cancellation handle
    #[error("request cancelled")]
    Cancelled,

    /// Status >= 400 with `throw_http_errors` enabled; carries the response
    #[error("HTTP status {status} for {url}")]
    HttpStatus {
        /// The response status code
        status: u16,
        /// The request URL that produced the status
        url: Url,
        /// The full response, body unconsumed
        response: Box<crate::response::Response>,
    },

    /// Declared or observed response size exceeds `max_response_size`
    #[error("response size {actual_size} exceeds maximum of {max_size} bytes")]
    MaxSizeExceeded {
        /// The configured limit, inclusive
        max_size: u64,
        /// The declared `Content-Length`, or bytes observed so far
        actual_size: u64,
    },

    /// Body decode failure in a convenience accessor (JSON/SSE/NDJSON/form)
    #[error("{what} parse error: {message}")]
    Parse {
        /// What was being decoded
        what: &'static str,
        /// Decoder failure detail
        message: String,
    },

    /// A feature the transport cannot provide (e.g. SOCKS proxies)
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An external asset fetch failed
    #[error("download failed: {0}")]
    Download(String),

    /// The request body is a one-shot stream and cannot be replayed
    #[error("request body is not cloneable; streaming bodies are single-shot")]
    BodyNotCloneable,

    /// Cache storage backend failure
    #[error("cache storage error: {0}")]
    Storage(String),

    /// Invalid configuration detected at build time
    #[error("invalid configuration: {0}")]
    Config(String),

    /// There was an error parsing a URL
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    /// Error from the `http` types
    #[error(transparent)]
    Http(#[from] http::Error),

    /// There was an error converting a header value to a string
    #[error(transparent)]
    HeaderToStr(#[from] http::header::ToStrError),

    /// There was an error parsing an HTTP header value
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// There was an error parsing an HTTP header name
    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
}

impl Error {
    /// Shorthand for a [`Error::Network`] without an underlying source
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into(), source: None }
    }

    /// Shorthand for a [`Error::Parse`]
    pub fn parse(what: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Parse { what, message: message.to_string() }
    }

    /// Whether the retry middleware considers this error retriable by default.
    ///
    /// Network and timeout failures are; cancellation, size violations, and
    /// configuration errors never are. Status errors are judged by the retry
    /// policy's status list instead.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }

    /// The status code carried by an [`Error::HttpStatus`], if that is what
    /// this error is.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                kind: TimeoutKind::Total,
                elapsed: Duration::ZERO,
            }
        } else if err.is_connect() {
            Self::Network {
                message: "connection failed".into(),
                source: Some(Box::new(err)),
            }
        } else {
            Self::Network { message: err.to_string(), source: Some(Box::new(err)) }
        }
    }
}
