#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! An HTTP client runtime built around a composable middleware pipeline.
//!
//! The pipeline wraps a connection-pooled transport and is governed by a
//! layered concurrency controller (global in-flight cap, token-bucket rate
//! limiting, per-batch dispatch cap, per-domain connection pools). On top
//! of it sit an RFC 7234 cache with conditional revalidation and
//! stale-while-revalidate, request deduplication, retry with backoff, an
//! RFC 6265 cookie jar, and progress-instrumented streaming bodies.
//!
//! ## Basic usage
//!
//! ```no_run
//! use http_pipeline::{CacheConfig, Client, MemoryStorage};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> http_pipeline::Result<()> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")?
//!         .cache(CacheConfig::default(), Arc::new(MemoryStorage::default()))
//!         .retry(Default::default())
//!         .concurrency(16)
//!         .build()?;
//!
//!     let mut response = client.get("/users/:id").param("id", 42).send().await?;
//!     let user: serde_json::Value = response.json().await?;
//!     println!("{user}");
//!     Ok(())
//! }
//! ```
//!
//! ## Middleware
//!
//! Every stage implements [`Middleware`]: it receives the request and an
//! owned [`Next`] cursor over the remainder of the chain. The composed
//! order is fixed (logger, request pool, dedup, retry, cache, compression,
//! xsrf, user middlewares, hooks, status check, transport), and user
//! middlewares can be appended after construction with
//! [`Client::use_middleware`], which swaps the composed chain atomically.
//!
//! ```no_run
//! use http_pipeline::{Client, Middleware, Next, Request, Response};
//! use std::sync::Arc;
//!
//! struct Trace;
//!
//! #[async_trait::async_trait]
//! impl Middleware for Trace {
//!     async fn handle(
//!         &self,
//!         req: Request,
//!         next: Next,
//!     ) -> http_pipeline::Result<Response> {
//!         log::info!("dispatching {}", req.url());
//!         next.run(req).await
//!     }
//! }
//!
//! # fn main() -> http_pipeline::Result<()> {
//! let client = Client::builder().with(Arc::new(Trace)).build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Caching
//!
//! The cache middleware implements RFC 7234 request/response directives,
//! Vary-aware keying, conditional revalidation, and the `X-Cache` /
//! `X-Cache-Age` / `Warning` advertisement headers. Storage backends
//! implement [`CacheStorage`]; an accounting in-memory store and (behind
//! the `store-disk` feature) a `cacache`-backed disk store are provided.
//!
//! ## Features
//!
//! - `store-disk` (default): the [`DiskStorage`] backend on
//!   [cacache](https://github.com/zkat/cacache-rs).
//! - `store-moka` (disabled): a [`MokaStorage`] backend on
//!   [moka](https://github.com/moka-rs/moka).

pub mod agent;
pub mod cache;
pub mod client;
pub mod cookies;
mod error;
pub mod middleware;
pub mod pool;
pub mod progress;
pub mod proxy;
pub mod request;
pub mod response;
pub mod runner;
pub mod transport;

#[cfg(test)]
mod test;

pub use agent::{
    AgentConfig, AgentManager, DnsConfig, Http2Config, TlsConfig, TlsVersion,
    TransportHints,
};
pub use cache::storage::memory::{
    EvictionPolicy, MemoryLimit, MemoryStorage, MemoryStorageConfig,
};
#[cfg(feature = "store-disk")]
pub use cache::storage::disk::DiskStorage;
#[cfg(feature = "store-moka")]
pub use cache::storage::moka::MokaStorage;
pub use cache::storage::{CacheEntry, CacheStorage};
pub use cache::{
    CacheConfig, CacheMiddleware, CacheStrategy, CacheTag, WARNING, XCACHE,
    XCACHE_AGE,
};
pub use client::{
    AfterResponseHook, BeforeRequestHook, Client, ClientBuilder,
    ConcurrencyConfig, NextPageFn, OnErrorHook, RequestBuilder,
};
pub use cookies::{Cookie, CookieJar, SameSite};
pub use error::{Error, Result, TimeoutKind};
pub use middleware::{
    CompressionConfig, CompressionMiddleware, DedupConfig, DedupMiddleware,
    LoggerMiddleware, Middleware, Next, RetryConfig, RetryEvent,
    RetryMiddleware, XsrfConfig, XsrfMiddleware,
};
pub use pool::{PoolConfig, RequestPoolMiddleware};
pub use progress::{Direction, ProgressEvent, ProgressSink};
pub use proxy::{ProxyConfig, ProxySelector};
pub use request::{
    AbortKind, Body, CancelToken, Part, RedirectDecision, RedirectPolicy,
    Request, TimeoutPolicy,
};
pub use response::{Response, SseEvent, Timings};
pub use runner::{
    BatchOutcome, RequestRunner, RunnerConfig, RunnerEvent, RunnerStats,
};
pub use transport::Transport;
