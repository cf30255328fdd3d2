//! Request deduplication: concurrent identical requests share one
//! upstream dispatch.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use crate::cache::fingerprint::fingerprint;
use crate::error::{Error, Result};
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::{ConnectionInfo, Response, Timings};

/// Custom key generator for dedup.
pub type DedupKeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Dedup configuration.
#[derive(Clone, Default)]
pub struct DedupConfig {
    /// Override the fingerprint-based key.
    pub key_generator: Option<DedupKeyFn>,
}

impl std::fmt::Debug for DedupConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupConfig")
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

/// Marker extension disabling dedup for one request.
#[derive(Debug, Clone, Copy)]
pub struct DedupDisabled;

// The payload every joined caller receives; each builds its own response
// around a cheap clone of the shared body bytes.
#[derive(Clone)]
struct SharedResponse {
    status: StatusCode,
    url: Url,
    headers: HeaderMap,
    version: Version,
    body: Bytes,
    timings: Timings,
    connection: ConnectionInfo,
    redirects: Vec<Url>,
}

type InFlight =
    Shared<BoxFuture<'static, std::result::Result<SharedResponse, Arc<Error>>>>;

/// Middleware collapsing concurrent identical requests into one upstream
/// call. The in-flight map is keyed by fingerprint and cleared as each
/// call completes.
pub struct DedupMiddleware {
    config: DedupConfig,
    in_flight: DashMap<String, InFlight>,
}

impl std::fmt::Debug for DedupMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupMiddleware")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl DedupMiddleware {
    /// Create the middleware.
    #[must_use]
    pub fn new(config: DedupConfig) -> Self {
        Self { config, in_flight: DashMap::new() }
    }

    /// Number of upstream calls currently shared.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    fn key_for(&self, req: &Request) -> String {
        match &self.config.key_generator {
            Some(generator) => generator(req),
            None => fingerprint(req),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for DedupMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response> {
        // One-shot bodies cannot be shared, and explicit opt-outs pass
        // straight through.
        if !req.body().is_cloneable()
            || req.extensions().get::<DedupDisabled>().is_some()
        {
            return next.run(req).await;
        }
        let key = self.key_for(&req);

        let (future, leader) = match self.in_flight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                log::trace!("joining in-flight request for {key}");
                (entry.get().clone(), false)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let future: InFlight = async move {
                    let mut response =
                        next.run(req).await.map_err(Arc::new)?;
                    let body =
                        response.bytes().await.map_err(Arc::new)?;
                    Ok(SharedResponse {
                        status: response.status(),
                        url: response.url().clone(),
                        headers: response.headers().clone(),
                        version: response.version(),
                        body,
                        timings: response.timings(),
                        connection: response.connection().clone(),
                        redirects: response.redirects().to_vec(),
                    })
                }
                .boxed()
                .shared();
                entry.insert(future.clone());
                (future, true)
            }
        };

        let outcome = future.await;
        if leader {
            self.in_flight.remove(&key);
        }
        match outcome {
            Ok(shared) => {
                let mut response = Response::new(
                    shared.status,
                    shared.url,
                    shared.headers,
                    shared.version,
                    shared.body,
                );
                response.set_timings(shared.timings);
                response.set_connection(shared.connection);
                response.set_redirects(shared.redirects);
                Ok(response)
            }
            Err(err) => Err(match Arc::try_unwrap(err) {
                Ok(err) => err,
                Err(shared) => Error::network(shared.to_string()),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "dedup"
    }
}
