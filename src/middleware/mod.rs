//! The middleware composition model.
//!
//! A middleware wraps the remainder of the chain: it receives the request
//! and an owned [`Next`] cursor, and returns the response. The client
//! composes the chain once at construction; [`Next`] is cheaply cloneable
//! (`Arc` slices), which lets re-entrant middlewares such as conditional
//! cache revalidation drive the tail of the chain again or from a spawned
//! task.

mod compression;
mod dedup;
mod logger;
mod retry;
mod xsrf;

pub use compression::{CompressionConfig, CompressionMiddleware};
pub use dedup::{DedupConfig, DedupDisabled, DedupMiddleware};
pub use logger::LoggerMiddleware;
pub use retry::{RetryConfig, RetryEvent, RetryMiddleware};
pub use xsrf::{XsrfConfig, XsrfMiddleware};

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::transport::Transport;

/// A single stage of the request pipeline.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Process `req`, invoking `next` zero or more times to run the
    /// remainder of the chain. Errors flow through unless the middleware
    /// explicitly recovers.
    async fn handle(&self, req: Request, next: Next) -> Result<Response>;

    /// Name used by the debug logger.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Owned cursor over the remainder of the chain, terminating in the
/// transport dispatcher.
#[derive(Clone)]
pub struct Next {
    middlewares: Arc<[Arc<dyn Middleware>]>,
    transport: Arc<Transport>,
    index: usize,
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &(self.middlewares.len() - self.index))
            .finish()
    }
}

impl Next {
    pub(crate) fn new(
        middlewares: Arc<[Arc<dyn Middleware>]>,
        transport: Arc<Transport>,
    ) -> Self {
        Self { middlewares, transport, index: 0 }
    }

    /// Run the remaining middlewares and the terminal transport.
    pub fn run(self, req: Request) -> BoxFuture<'static, Result<Response>> {
        async move {
            match self.middlewares.get(self.index) {
                Some(middleware) => {
                    let middleware = Arc::clone(middleware);
                    let next = Self { index: self.index + 1, ..self };
                    middleware.handle(req, next).await
                }
                None => self.transport.dispatch(req).await,
            }
        }
        .boxed()
    }
}

/// Terminal stage before the transport: fails requests whose response
/// status is >= 400 when `throw_http_errors` is set.
pub(crate) struct StatusCheckMiddleware;

#[async_trait::async_trait]
impl Middleware for StatusCheckMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response> {
        let throw = req.throw_http_errors();
        let url = req.url().clone();
        let response = next.run(req).await?;
        if throw && response.status().as_u16() >= 400 {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                url,
                response: Box::new(response),
            });
        }
        Ok(response)
    }

    fn name(&self) -> &'static str {
        "status-check"
    }
}
