use std::time::Instant;

use crate::error::Result;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// Debug logger; outermost stage when enabled, so it observes the request
/// exactly as submitted and the response after every other middleware has
/// touched it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggerMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggerMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response> {
        let method = req.method().clone();
        let url = req.url().clone();
        log::debug!("--> {method} {url}");
        let started = Instant::now();
        let result = next.run(req).await;
        let elapsed = started.elapsed();
        match &result {
            Ok(res) => {
                log::debug!(
                    "<-- {method} {url} {} in {elapsed:?}{}",
                    res.status(),
                    res.header("x-cache")
                        .map(|v| format!(" (x-cache: {v})"))
                        .unwrap_or_default()
                );
            }
            Err(err) => {
                log::debug!("<-- {method} {url} failed in {elapsed:?}: {err}");
            }
        }
        result
    }

    fn name(&self) -> &'static str {
        "logger"
    }
}
