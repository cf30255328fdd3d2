//! XSRF protection: mirror a cookie into a request header for unsafe
//! methods.

use std::sync::Arc;

use http::header::HeaderName;
use http::{HeaderValue, Method};

use crate::cookies::CookieJar;
use crate::error::Result;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// XSRF mirroring configuration.
#[derive(Debug, Clone)]
pub struct XsrfConfig {
    /// Cookie to read from the jar.
    pub cookie_name: String,
    /// Header to write the token into.
    pub header_name: String,
    /// Methods that need the token.
    pub methods: Vec<Method>,
}

impl Default for XsrfConfig {
    fn default() -> Self {
        Self {
            cookie_name: "XSRF-TOKEN".into(),
            header_name: "X-XSRF-TOKEN".into(),
            methods: vec![
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
            ],
        }
    }
}

/// Middleware copying the named cookie into the named header.
pub struct XsrfMiddleware {
    config: XsrfConfig,
    jar: Arc<CookieJar>,
}

impl std::fmt::Debug for XsrfMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XsrfMiddleware").field("config", &self.config).finish()
    }
}

impl XsrfMiddleware {
    /// Create the middleware over a shared jar.
    #[must_use]
    pub fn new(config: XsrfConfig, jar: Arc<CookieJar>) -> Self {
        Self { config, jar }
    }
}

#[async_trait::async_trait]
impl Middleware for XsrfMiddleware {
    async fn handle(&self, mut req: Request, next: Next) -> Result<Response> {
        if self.config.methods.contains(req.method())
            && !req.headers().contains_key(self.config.header_name.as_str())
        {
            if let Some(cookie) =
                self.jar.get(req.url(), &self.config.cookie_name)
            {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(
                        self.config.header_name.as_bytes(),
                    ),
                    HeaderValue::from_str(&cookie.value),
                ) {
                    req.headers_mut().insert(name, value);
                }
            }
        }
        next.run(req).await
    }

    fn name(&self) -> &'static str {
        "xsrf"
    }
}
