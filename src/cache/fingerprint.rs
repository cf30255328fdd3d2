//! Deterministic request fingerprints used as cache and dedup keys.

use std::sync::atomic::{AtomicU64, Ordering};

use http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::request::Request;

/// Length of the truncated body hash in hex characters.
const BODY_HASH_LEN: usize = 16;

static NEVER_MATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// The base fingerprint for a request: `METHOD:URL`, plus a truncated
/// SHA-256 of the body for non-GET/HEAD requests that carry one. A body
/// that cannot be serialized (a one-shot stream) contributes no hash.
#[must_use]
pub fn fingerprint(req: &Request) -> String {
    let mut key = format!("{}:{}", req.method(), req.url());
    let is_get_head = req.method() == http::Method::GET
        || req.method() == http::Method::HEAD;
    if !is_get_head && !req.body().is_empty() {
        if let Some(Ok(bytes)) = req.body().to_bytes() {
            let digest = Sha256::digest(&bytes);
            let mut hash = hex::encode(digest);
            hash.truncate(BODY_HASH_LEN);
            key.push(':');
            key.push_str(&hash);
        }
    }
    key
}

/// The fingerprint a resource's `Vary` header partitions a base key into.
///
/// Each listed request header contributes its normalized value; `Vary: *`
/// yields a key no future lookup can produce.
#[must_use]
pub fn vary_fingerprint(
    base: &str,
    vary: &str,
    request_headers: &HeaderMap,
) -> String {
    if vary.trim() == "*" {
        let seq = NEVER_MATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        return format!("{base}:vary=*:{seq}");
    }
    let mut names: Vec<String> = vary
        .split(',')
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names.dedup();

    let mut key = format!("{base}:vary");
    for name in names {
        let value = request_headers
            .get(&name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();
        key.push_str(&format!(":{name}={value}"));
    }
    key
}

/// The invalidation key an unsafe method busts: `METHOD:URL` with the
/// method overridden (`GET:<url>` and `HEAD:<url>` for the same URL).
#[must_use]
pub fn invalidation_key(method: &str, url: &url::Url) -> String {
    format!("{method}:{url}")
}
