//! Cache storage backends: an abstract mapping from fingerprint to entry
//! with an optional storage-level TTL.

#[cfg(feature = "store-disk")]
pub mod disk;
pub mod memory;
#[cfg(feature = "store-moka")]
pub mod moka;

use std::time::{Duration, SystemTime};

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::cache::directives::{freshness_lifetime, ResponseDirectives};
use crate::error::Result;

/// A stored response plus the metadata freshness decisions need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Response status code
    pub status: u16,
    /// Canonical reason phrase at store time
    pub reason: Option<String>,
    /// Response headers as received (multi-value preserved by repetition)
    pub headers: Vec<(String, String)>,
    /// Response body bytes
    pub body: Vec<u8>,
    /// The URL the entry was stored for
    pub url: String,
    /// When the entry was stored
    pub stored_at: SystemTime,
    /// Value of the `Age` header at store time, seconds
    pub initial_age: u64,
    /// `ETag` validator, verbatim
    pub etag: Option<String>,
    /// `Last-Modified` validator, verbatim
    pub last_modified: Option<String>,
    /// `Vary` header, verbatim
    pub vary: Option<String>,
    /// Parsed response cache directives
    pub directives: ResponseDirectives,
    /// Whether this entry is only a Vary marker at a base key
    pub vary_marker: bool,
}

impl CacheEntry {
    /// Capture a response's parts into an entry stamped `now`.
    #[must_use]
    pub fn from_parts(
        status: StatusCode,
        headers: &HeaderMap,
        body: Vec<u8>,
        url: &url::Url,
        now: SystemTime,
    ) -> Self {
        let header_vec = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let header_str = |name: HeaderName| {
            headers
                .get(&name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let initial_age = headers
            .get(http::header::AGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        Self {
            status: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
            headers: header_vec,
            body,
            url: url.to_string(),
            stored_at: now,
            initial_age,
            etag: header_str(http::header::ETAG),
            last_modified: header_str(http::header::LAST_MODIFIED),
            vary: header_str(http::header::VARY),
            directives: ResponseDirectives::parse(headers),
            vary_marker: false,
        }
    }

    /// A marker entry for a base key recording only the resource's `Vary`.
    #[must_use]
    pub fn vary_marker(vary: &str, url: &url::Url, now: SystemTime) -> Self {
        Self {
            status: 0,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
            url: url.to_string(),
            stored_at: now,
            initial_age: 0,
            etag: None,
            last_modified: None,
            vary: Some(vary.to_string()),
            directives: ResponseDirectives::default(),
            vary_marker: true,
        }
    }

    /// Rebuild an `http::HeaderMap` from the stored headers.
    #[must_use]
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    /// The response `Date`, when one was sent.
    #[must_use]
    pub fn date(&self) -> Option<SystemTime> {
        self.header_value("date")
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// The parsed `Last-Modified` validator.
    #[must_use]
    pub fn last_modified_time(&self) -> Option<SystemTime> {
        self.last_modified
            .as_deref()
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }

    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Current age in seconds: time since storage plus the upstream age.
    #[must_use]
    pub fn age(&self, now: SystemTime) -> u64 {
        let resident =
            now.duration_since(self.stored_at).unwrap_or(Duration::ZERO);
        self.initial_age + resident.as_secs()
    }

    /// Freshness lifetime per the precedence chain, when one exists.
    #[must_use]
    pub fn lifetime(&self) -> Option<Duration> {
        freshness_lifetime(
            &self.directives,
            self.date(),
            self.last_modified_time(),
            self.stored_at,
        )
    }

    /// Whether the entry is fresh at `now`: some source of freshness
    /// yields an expiry in the future.
    #[must_use]
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        match self.lifetime() {
            Some(lifetime) => self.age(now) < lifetime.as_secs(),
            None => false,
        }
    }

    /// Seconds past expiry, zero when still fresh or never fresh.
    #[must_use]
    pub fn staleness(&self, now: SystemTime) -> u64 {
        match self.lifetime() {
            Some(lifetime) => {
                self.age(now).saturating_sub(lifetime.as_secs())
            }
            None => self.age(now),
        }
    }

    /// Seconds of freshness remaining at `now`.
    #[must_use]
    pub fn remaining_freshness(&self, now: SystemTime) -> u64 {
        match self.lifetime() {
            Some(lifetime) => {
                lifetime.as_secs().saturating_sub(self.age(now))
            }
            None => 0,
        }
    }

    /// Refresh timestamps and merge headers after a `304 Not Modified`.
    pub fn refresh_from_304(&mut self, headers: &HeaderMap, now: SystemTime) {
        for (name, value) in headers {
            // The stored body is reused, so its framing headers stay.
            if matches!(
                name.as_str(),
                "content-length" | "content-encoding" | "transfer-encoding"
            ) {
                continue;
            }
            let Ok(value_str) = value.to_str() else { continue };
            self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name.as_str()));
            self.headers.push((name.as_str().to_string(), value_str.to_string()));
        }
        self.stored_at = now;
        self.initial_age = 0;
        let map = self.header_map();
        self.directives = ResponseDirectives::parse(&map);
        self.etag = self.header_value("etag").map(str::to_string);
        self.last_modified =
            self.header_value("last-modified").map(str::to_string);
    }
}

/// A mapping from fingerprint to cache entry with optional TTL.
///
/// The interface mirrors a duck-typed key-value client: `get`, `set` with
/// a TTL, `delete`, `clear`. All mutations are serialized per key by the
/// backend.
#[async_trait::async_trait]
pub trait CacheStorage: Send + Sync + 'static {
    /// Fetch an entry, or `None` on miss or storage-TTL expiry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry. `ttl` bounds its storage lifetime independently of
    /// HTTP freshness; `None` keeps it until eviction or invalidation.
    async fn set(
        &self,
        key: &str,
        entry: CacheEntry,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Remove an entry. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop every entry.
    async fn clear(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CACHE_CONTROL, DATE, ETAG};

    fn entry_with(
        cache_control: &str,
        age_offset: Duration,
    ) -> (CacheEntry, SystemTime) {
        let now = SystemTime::now();
        let mut headers = HeaderMap::new();
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_str(cache_control).unwrap(),
        );
        headers.insert(
            DATE,
            HeaderValue::from_str(&httpdate::fmt_http_date(now - age_offset))
                .unwrap(),
        );
        let entry = CacheEntry {
            stored_at: now - age_offset,
            ..CacheEntry::from_parts(
                StatusCode::OK,
                &headers,
                b"body".to_vec(),
                &url::Url::parse("https://example.com/x").unwrap(),
                now - age_offset,
            )
        };
        (entry, now)
    }

    #[test]
    fn fresh_within_max_age() {
        let (entry, now) = entry_with("max-age=60", Duration::from_secs(30));
        assert!(entry.is_fresh(now));
        assert_eq!(entry.age(now), 30);
        assert_eq!(entry.remaining_freshness(now), 30);
    }

    #[test]
    fn stale_after_max_age() {
        let (entry, now) = entry_with("max-age=60", Duration::from_secs(90));
        assert!(!entry.is_fresh(now));
        assert_eq!(entry.staleness(now), 30);
    }

    #[test]
    fn initial_age_counts_toward_expiry() {
        let now = SystemTime::now();
        let mut headers = HeaderMap::new();
        headers
            .insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        headers.insert(http::header::AGE, HeaderValue::from_static("50"));
        let entry = CacheEntry::from_parts(
            StatusCode::OK,
            &headers,
            Vec::new(),
            &url::Url::parse("https://example.com/").unwrap(),
            now,
        );
        assert_eq!(entry.age(now), 50);
        assert!(entry.is_fresh(now));
        assert_eq!(entry.remaining_freshness(now), 10);
    }

    #[test]
    fn refresh_from_304_updates_validators_and_timestamps() {
        let (mut entry, now) = entry_with("max-age=60", Duration::from_secs(90));
        assert!(!entry.is_fresh(now));

        let mut fresh_headers = HeaderMap::new();
        fresh_headers.insert(ETAG, HeaderValue::from_static("\"v2\""));
        fresh_headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("max-age=120"),
        );
        fresh_headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_static("9999"),
        );
        entry.refresh_from_304(&fresh_headers, now);

        assert!(entry.is_fresh(now));
        assert_eq!(entry.etag.as_deref(), Some("\"v2\""));
        assert_eq!(entry.stored_at, now);
        // Framing headers of the stored body are not overwritten.
        assert!(entry.header_value("content-length").is_none());
    }

    #[test]
    fn vary_marker_entries_are_flagged() {
        let marker = CacheEntry::vary_marker(
            "accept",
            &url::Url::parse("https://example.com/").unwrap(),
            SystemTime::now(),
        );
        assert!(marker.vary_marker);
        assert!(marker.body.is_empty());
        assert_eq!(marker.vary.as_deref(), Some("accept"));
    }
}
