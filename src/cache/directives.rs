//! `Cache-Control` directive parsing and freshness arithmetic.

use std::time::{Duration, SystemTime};

use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Fraction of `Date - Last-Modified` used for heuristic freshness.
pub const HEURISTIC_FRACTION: f64 = 0.10;

/// `max-stale` tolerance from a request's `Cache-Control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxStale {
    /// `max-stale` with no value: any staleness is acceptable
    Unbounded,
    /// `max-stale=N`: accept entries up to N seconds past expiry
    Seconds(u64),
}

/// Directives parsed from a request's `Cache-Control` (and legacy
/// `Pragma: no-cache`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestDirectives {
    /// `no-store`: skip the cache entirely
    pub no_store: bool,
    /// `no-cache` (or `Pragma: no-cache`): must revalidate before use
    pub no_cache: bool,
    /// `only-if-cached`: never touch the network
    pub only_if_cached: bool,
    /// `max-age=N`: reject entries older than N seconds
    pub max_age: Option<u64>,
    /// `min-fresh=N`: entry must remain fresh for at least N more seconds
    pub min_fresh: Option<u64>,
    /// `max-stale[=N]`: accept stale entries within the tolerance
    pub max_stale: Option<MaxStale>,
}

impl RequestDirectives {
    /// Parse the request-side directives from a header map.
    #[must_use]
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut out = Self::default();
        for (key, value) in directive_pairs(headers) {
            match key.as_str() {
                "no-store" => out.no_store = true,
                "no-cache" => out.no_cache = true,
                "only-if-cached" => out.only_if_cached = true,
                "max-age" => out.max_age = value.and_then(|v| v.parse().ok()),
                "min-fresh" => {
                    out.min_fresh = value.and_then(|v| v.parse().ok());
                }
                "max-stale" => {
                    out.max_stale = Some(match value.and_then(|v| v.parse().ok())
                    {
                        Some(secs) => MaxStale::Seconds(secs),
                        None => MaxStale::Unbounded,
                    });
                }
                _ => {}
            }
        }
        if headers
            .get(http::header::PRAGMA)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"))
        {
            out.no_cache = true;
        }
        out
    }
}

/// Directives parsed from a response's `Cache-Control` plus the `Expires`
/// header fallback. Persisted with each cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseDirectives {
    /// `max-age=N`
    pub max_age: Option<u64>,
    /// `s-maxage=N`, takes precedence for shared caches
    pub s_maxage: Option<u64>,
    /// `no-cache`
    pub no_cache: bool,
    /// `no-store`
    pub no_store: bool,
    /// `must-revalidate`
    pub must_revalidate: bool,
    /// `public`
    pub is_public: bool,
    /// `private`
    pub is_private: bool,
    /// `stale-while-revalidate=N`
    pub stale_while_revalidate: Option<u64>,
    /// `stale-if-error=N`
    pub stale_if_error: Option<u64>,
    /// Absolute expiry from the `Expires` header
    pub expires: Option<SystemTime>,
}

impl ResponseDirectives {
    /// Parse the response-side directives from a header map.
    #[must_use]
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut out = Self::default();
        for (key, value) in directive_pairs(headers) {
            match key.as_str() {
                "max-age" => out.max_age = value.and_then(|v| v.parse().ok()),
                "s-maxage" => {
                    out.s_maxage = value.and_then(|v| v.parse().ok());
                }
                "no-cache" => out.no_cache = true,
                "no-store" => out.no_store = true,
                "must-revalidate" => out.must_revalidate = true,
                "public" => out.is_public = true,
                "private" => out.is_private = true,
                "stale-while-revalidate" => {
                    out.stale_while_revalidate =
                        value.and_then(|v| v.parse().ok());
                }
                "stale-if-error" => {
                    out.stale_if_error = value.and_then(|v| v.parse().ok());
                }
                _ => {}
            }
        }
        out.expires = headers
            .get(http::header::EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok());
        out
    }

    /// Explicit freshness lifetime, by precedence `s-maxage` > `max-age` >
    /// `Expires`, relative to `reference` (the response's `Date`, or the
    /// store time when no `Date` was sent).
    #[must_use]
    pub fn explicit_lifetime(
        &self,
        reference: SystemTime,
    ) -> Option<Duration> {
        if let Some(secs) = self.s_maxage {
            return Some(Duration::from_secs(secs));
        }
        if let Some(secs) = self.max_age {
            return Some(Duration::from_secs(secs));
        }
        if let Some(expires) = self.expires {
            return Some(
                expires.duration_since(reference).unwrap_or(Duration::ZERO),
            );
        }
        None
    }
}

/// Freshness lifetime for a stored response.
///
/// Precedence: `s-maxage` > `max-age` > `Expires` > heuristic (10 % of
/// `Date - Last-Modified`). A response without a `Date` header is not
/// heuristically cacheable; clock skew would make the estimate
/// meaningless.
#[must_use]
pub fn freshness_lifetime(
    directives: &ResponseDirectives,
    date: Option<SystemTime>,
    last_modified: Option<SystemTime>,
    stored_at: SystemTime,
) -> Option<Duration> {
    if let Some(lifetime) =
        directives.explicit_lifetime(date.unwrap_or(stored_at))
    {
        return Some(lifetime);
    }
    let date = date?;
    let last_modified = last_modified?;
    let delta = date.duration_since(last_modified).ok()?;
    Some(delta.mul_f64(HEURISTIC_FRACTION))
}

fn directive_pairs(headers: &HeaderMap) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    for value in headers.get_all(http::header::CACHE_CONTROL) {
        let Ok(text) = value.to_str() else { continue };
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut kv = part.splitn(2, '=');
            let key = kv.next().unwrap_or_default().trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }
            let value =
                kv.next().map(|v| v.trim().trim_matches('"').to_string());
            out.push((key, value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CACHE_CONTROL, EXPIRES, PRAGMA};
    use http::HeaderValue;

    fn headers(pairs: &[(http::header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn parses_request_directives() {
        let map = headers(&[(
            CACHE_CONTROL,
            "no-cache, max-age=30, min-fresh=60, max-stale",
        )]);
        let dirs = RequestDirectives::parse(&map);
        assert!(dirs.no_cache);
        assert_eq!(dirs.max_age, Some(30));
        assert_eq!(dirs.min_fresh, Some(60));
        assert_eq!(dirs.max_stale, Some(MaxStale::Unbounded));

        let map = headers(&[(CACHE_CONTROL, "max-stale=120, only-if-cached")]);
        let dirs = RequestDirectives::parse(&map);
        assert_eq!(dirs.max_stale, Some(MaxStale::Seconds(120)));
        assert!(dirs.only_if_cached);
    }

    #[test]
    fn pragma_no_cache_is_honored() {
        let map = headers(&[(PRAGMA, "no-cache")]);
        assert!(RequestDirectives::parse(&map).no_cache);
    }

    #[test]
    fn parses_response_directives() {
        let map = headers(&[(
            CACHE_CONTROL,
            "public, max-age=60, s-maxage=120, stale-while-revalidate=30, \
             stale-if-error=90, must-revalidate",
        )]);
        let dirs = ResponseDirectives::parse(&map);
        assert!(dirs.is_public && dirs.must_revalidate);
        assert_eq!(dirs.max_age, Some(60));
        assert_eq!(dirs.s_maxage, Some(120));
        assert_eq!(dirs.stale_while_revalidate, Some(30));
        assert_eq!(dirs.stale_if_error, Some(90));
    }

    #[test]
    fn quoted_values_are_unquoted() {
        let map = headers(&[(CACHE_CONTROL, "max-age=\"45\"")]);
        assert_eq!(ResponseDirectives::parse(&map).max_age, Some(45));
    }

    #[test]
    fn s_maxage_wins_over_max_age_and_expires() {
        let now = SystemTime::now();
        let map = headers(&[(CACHE_CONTROL, "max-age=10, s-maxage=20")]);
        let dirs = ResponseDirectives::parse(&map);
        assert_eq!(
            freshness_lifetime(&dirs, Some(now), None, now),
            Some(Duration::from_secs(20))
        );
    }

    #[test]
    fn expires_is_the_fallback() {
        let now = SystemTime::now();
        let expires = now + Duration::from_secs(300);
        let map = headers(&[(
            EXPIRES,
            &httpdate::fmt_http_date(expires),
        )]);
        let dirs = ResponseDirectives::parse(&map);
        let lifetime = freshness_lifetime(&dirs, Some(now), None, now).unwrap();
        // HTTP dates have one-second resolution.
        assert!(lifetime >= Duration::from_secs(299));
        assert!(lifetime <= Duration::from_secs(301));
    }

    #[test]
    fn heuristic_is_ten_percent_of_date_minus_last_modified() {
        let now = SystemTime::now();
        let last_modified = now - Duration::from_secs(1000);
        let dirs = ResponseDirectives::default();
        assert_eq!(
            freshness_lifetime(&dirs, Some(now), Some(last_modified), now),
            Some(Duration::from_secs(100))
        );
    }

    #[test]
    fn no_date_means_no_heuristic() {
        let now = SystemTime::now();
        let dirs = ResponseDirectives::default();
        assert_eq!(
            freshness_lifetime(
                &dirs,
                None,
                Some(now - Duration::from_secs(1000)),
                now
            ),
            None
        );
    }
}
