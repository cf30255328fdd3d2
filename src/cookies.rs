//! An in-memory cookie jar with RFC 6265 domain/path matching and
//! expiration semantics.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use url::Url;

/// `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    /// Sent only for same-site requests
    Strict,
    /// Sent for same-site requests and top-level cross-site navigation
    #[default]
    Lax,
    /// Sent everywhere; requires `Secure`
    None,
}

/// A single stored cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value, percent-decoded when the wire value contained `%`
    pub value: String,
    /// Lower-case domain without a leading dot
    pub domain: String,
    /// Cookie path, always starting with `/`
    pub path: String,
    /// Absolute expiry from the `Expires` attribute
    pub expires: Option<SystemTime>,
    /// Lifetime in seconds from the `Max-Age` attribute; takes precedence
    /// over `expires`, and a non-positive value deletes the cookie
    pub max_age: Option<i64>,
    /// Only sent over HTTPS
    pub secure: bool,
    /// Not exposed to scripts (stored for fidelity; the jar always matches)
    pub http_only: bool,
    /// `SameSite` attribute
    pub same_site: SameSite,
    /// `Partitioned` attribute
    pub partitioned: bool,
    /// `Priority` attribute, verbatim
    pub priority: Option<String>,
    /// When the jar first stored this cookie
    pub created_at: SystemTime,
}

impl Cookie {
    /// Whether the cookie is expired at `now`. `Max-Age` wins over
    /// `Expires`; a session cookie (neither attribute) never expires in
    /// memory.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        if let Some(max_age) = self.max_age {
            if max_age <= 0 {
                return true;
            }
            return self.created_at + Duration::from_secs(max_age as u64) <= now;
        }
        if let Some(expires) = self.expires {
            return expires <= now;
        }
        false
    }

    /// Whether the cookie's domain matches `host`: exact, or the cookie
    /// domain is a suffix of the host at a label boundary.
    #[must_use]
    pub fn domain_matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        host == self.domain || host.ends_with(&format!(".{}", self.domain))
    }

    /// Whether the cookie's path matches the request path: exact, or the
    /// request path extends the cookie path across a `/` boundary.
    #[must_use]
    pub fn path_matches(&self, request_path: &str) -> bool {
        if request_path == self.path {
            return true;
        }
        if let Some(rest) = request_path.strip_prefix(&self.path) {
            return self.path.ends_with('/') || rest.starts_with('/');
        }
        false
    }
}

/// In-memory cookie store keyed by `(domain, path, name)`.
///
/// Lookup returns at most one cookie per key; inserting replaces. Shared
/// across requests behind the client; mutations are serialized by an
/// internal lock.
pub struct CookieJar {
    // domain -> path -> name -> cookie
    store: Mutex<HashMap<String, HashMap<String, HashMap<String, Cookie>>>>,
}

impl fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let domains = self.store.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("CookieJar").field("domains", &domains).finish()
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieJar {
    /// Create an empty jar.
    #[must_use]
    pub fn new() -> Self {
        Self { store: Mutex::new(HashMap::new()) }
    }

    /// Ingest one `Set-Cookie` header received from `url`. Malformed
    /// cookies and domain mismatches are rejected silently.
    pub fn store_from_header(&self, url: &Url, set_cookie: &str) {
        let Some(host) = url.host_str() else { return };
        let Some(mut cookie) = parse_set_cookie(set_cookie) else {
            log::trace!("rejecting malformed set-cookie from {host}");
            return;
        };

        // Default domain/path from the request URL.
        if cookie.domain.is_empty() {
            cookie.domain = host.to_ascii_lowercase();
        } else if !domain_is_suffix_of(&cookie.domain, host) {
            log::trace!(
                "rejecting cookie {} scoped to {} from host {host}",
                cookie.name,
                cookie.domain
            );
            return;
        }
        if cookie.path.is_empty() {
            cookie.path = default_path(url.path());
        }

        let mut store = self.store.lock().expect("cookie jar poisoned");
        // Max-Age <= 0 deletes immediately.
        if cookie.max_age.is_some_and(|secs| secs <= 0) {
            if let Some(paths) = store.get_mut(&cookie.domain) {
                if let Some(names) = paths.get_mut(&cookie.path) {
                    names.remove(&cookie.name);
                }
            }
            return;
        }
        // Replacing keeps the original creation time so emission order is
        // stable across refreshes.
        let slot = store
            .entry(cookie.domain.clone())
            .or_default()
            .entry(cookie.path.clone())
            .or_default();
        if let Some(existing) = slot.get(&cookie.name) {
            cookie.created_at = existing.created_at;
        }
        slot.insert(cookie.name.clone(), cookie);
    }

    /// Ingest every `Set-Cookie` header on a response's header map.
    pub fn store_from_response(
        &self,
        url: &Url,
        headers: &http::HeaderMap,
    ) {
        for value in headers.get_all(http::header::SET_COOKIE) {
            if let Ok(raw) = value.to_str() {
                self.store_from_header(url, raw);
            }
        }
    }

    /// All cookies matching `url`, expired ones dropped, `Secure` cookies
    /// withheld from non-HTTPS requests, sorted path-length descending
    /// then creation time ascending.
    #[must_use]
    pub fn cookies_for_url(&self, url: &Url) -> Vec<Cookie> {
        let Some(host) = url.host_str() else { return Vec::new() };
        let is_https = url.scheme() == "https";
        let request_path = if url.path().is_empty() { "/" } else { url.path() };
        let now = SystemTime::now();

        let mut matched = Vec::new();
        let mut store = self.store.lock().expect("cookie jar poisoned");
        for paths in store.values_mut() {
            for names in paths.values_mut() {
                names.retain(|_, cookie| !cookie.is_expired(now));
                for cookie in names.values() {
                    if !cookie.domain_matches(host) {
                        continue;
                    }
                    if !cookie.path_matches(request_path) {
                        continue;
                    }
                    if cookie.secure && !is_https {
                        continue;
                    }
                    matched.push(cookie.clone());
                }
            }
        }
        matched.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        matched
    }

    /// The `Cookie` header value for `url`, or `None` when nothing matches.
    #[must_use]
    pub fn header_for_url(&self, url: &Url) -> Option<String> {
        let cookies = self.cookies_for_url(url);
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Look up one cookie by name for `url` (XSRF middleware).
    #[must_use]
    pub fn get(&self, url: &Url, name: &str) -> Option<Cookie> {
        self.cookies_for_url(url).into_iter().find(|c| c.name == name)
    }

    /// Remove every stored cookie.
    pub fn clear(&self) {
        self.store.lock().expect("cookie jar poisoned").clear();
    }

    /// Remove every cookie stored for `domain`.
    pub fn clear_domain(&self, domain: &str) {
        self.store
            .lock()
            .expect("cookie jar poisoned")
            .remove(&domain.to_ascii_lowercase());
    }

    /// Total number of stored cookies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store
            .lock()
            .expect("cookie jar poisoned")
            .values()
            .flat_map(HashMap::values)
            .map(HashMap::len)
            .sum()
    }

    /// Whether the jar holds no cookies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn domain_is_suffix_of(cookie_domain: &str, host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == cookie_domain || host.ends_with(&format!(".{cookie_domain}"))
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}

fn valid_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && !domain.starts_with('-')
        && !domain.ends_with('-')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

fn valid_path(path: &str) -> bool {
    path.starts_with('/') && !path.bytes().any(|b| b.is_ascii_control() || b == b';')
}

fn parse_set_cookie(raw: &str) -> Option<Cookie> {
    let mut segments = raw.split(';');
    let (name, value) = segments.next()?.split_once('=')?;
    let name = name.trim().to_string();
    if !valid_cookie_name(&name) {
        return None;
    }
    let value = value.trim().trim_matches('"');
    let value = if value.contains('%') {
        percent_encoding::percent_decode_str(value)
            .decode_utf8()
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    };

    let mut cookie = Cookie {
        name,
        value,
        domain: String::new(),
        path: String::new(),
        expires: None,
        max_age: None,
        secure: false,
        http_only: false,
        same_site: SameSite::default(),
        partitioned: false,
        priority: None,
        created_at: SystemTime::now(),
    };

    for segment in segments {
        let segment = segment.trim();
        let (attr, attr_value) = match segment.split_once('=') {
            Some((a, v)) => (a.trim(), Some(v.trim())),
            None => (segment, None),
        };
        match attr.to_ascii_lowercase().as_str() {
            "domain" => {
                let domain = attr_value?
                    .trim_start_matches('.')
                    .to_ascii_lowercase();
                if !valid_domain(&domain) {
                    return None;
                }
                cookie.domain = domain;
            }
            "path" => {
                let path = attr_value?;
                if !valid_path(path) {
                    return None;
                }
                cookie.path = path.to_string();
            }
            "expires" => {
                cookie.expires = httpdate::parse_http_date(attr_value?).ok();
            }
            "max-age" => {
                cookie.max_age = Some(attr_value?.parse().ok()?);
            }
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "samesite" => {
                cookie.same_site =
                    match attr_value?.to_ascii_lowercase().as_str() {
                        "strict" => SameSite::Strict,
                        "none" => SameSite::None,
                        _ => SameSite::Lax,
                    };
            }
            "partitioned" => cookie.partitioned = true,
            "priority" => cookie.priority = attr_value.map(str::to_string),
            _ => {}
        }
    }
    Some(cookie)
}
