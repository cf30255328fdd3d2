use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use http::header::{CACHE_CONTROL, DATE, ETAG};
use http::{HeaderMap, HeaderValue, StatusCode};
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::cache::storage::CacheEntry;
use crate::middleware::{Middleware, Next};
use crate::{
    CacheConfig, CacheStorage, CacheStrategy, Client, DedupConfig, Error,
    MemoryStorage, Request, Response, Result, RetryConfig,
};

const GET: &str = "GET";
const TEST_BODY: &[u8] = b"test";

fn client_for(server: &MockServer) -> crate::ClientBuilder {
    Client::builder().base_url(&server.uri()).unwrap()
}

fn cache_key(server: &MockServer, path: &str) -> String {
    let url = Url::parse(&format!("{}{}", server.uri(), path)).unwrap();
    format!("{GET}:{url}")
}

/// A cache entry stored `age` seconds ago with the given cache-control.
fn seeded_entry(
    server: &MockServer,
    path: &str,
    body: &[u8],
    cache_control: &str,
    age: Duration,
    etag: Option<&str>,
) -> CacheEntry {
    let url = Url::parse(&format!("{}{}", server.uri(), path)).unwrap();
    let stored_at = SystemTime::now() - age;
    let mut headers = HeaderMap::new();
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_str(cache_control).unwrap(),
    );
    headers.insert(
        DATE,
        HeaderValue::from_str(&httpdate::fmt_http_date(stored_at)).unwrap(),
    );
    if let Some(etag) = etag {
        headers.insert(ETAG, HeaderValue::from_str(etag).unwrap());
    }
    CacheEntry::from_parts(
        StatusCode::OK,
        &headers,
        body.to_vec(),
        &url,
        stored_at,
    )
}

// ---------------------------------------------------------------------
// middleware composition
// ---------------------------------------------------------------------

struct TraceMiddleware {
    label: &'static str,
    trace: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Middleware for TraceMiddleware {
    async fn handle(&self, mut req: Request, next: Next) -> Result<Response> {
        self.trace.lock().unwrap().push(format!("{}>", self.label));
        // Later middlewares must observe earlier modifications.
        let mark = format!("x-seen-{}", self.label.to_ascii_lowercase());
        req.headers_mut().insert(
            mark.parse::<http::header::HeaderName>().unwrap(),
            HeaderValue::from_static("1"),
        );
        let response = next.run(req).await;
        self.trace.lock().unwrap().push(format!("<{}", self.label));
        response
    }
}

#[tokio::test]
async fn middleware_chain_runs_in_order_and_back() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(TEST_BODY))
        .expect(1)
        .mount(&server)
        .await;

    let trace: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let client = client_for(&server)
        .with(Arc::new(TraceMiddleware { label: "A", trace: trace.clone() }))
        .with(Arc::new(TraceMiddleware { label: "B", trace: trace.clone() }))
        .with(Arc::new(TraceMiddleware { label: "C", trace: trace.clone() }))
        .build()
        .unwrap();

    client.get("/").send().await.unwrap();
    assert_eq!(
        *trace.lock().unwrap(),
        ["A>", "B>", "C>", "<C", "<B", "<A"].map(String::from)
    );

    // Modifications by earlier middlewares reached the wire.
    let received = &server.received_requests().await.unwrap()[0];
    assert!(received.headers.contains_key("x-seen-a"));
    assert!(received.headers.contains_key("x-seen-b"));
    assert!(received.headers.contains_key("x-seen-c"));
}

#[tokio::test]
async fn use_middleware_recomposes_the_chain() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let trace: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let client = client_for(&server).build().unwrap();
    client.get("/").send().await.unwrap();
    assert!(trace.lock().unwrap().is_empty());

    client.use_middleware(Arc::new(TraceMiddleware {
        label: "late",
        trace: trace.clone(),
    }));
    client.get("/").send().await.unwrap();
    assert_eq!(*trace.lock().unwrap(), ["late>", "<late"].map(String::from));
}

// ---------------------------------------------------------------------
// cache
// ---------------------------------------------------------------------

#[tokio::test]
async fn fresh_cache_hit_serves_without_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(path("/x"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=60")
                .set_body_bytes(b"A".as_slice()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::default());
    let client = client_for(&server)
        .cache(CacheConfig::default(), storage.clone())
        .build()
        .unwrap();

    let mut first = client.get("/x").send().await.unwrap();
    assert_eq!(first.header("x-cache"), Some("miss"));
    assert_eq!(first.text().await.unwrap(), "A");

    let mut second = client.get("/x").send().await.unwrap();
    assert_eq!(second.header("x-cache"), Some("hit"));
    assert_eq!(second.header("x-cache-age"), Some("0"));
    assert_eq!(second.text().await.unwrap(), "A");
}

#[tokio::test]
async fn conditional_revalidation_serves_stored_body_on_304() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(path("/x"))
        .and(header("if-none-match", "\"abc\""))
        .respond_with(
            ResponseTemplate::new(304).insert_header("etag", "\"abc\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::default());
    // Stored 120 s ago with max-age=60: stale, revalidation required.
    let entry = seeded_entry(
        &server,
        "/x",
        b"A",
        "max-age=60",
        Duration::from_secs(120),
        Some("\"abc\""),
    );
    storage.set(&cache_key(&server, "/x"), entry, None).await.unwrap();

    let client = client_for(&server)
        .cache(CacheConfig::default(), storage.clone())
        .build()
        .unwrap();

    let mut response = client.get("/x").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.header("x-cache"), Some("revalidated"));
    assert_eq!(response.text().await.unwrap(), "A");

    // The stored timestamp advanced: the entry is fresh again.
    let refreshed = storage
        .get(&cache_key(&server, "/x"))
        .await
        .unwrap()
        .unwrap();
    assert!(refreshed.is_fresh(SystemTime::now()));
}

#[tokio::test]
async fn stale_while_revalidate_serves_stale_then_refreshes() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(path("/y"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=60")
                .set_body_bytes(b"new".as_slice()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::default());
    let entry = seeded_entry(
        &server,
        "/y",
        b"old",
        "max-age=1",
        Duration::from_secs(3),
        Some("\"v1\""),
    );
    storage.set(&cache_key(&server, "/y"), entry, None).await.unwrap();

    let client = client_for(&server)
        .cache(
            CacheConfig {
                strategy: CacheStrategy::StaleWhileRevalidate,
                ..CacheConfig::default()
            },
            storage.clone(),
        )
        .build()
        .unwrap();

    let mut response = client.get("/y").send().await.unwrap();
    assert_eq!(response.header("x-cache"), Some("stale"));
    assert!(response.header("warning").unwrap().starts_with("110 "));
    assert_eq!(response.text().await.unwrap(), "old");

    // The background refresh lands shortly after.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let refreshed = storage
        .get(&cache_key(&server, "/y"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.body, b"new");
}

#[tokio::test]
async fn min_fresh_rejects_an_entry_expiring_too_soon() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(path("/x"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=60")
                .set_body_bytes(b"B".as_slice()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::default());
    // Fresh for another 30 s, but the request wants 60 s of headroom.
    let entry = seeded_entry(
        &server,
        "/x",
        b"A",
        "max-age=60",
        Duration::from_secs(30),
        Some("\"abc\""),
    );
    storage.set(&cache_key(&server, "/x"), entry, None).await.unwrap();

    let client = client_for(&server)
        .cache(CacheConfig::default(), storage)
        .build()
        .unwrap();

    let mut response = client
        .get("/x")
        .header("cache-control", "min-fresh=60")
        .send()
        .await
        .unwrap();
    assert_eq!(response.header("x-cache"), Some("miss"));
    assert_eq!(response.text().await.unwrap(), "B");
}

#[tokio::test]
async fn max_stale_serves_an_expired_entry() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::default());
    // 30 s past expiry.
    let entry = seeded_entry(
        &server,
        "/x",
        b"A",
        "max-age=60",
        Duration::from_secs(90),
        None,
    );
    storage.set(&cache_key(&server, "/x"), entry, None).await.unwrap();

    let client = client_for(&server)
        .cache(CacheConfig::default(), storage)
        .build()
        .unwrap();

    let mut response = client
        .get("/x")
        .header("cache-control", "max-stale")
        .send()
        .await
        .unwrap();
    assert_eq!(response.header("x-cache"), Some("stale"));
    assert!(response.header("warning").unwrap().starts_with("110 "));
    assert_eq!(response.text().await.unwrap(), "A");
}

#[tokio::test]
async fn only_if_cached_miss_synthesizes_504() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server)
        .cache(CacheConfig::default(), Arc::new(MemoryStorage::default()))
        .throw_http_errors(false)
        .build()
        .unwrap();

    let response = client
        .get("/absent")
        .header("cache-control", "only-if-cached")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(response.header("x-cache"), Some("miss"));
}

#[tokio::test]
async fn vary_partitions_cache_entries() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(path("/v"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=60")
                .insert_header("vary", "accept")
                .set_body_bytes(b"varied".as_slice()),
        )
        .expect(2)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::default());
    let client = client_for(&server)
        .cache(CacheConfig::default(), storage)
        .build()
        .unwrap();

    let first = client
        .get("/v")
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(first.header("x-cache"), Some("miss"));

    // Different value of the varied header: distinct key, new dispatch.
    let second = client
        .get("/v")
        .header("accept", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(second.header("x-cache"), Some("miss"));

    // Same value as the first: served from cache.
    let third = client
        .get("/v")
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(third.header("x-cache"), Some("hit"));
}

#[tokio::test]
async fn unsafe_method_invalidates_on_2xx() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::default());
    let entry = seeded_entry(
        &server,
        "/x",
        b"A",
        "max-age=60",
        Duration::from_secs(0),
        None,
    );
    storage.set(&cache_key(&server, "/x"), entry, None).await.unwrap();

    let client = client_for(&server)
        .cache(CacheConfig::default(), storage.clone())
        .build()
        .unwrap();

    client.post("/x").text("data").send().await.unwrap();
    assert!(storage
        .get(&cache_key(&server, "/x"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn non_2xx_purge_leaves_the_entry() {
    let server = MockServer::start().await;
    Mock::given(method("PURGE"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryStorage::default());
    let entry = seeded_entry(
        &server,
        "/x",
        b"A",
        "max-age=60",
        Duration::from_secs(0),
        None,
    );
    storage.set(&cache_key(&server, "/x"), entry, None).await.unwrap();

    let client = client_for(&server)
        .cache(CacheConfig::default(), storage.clone())
        .throw_http_errors(false)
        .build()
        .unwrap();

    let purge = http::Method::from_bytes(b"PURGE").unwrap();
    client.request(purge, "/x").send().await.unwrap();
    assert!(storage
        .get(&cache_key(&server, "/x"))
        .await
        .unwrap()
        .is_some());
}

// ---------------------------------------------------------------------
// concurrency
// ---------------------------------------------------------------------

struct GaugeMiddleware {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Middleware for GaugeMiddleware {
    async fn handle(&self, req: Request, next: Next) -> Result<Response> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = next.run(req).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[tokio::test]
async fn global_cap_bounds_in_flight_requests() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(
            ResponseTemplate::new(200).set_delay(Duration::from_millis(100)),
        )
        .expect(10)
        .mount(&server)
        .await;

    let peak = Arc::new(AtomicUsize::new(0));
    let client = client_for(&server)
        .concurrency(3)
        .with(Arc::new(GaugeMiddleware {
            current: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        }))
        .build()
        .unwrap();

    let requests: Vec<Request> =
        (0..10).map(|_| client.get("/sleep").build().unwrap()).collect();
    let started = Instant::now();
    let results = client.multi(requests).await;
    let elapsed = started.elapsed();

    assert!(results.iter().all(|result| result.is_ok()));
    assert!(peak.load(Ordering::SeqCst) <= 3);
    // ceil(10/3) waves of 100 ms each.
    assert!(elapsed >= Duration::from_millis(350), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn batch_reports_stats_and_error_values() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method(GET))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client_for(&server).build().unwrap();
    let requests = vec![
        client.get("/ok").build().unwrap(),
        client.get("/bad").build().unwrap(),
        client.get("/ok").build().unwrap(),
    ];
    let outcome = client.batch(requests).await;
    assert_eq!(outcome.stats.total, 3);
    assert_eq!(outcome.stats.successful, 2);
    assert_eq!(outcome.stats.failed, 1);
    assert!(matches!(
        outcome.results[1],
        Err(Error::HttpStatus { status: 500, .. })
    ));
}

// ---------------------------------------------------------------------
// dedup
// ---------------------------------------------------------------------

#[tokio::test]
async fn identical_concurrent_requests_share_one_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(path("/dedup"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(100))
                .set_body_bytes(b"shared".as_slice()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server)
        .dedup(DedupConfig::default())
        .build()
        .unwrap();

    let calls = (0..8).map(|_| {
        let client = client.clone();
        async move { client.get("/dedup").send().await }
    });
    let responses = futures::future::join_all(calls).await;
    for response in responses {
        let mut response = response.unwrap();
        assert_eq!(response.text().await.unwrap(), "shared");
    }
}

// ---------------------------------------------------------------------
// retry
// ---------------------------------------------------------------------

#[tokio::test]
async fn retries_retriable_statuses_until_success() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method(GET))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".as_slice()))
        .mount(&server)
        .await;

    let client = client_for(&server)
        .retry(RetryConfig {
            attempts: 3,
            backoff_base: Duration::from_millis(5),
            ..RetryConfig::default()
        })
        .build()
        .unwrap();

    let mut response = client.get("/flaky").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.retry_count(), 2);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn exhausted_retries_surface_the_status_error() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server)
        .retry(RetryConfig {
            attempts: 2,
            backoff_base: Duration::from_millis(5),
            ..RetryConfig::default()
        })
        .build()
        .unwrap();

    let err = client.get("/down").send().await.unwrap_err();
    assert!(matches!(err, Error::HttpStatus { status: 503, .. }));
}

// ---------------------------------------------------------------------
// size enforcement
// ---------------------------------------------------------------------

#[tokio::test]
async fn declared_oversize_fails_before_reading_the_body() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(vec![0u8; 101]),
        )
        .mount(&server)
        .await;

    let client =
        client_for(&server).max_response_size(100).build().unwrap();
    let err = client.get("/large").send().await.unwrap_err();
    match err {
        Error::MaxSizeExceeded { max_size, actual_size } => {
            assert_eq!(max_size, 100);
            assert_eq!(actual_size, 101);
        }
        other => panic!("expected MaxSizeExceeded, got {other:?}"),
    }
}

// ---------------------------------------------------------------------
// cookies
// ---------------------------------------------------------------------

#[tokio::test]
async fn jar_captures_set_cookie_and_sends_it_back() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "sid=abc123; Path=/"),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).cookies(true).build().unwrap();
    client.get("/login").send().await.unwrap();
    client.get("/after").send().await.unwrap();

    let received = server.received_requests().await.unwrap();
    assert!(received[0].headers.get("cookie").is_none());
    assert_eq!(
        received[1].headers.get("cookie").unwrap().to_str().unwrap(),
        "sid=abc123"
    );
}

// ---------------------------------------------------------------------
// hooks and errors
// ---------------------------------------------------------------------

#[tokio::test]
async fn before_request_hooks_replace_the_request() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(header("x-hooked", "yes"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server)
        .before_request(Arc::new(|mut req: Request| {
            Box::pin(async move {
                req.headers_mut()
                    .insert("x-hooked", HeaderValue::from_static("yes"));
                Ok(req)
            })
        }))
        .build()
        .unwrap();

    client.get("/").send().await.unwrap();
}

#[tokio::test]
async fn on_error_hooks_can_swallow_failures() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    fn fallback(
        err: &Error,
    ) -> futures::future::BoxFuture<'_, Option<Response>> {
        let synthesized = err.status().map(|_| {
            Response::new(
                StatusCode::OK,
                Url::parse("https://fallback.local/").unwrap(),
                HeaderMap::new(),
                http::Version::HTTP_11,
                bytes::Bytes::from_static(b"fallback"),
            )
        });
        Box::pin(async move { synthesized })
    }

    let client =
        client_for(&server).on_error(Arc::new(fallback)).build().unwrap();

    let mut response = client.get("/").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "fallback");
}

#[tokio::test]
async fn http_errors_carry_the_response() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(
            ResponseTemplate::new(404).set_body_bytes(b"gone".as_slice()),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).build().unwrap();
    let err = client.get("/missing").send().await.unwrap_err();
    match err {
        Error::HttpStatus { status, mut response, .. } => {
            assert_eq!(status, 404);
            assert_eq!(response.text().await.unwrap(), "gone");
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }

    // With throw_http_errors off, the caller gets the response instead.
    let client = client_for(&server).throw_http_errors(false).build().unwrap();
    let response = client.get("/missing").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------
// cancellation
// ---------------------------------------------------------------------

#[tokio::test]
async fn external_signal_aborts_a_waiting_request() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(
            ResponseTemplate::new(200).set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).build().unwrap();
    let token = crate::CancelToken::new();
    let aborter = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        aborter.cancel();
    });
    let err = client
        .get("/slow")
        .signal(token)
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn total_timeout_surfaces_as_timeout_error() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(
            ResponseTemplate::new(200).set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).build().unwrap();
    let err = client
        .get("/slow")
        .total_timeout(Duration::from_millis(50))
        .send()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Timeout { kind: crate::TimeoutKind::Total, .. }
    ));
}

// ---------------------------------------------------------------------
// timings
// ---------------------------------------------------------------------

#[tokio::test]
async fn total_timing_finalizes_after_body_consumption() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64 * 1024]),
        )
        .mount(&server)
        .await;

    let client = client_for(&server).build().unwrap();
    let mut response = client.get("/timed").send().await.unwrap();

    // Before the body is read, total reflects head completion.
    let head = response.timings();
    let ttfb = head.ttfb.unwrap();
    assert_eq!(head.total, Some(ttfb));

    response.bytes().await.unwrap();
    let total = response.timings().total.unwrap();
    assert!(total >= ttfb);
}

// ---------------------------------------------------------------------
// pagination
// ---------------------------------------------------------------------

#[tokio::test]
async fn paginate_follows_link_next() {
    use futures::TryStreamExt;

    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(path("/items"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "link",
                    format!("<{}/items2>; rel=\"next\"", server.uri())
                        .as_str(),
                )
                .set_body_bytes(b"page1".as_slice()),
        )
        .mount(&server)
        .await;
    Mock::given(method(GET))
        .and(path("/items2"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"page2".as_slice()))
        .mount(&server)
        .await;

    let client = client_for(&server).build().unwrap();
    let pages: Vec<Response> =
        client.paginate("/items", None).try_collect().await.unwrap();
    assert_eq!(pages.len(), 2);

    let mut bodies = Vec::new();
    for mut page in pages {
        bodies.push(page.text().await.unwrap());
    }
    assert_eq!(bodies, vec!["page1", "page2"]);
}

// ---------------------------------------------------------------------
// url building against a live base
// ---------------------------------------------------------------------

#[tokio::test]
async fn params_substitute_into_the_dispatched_path() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .and(path("/users/42/posts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).build().unwrap();
    client
        .get("/users/:id/posts")
        .param("id", 42)
        .send()
        .await
        .unwrap();

    let received = &server.received_requests().await.unwrap()[0];
    assert_eq!(received.url.path(), "/users/42/posts");
}

#[tokio::test]
async fn leftover_params_are_appended_as_query() {
    let server = MockServer::start().await;
    Mock::given(method(GET))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).build().unwrap();
    client.get("/search").param("q", "rust").send().await.unwrap();

    let received = &server.received_requests().await.unwrap()[0];
    assert_eq!(received.url.query(), Some("q=rust"));
}

#[allow(dead_code)]
fn assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<Client>();
    check::<Request>();
    check::<Response>();
    check::<Error>();
    let _ = HashMap::<String, String>::new();
}
