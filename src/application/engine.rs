//! Per-request decision pipeline: authenticate, derive key, consult the
//! cache, forward on miss, store cacheable responses.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::cache::{
    CacheConfig, CacheKey, CacheStore, CachedResponse, KeyBuilder, Lookup, PartnerIdentity,
    StoreError,
};

use super::error::ProxyError;
use super::upstream::{ProxyRequest, Upstream, UpstreamResponse};

pub const METRIC_CACHE_HIT: &str = "cacher_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "cacher_cache_miss_total";
pub const METRIC_STORE_ERROR: &str = "cacher_store_error_total";
pub const METRIC_WRITE_SKIPPED: &str = "cacher_cache_write_skipped_total";
pub const METRIC_UPSTREAM_ERROR: &str = "cacher_upstream_error_total";

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// Response handed back to the client, either replayed or freshly fetched.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cache: CacheStatus,
}

impl ProxyResponse {
    fn fetched(upstream: UpstreamResponse) -> Self {
        Self {
            status: upstream.status,
            headers: upstream.headers,
            body: upstream.body,
            cache: CacheStatus::Miss,
        }
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response.extensions_mut().insert(self.cache);
        response
    }
}

/// Caller identity and cache key, settled from the request head alone.
#[derive(Clone)]
pub struct Admission {
    identity: PartnerIdentity,
    key: CacheKey,
}

impl Admission {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("identity", &self.identity)
            .field("key", &"<redacted>")
            .finish()
    }
}

pub struct ProxyEngine {
    keys: KeyBuilder,
    store: CacheStore,
    upstream: Arc<dyn Upstream>,
    entry_ttl: Duration,
}

impl ProxyEngine {
    pub fn new(config: &CacheConfig, store: CacheStore, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            keys: config.key_builder(),
            store,
            upstream,
            entry_ttl: config.entry_ttl,
        }
    }

    /// Authenticate and classify without touching the body, the store or
    /// the backend.
    pub fn admit(&self, headers: &HeaderMap, uri: &Uri) -> Result<Admission, ProxyError> {
        let identity = PartnerIdentity::from_headers(headers).ok_or(ProxyError::Unauthorized)?;
        let key = self.keys.derive(&identity, uri.path())?;
        Ok(Admission { identity, key })
    }

    pub async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let admission = self.admit(&request.headers, &request.uri)?;
        self.serve(admission, request).await
    }

    #[instrument(
        name = "proxy_request",
        skip_all,
        fields(method = %request.method, path = %request.path())
    )]
    pub async fn serve(
        &self,
        admission: Admission,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let Admission { identity, key } = admission;

        match self.store.read(&key).await {
            Lookup::Hit(cached) => match cached.into_parts() {
                Ok((status, headers, body)) => {
                    counter!(METRIC_CACHE_HIT).increment(1);
                    debug!(
                        target = "application::engine",
                        partner_id = identity.partner_id(),
                        status = status.as_u16(),
                        "cache hit"
                    );
                    return Ok(ProxyResponse {
                        status,
                        headers,
                        body,
                        cache: CacheStatus::Hit,
                    });
                }
                Err(err) => self.record_store_error("read", &err),
            },
            Lookup::Miss => {
                counter!(METRIC_CACHE_MISS).increment(1);
                debug!(
                    target = "application::engine",
                    partner_id = identity.partner_id(),
                    "cache miss"
                );
            }
            Lookup::Unavailable(err) => self.record_store_error("read", &err),
        }

        let upstream = self.upstream.forward(request).await.map_err(|err| {
            counter!(METRIC_UPSTREAM_ERROR).increment(1);
            ProxyError::from(err)
        })?;

        if is_cacheable(upstream.status) {
            self.persist(&key, &upstream).await;
        } else {
            counter!(METRIC_WRITE_SKIPPED, "reason" => "server_error").increment(1);
            debug!(
                target = "application::engine",
                status = upstream.status.as_u16(),
                "server error response not cached"
            );
        }

        Ok(ProxyResponse::fetched(upstream))
    }

    async fn persist(&self, key: &CacheKey, upstream: &UpstreamResponse) {
        let envelope =
            match CachedResponse::capture(upstream.status, &upstream.headers, &upstream.body) {
                Ok(envelope) => envelope,
                Err(err) => {
                    counter!(METRIC_WRITE_SKIPPED, "reason" => err.kind()).increment(1);
                    warn!(
                        target = "application::engine",
                        status = upstream.status.as_u16(),
                        error = %err,
                        "response could not be captured for caching"
                    );
                    return;
                }
            };

        if let Err(err) = self.store.write(key, &envelope, self.entry_ttl).await {
            self.record_store_error("write", &err);
        }
    }

    fn record_store_error(&self, op: &'static str, err: &StoreError) {
        counter!(METRIC_STORE_ERROR, "op" => op).increment(1);
        warn!(
            target = "application::engine",
            op,
            kind = err.kind(),
            error = %err,
            "cache store operation failed"
        );
    }
}

/// Anything below 500 is stored, including client errors.
fn is_cacheable(status: StatusCode) -> bool {
    status.as_u16() < 500
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::http::{HeaderValue, Method, header};

    use super::*;
    use crate::application::upstream::UpstreamError;
    use crate::cache::{MemoryStore, ResponseStore};

    const SPORTS: &str = "/v1/bet_insights/partner-sports";
    const SPORTS_KEY: &str = ":1:123_tok_v1_bet_insights_partner_sports";

    struct FakeUpstream {
        calls: AtomicUsize,
        status: StatusCode,
        body: Bytes,
        fail: bool,
    }

    impl FakeUpstream {
        fn responding(status: StatusCode, body: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                status,
                body: Bytes::from_static(body),
                fail: false,
            })
        }

        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                status: StatusCode::OK,
                body: Bytes::new(),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn forward(
            &self,
            _request: ProxyRequest,
        ) -> Result<UpstreamResponse, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UpstreamError::Request {
                    target: "http://backend.test".to_string(),
                    source: "connection refused".into(),
                });
            }
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            Ok(UpstreamResponse {
                status: self.status,
                headers,
                body: self.body.clone(),
            })
        }
    }

    /// Memory store that records every call and can be switched offline.
    struct RecordingStore {
        inner: MemoryStore,
        gets: AtomicUsize,
        sets: Mutex<Vec<(String, Duration)>>,
        offline: bool,
    }

    impl RecordingStore {
        fn new(offline: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(NonZeroUsize::new(16).expect("capacity")),
                gets: AtomicUsize::new(0),
                sets: Mutex::new(Vec::new()),
                offline,
            })
        }

        fn set_calls(&self) -> Vec<(String, Duration)> {
            self.sets.lock().expect("sets lock").clone()
        }
    }

    #[async_trait]
    impl ResponseStore for RecordingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(StoreError::unavailable("connection refused"));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, payload: String, ttl: Duration) -> Result<(), StoreError> {
            self.sets
                .lock()
                .expect("sets lock")
                .push((key.to_string(), ttl));
            if self.offline {
                return Err(StoreError::unavailable("connection refused"));
            }
            self.inner.set(key, payload, ttl).await
        }
    }

    fn engine(store: Arc<RecordingStore>, upstream: Arc<FakeUpstream>) -> ProxyEngine {
        ProxyEngine::new(
            &CacheConfig::default(),
            CacheStore::new(store),
            upstream,
        )
    }

    fn request(path: &str, partner: Option<&str>, token: Option<&str>) -> ProxyRequest {
        let mut headers = HeaderMap::new();
        if let Some(partner) = partner {
            headers.insert("partner-id", HeaderValue::from_str(partner).expect("header"));
        }
        if let Some(token) = token {
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(token).expect("header"),
            );
        }
        ProxyRequest {
            method: Method::GET,
            uri: path.parse::<Uri>().expect("uri"),
            headers,
            body: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn missing_credentials_touch_nothing() {
        let store = RecordingStore::new(false);
        let upstream = FakeUpstream::responding(StatusCode::OK, b"{}");
        let engine = engine(store.clone(), upstream.clone());

        for req in [
            request(SPORTS, None, Some("tok")),
            request(SPORTS, Some("123"), None),
            request(SPORTS, Some(""), Some("tok")),
        ] {
            let err = engine.handle(req).await.expect_err("must be rejected");
            assert!(matches!(err, ProxyError::Unauthorized));
        }
        assert_eq!(store.gets.load(Ordering::SeqCst), 0);
        assert!(store.set_calls().is_empty());
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected_before_store() {
        let store = RecordingStore::new(false);
        let upstream = FakeUpstream::responding(StatusCode::OK, b"{}");
        let engine = engine(store.clone(), upstream.clone());

        let err = engine
            .handle(request("/unknown/route", Some("123"), Some("tok")))
            .await
            .expect_err("must be rejected");
        assert!(matches!(err, ProxyError::UnknownResource(_)));
        assert_eq!(store.gets.load(Ordering::SeqCst), 0);
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn miss_then_hit_replays_without_upstream() {
        let store = RecordingStore::new(false);
        let upstream = FakeUpstream::responding(StatusCode::OK, br#"{"x":1}"#);
        let engine = engine(store.clone(), upstream.clone());

        let first = engine
            .handle(request(SPORTS, Some("123"), Some("tok")))
            .await
            .expect("first");
        assert_eq!(first.cache, CacheStatus::Miss);
        assert_eq!(
            store.set_calls(),
            vec![(SPORTS_KEY.to_string(), Duration::from_secs(1800))]
        );

        let second = engine
            .handle(request(SPORTS, Some("123"), Some("tok")))
            .await
            .expect("second");
        assert_eq!(second.cache, CacheStatus::Hit);
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.body, first.body);
        assert_eq!(
            second.headers.get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn client_errors_are_cached_server_errors_are_not() {
        let store = RecordingStore::new(false);
        let engine_499 = engine(
            store.clone(),
            FakeUpstream::responding(StatusCode::from_u16(499).expect("status"), b"nope"),
        );
        engine_499
            .handle(request(SPORTS, Some("123"), Some("tok")))
            .await
            .expect("499");
        assert_eq!(store.set_calls().len(), 1);

        let store = RecordingStore::new(false);
        let upstream = FakeUpstream::responding(StatusCode::SERVICE_UNAVAILABLE, b"busy");
        let engine_503 = engine(store.clone(), upstream.clone());
        for _ in 0..2 {
            let response = engine_503
                .handle(request(SPORTS, Some("123"), Some("tok")))
                .await
                .expect("503 passes through");
            assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(response.body, Bytes::from_static(b"busy"));
        }
        assert!(store.set_calls().is_empty());
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn internal_server_error_is_passed_through_uncached() {
        let store = RecordingStore::new(false);
        let upstream = FakeUpstream::responding(StatusCode::INTERNAL_SERVER_ERROR, b"boom");
        let engine = engine(store.clone(), upstream.clone());

        let response = engine
            .handle(request(SPORTS, Some("123"), Some("tok")))
            .await
            .expect("500 passes through");
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.body, Bytes::from_static(b"boom"));
        assert_eq!(response.cache, CacheStatus::Miss);
        assert!(store.set_calls().is_empty());
    }

    #[test]
    fn admission_needs_only_the_request_head() {
        let engine = engine(
            RecordingStore::new(false),
            FakeUpstream::responding(StatusCode::OK, b"{}"),
        );
        let uri: Uri = SPORTS.parse().expect("uri");

        let admitted = engine
            .admit(&request(SPORTS, Some("123"), Some("tok")).headers, &uri)
            .expect("admitted");
        assert_eq!(admitted.key().as_str(), SPORTS_KEY);

        let err = engine
            .admit(&HeaderMap::new(), &uri)
            .expect_err("no credentials");
        assert!(matches!(err, ProxyError::Unauthorized));

        let unknown: Uri = "/unknown/route".parse().expect("uri");
        let err = engine
            .admit(&request(SPORTS, Some("123"), Some("tok")).headers, &unknown)
            .expect_err("unknown route");
        assert!(matches!(err, ProxyError::UnknownResource(_)));
    }

    #[tokio::test]
    async fn store_outage_degrades_to_passthrough() {
        let store = RecordingStore::new(true);
        let upstream = FakeUpstream::responding(StatusCode::OK, b"fresh");
        let engine = engine(store.clone(), upstream.clone());

        let response = engine
            .handle(request(SPORTS, Some("123"), Some("tok")))
            .await
            .expect("served from upstream");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"fresh"));
        assert_eq!(upstream.calls(), 1);
        assert_eq!(store.set_calls().len(), 1);
    }

    #[tokio::test]
    async fn upstream_failure_is_not_cached() {
        let store = RecordingStore::new(false);
        let upstream = FakeUpstream::unreachable();
        let engine = engine(store.clone(), upstream.clone());

        let err = engine
            .handle(request(SPORTS, Some("123"), Some("tok")))
            .await
            .expect_err("upstream down");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            err.public_message(),
            "Failed to make request to remote server."
        );
        assert!(store.set_calls().is_empty());
    }

    #[tokio::test]
    async fn binary_body_is_served_but_not_cached() {
        let store = RecordingStore::new(false);
        let upstream = FakeUpstream::responding(StatusCode::OK, &[0xff, 0xfe, 0x00]);
        let engine = engine(store.clone(), upstream.clone());

        let response = engine
            .handle(request(SPORTS, Some("123"), Some("tok")))
            .await
            .expect("served");
        assert_eq!(response.body.as_ref(), &[0xff, 0xfe, 0x00]);
        assert!(store.set_calls().is_empty());
    }

    #[tokio::test]
    async fn corrupt_entry_falls_through_and_is_overwritten() {
        let store = RecordingStore::new(false);
        store
            .inner
            .set(SPORTS_KEY, "not json".to_string(), Duration::from_secs(60))
            .await
            .expect("seed");
        let upstream = FakeUpstream::responding(StatusCode::OK, b"fresh");
        let engine = engine(store.clone(), upstream.clone());

        let response = engine
            .handle(request(SPORTS, Some("123"), Some("tok")))
            .await
            .expect("served");
        assert_eq!(response.cache, CacheStatus::Miss);
        assert_eq!(upstream.calls(), 1);

        let replay = engine
            .handle(request(SPORTS, Some("123"), Some("tok")))
            .await
            .expect("replayed");
        assert_eq!(replay.cache, CacheStatus::Hit);
        assert_eq!(replay.body, Bytes::from_static(b"fresh"));
    }

    #[test]
    fn response_conversion_keeps_status_headers_and_marker() {
        let mut headers = HeaderMap::new();
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));
        let response = ProxyResponse {
            status: StatusCode::ACCEPTED,
            headers,
            body: Bytes::from_static(b"ok"),
            cache: CacheStatus::Hit,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let values: Vec<_> = response.headers().get_all("x-multi").iter().collect();
        assert_eq!(values, vec!["a", "b"]);
        assert_eq!(
            response.extensions().get::<CacheStatus>(),
            Some(&CacheStatus::Hit)
        );
    }
}
