use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use tower::Service;

use crate::http::{Body, BoxError, HttpService, client_ip, json_body};
use crate::store::{FixedWindowStore, RateLimitInfo, RateLimitStore, SlidingWindowStore};

type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;
type SkipFn = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;
type Handler = Arc<dyn Fn(&Rejection<'_>) -> Response<Body> + Send + Sync>;
pub(crate) type ResponseFuture =
    Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;
pub(crate) type SharedService = Arc<tokio::sync::Mutex<HttpService>>;

pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_MAX: u64 = 100;

static RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
static RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
static RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// A request that went over its limit, as seen by a rejection handler.
#[derive(Debug)]
pub struct Rejection<'a> {
    pub key: &'a str,
    pub path: &'a str,
    pub info: &'a RateLimitInfo,
    pub message: &'a str,
    pub code: &'a str,
}

impl Rejection<'_> {
    /// Whole seconds until the window frees up, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        retry_after_secs(self.info)
    }
}

/// The default 429 response:
/// `{"error":{"message":..,"code":..,"retryAfter":<secs>}}`.
pub fn default_rejection(rejection: &Rejection<'_>) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "message": rejection.message,
            "code": rejection.code,
            "retryAfter": rejection.retry_after_secs(),
        }
    });
    let mut response = Response::new(json_body(&body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Response shaping shared by every rate-limit layer.
#[derive(Clone)]
pub struct LimitOptions {
    message: Arc<str>,
    standard_headers: bool,
    legacy_headers: bool,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
    handler: Option<Handler>,
}

impl Default for LimitOptions {
    fn default() -> Self {
        Self {
            message: Arc::from(DEFAULT_MESSAGE),
            standard_headers: true,
            legacy_headers: false,
            skip_successful_requests: false,
            skip_failed_requests: false,
            handler: None,
        }
    }
}

impl LimitOptions {
    /// Text of the rejection message.
    pub fn message(mut self, message: impl Into<Arc<str>>) -> Self {
        self.message = message.into();
        self
    }

    /// Emit `RateLimit-Limit`, `RateLimit-Remaining` and `RateLimit-Reset`.
    /// On by default.
    pub fn standard_headers(mut self, enabled: bool) -> Self {
        self.standard_headers = enabled;
        self
    }

    /// Emit `X-RateLimit-Limit`, `X-RateLimit-Remaining` and
    /// `X-RateLimit-Reset` (unix seconds). Off by default.
    pub fn legacy_headers(mut self, enabled: bool) -> Self {
        self.legacy_headers = enabled;
        self
    }

    /// Un-count requests answered with a status below 400.
    pub fn skip_successful_requests(mut self, enabled: bool) -> Self {
        self.skip_successful_requests = enabled;
        self
    }

    /// Un-count requests that fail or are answered with 400 or above.
    pub fn skip_failed_requests(mut self, enabled: bool) -> Self {
        self.skip_failed_requests = enabled;
        self
    }

    /// Build rejection responses with `handler` instead of the JSON default.
    /// Rate-limit headers are still added to whatever it returns.
    pub fn handler(
        mut self,
        handler: impl Fn(&Rejection<'_>) -> Response<Body> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }
}

/// One counter consulted for a request.
pub(crate) struct Check<S> {
    pub store: S,
    pub key: String,
    pub limit: u64,
    pub code: &'static str,
    pub message: Option<Arc<str>>,
}

fn retry_after_secs(info: &RateLimitInfo) -> u64 {
    let millis = info.reset_after().as_millis().div_ceil(1000);
    u64::try_from(millis).unwrap_or(u64::MAX).max(1)
}

fn apply_headers(headers: &mut HeaderMap, info: &RateLimitInfo, options: &LimitOptions) {
    let reset_at = SystemTime::now() + info.reset_after();

    if options.standard_headers {
        headers.insert(RATELIMIT_LIMIT.clone(), HeaderValue::from(info.limit));
        headers.insert(RATELIMIT_REMAINING.clone(), HeaderValue::from(info.remaining));
        let stamp = DateTime::<Utc>::from(reset_at).to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Ok(value) = HeaderValue::from_str(&stamp) {
            headers.insert(RATELIMIT_RESET.clone(), value);
        }
    }

    if options.legacy_headers {
        headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(info.limit));
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(info.remaining));
        let unix = reset_at
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis().div_ceil(1000));
        headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(unix as u64));
    }
}

/// Hand `req` to the downstream service. The lock is held only until the
/// service has accepted the request.
pub(crate) async fn forward(
    inner: SharedService,
    req: Request<Body>,
) -> Result<Response<Body>, BoxError> {
    let fut = {
        let mut svc = inner.lock().await;
        std::future::poll_fn(|cx| svc.poll_ready(cx)).await?;
        svc.call(req)
    };
    fut.await
}

/// Count the request against every check in order, then either reject it
/// or forward it to `inner`.
///
/// The first exceeded check rejects the request and later checks are not
/// counted. On success the headers describe the check with the fewest
/// requests remaining.
pub(crate) async fn enforce<S: RateLimitStore>(
    checks: Vec<Check<S>>,
    req: Request<Body>,
    inner: SharedService,
    options: LimitOptions,
) -> Result<Response<Body>, BoxError> {
    let path = req.uri().path().to_string();
    let mut tightest: Option<RateLimitInfo> = None;

    for check in &checks {
        let info = check.store.increment(&check.key).await.with_limit(check.limit);
        if info.is_exceeded() {
            tracing::warn!(
                key = %check.key,
                path = %path,
                current = info.current,
                limit = info.limit,
                code = check.code,
                "rate limit exceeded"
            );

            let rejection = Rejection {
                key: &check.key,
                path: &path,
                info: &info,
                message: check.message.as_deref().unwrap_or(&options.message),
                code: check.code,
            };
            let mut response = match &options.handler {
                Some(handler) => handler(&rejection),
                None => default_rejection(&rejection),
            };
            apply_headers(response.headers_mut(), &info, &options);
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(&info)));
            return Ok(response);
        }
        tightest = Some(match tightest {
            Some(prev) if prev.remaining <= info.remaining => prev,
            _ => info,
        });
    }

    let result = forward(inner, req).await;

    let failed = !result
        .as_ref()
        .is_ok_and(|response| response.status().as_u16() < 400);
    if (failed && options.skip_failed_requests) || (!failed && options.skip_successful_requests) {
        for check in &checks {
            check.store.decrement(&check.key).await;
        }
    }

    let mut response = result?;
    if let Some(info) = tightest {
        apply_headers(response.headers_mut(), &info, &options);
    }
    Ok(response)
}

/// `rate-limit:<client ip>`, or `rate-limit:unknown` without proxy headers.
pub fn default_key(req: &Request<Body>) -> String {
    format!("rate-limit:{}", client_ip(req).unwrap_or("unknown"))
}

/// Tower layer that rejects requests over a per-key limit with
/// `429 Too Many Requests`.
///
/// Each request is counted against the key returned by the key function
/// (the client address by default). While the key is under its limit the
/// request is forwarded and the response carries the current usage in
/// `RateLimit-*` headers; once over, the downstream service is never
/// invoked and a JSON rejection is returned with `Retry-After`.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use bulwark::middleware::RateLimit;
///
/// let limiter = RateLimit::new(Duration::from_secs(60), 100)
///     .key_fn(|req| {
///         let key = req
///             .headers()
///             .get("x-api-key")
///             .and_then(|v| v.to_str().ok())
///             .unwrap_or("anonymous");
///         format!("api-key:{key}")
///     })
///     .legacy_headers(true);
/// ```
pub struct RateLimit<S: RateLimitStore = FixedWindowStore> {
    store: S,
    max: u64,
    key_fn: KeyFn,
    skip: Option<SkipFn>,
    options: LimitOptions,
}

impl<S: RateLimitStore> Clone for RateLimit<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            max: self.max,
            key_fn: self.key_fn.clone(),
            skip: self.skip.clone(),
            options: self.options.clone(),
        }
    }
}

impl Default for RateLimit {
    /// 100 requests per minute per client address.
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX)
    }
}

impl RateLimit {
    /// Fixed-window limit of `max` requests per `window`.
    pub fn new(window: Duration, max: u64) -> Self {
        Self::with_store(FixedWindowStore::new(window, max), max)
    }
}

impl RateLimit<SlidingWindowStore> {
    /// Sliding-window limit of `max` requests in any `window`-long span.
    pub fn sliding(window: Duration, max: u64) -> Self {
        Self::with_store(SlidingWindowStore::new(window, max), max)
    }
}

impl<S: RateLimitStore> RateLimit<S> {
    /// Limit to `max` requests using a caller-provided store. The store may
    /// be shared with other layers.
    pub fn with_store(store: S, max: u64) -> Self {
        Self {
            store,
            max,
            key_fn: Arc::new(default_key),
            skip: None,
            options: LimitOptions::default(),
        }
    }

    /// Derive the counter key from each request.
    pub fn key_fn(mut self, f: impl Fn(&Request<Body>) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Arc::new(f);
        self
    }

    /// Let requests matching `f` through without counting them.
    pub fn skip(mut self, f: impl Fn(&Request<Body>) -> bool + Send + Sync + 'static) -> Self {
        self.skip = Some(Arc::new(f));
        self
    }

    pub fn message(mut self, message: impl Into<Arc<str>>) -> Self {
        self.options = self.options.message(message);
        self
    }

    pub fn standard_headers(mut self, enabled: bool) -> Self {
        self.options = self.options.standard_headers(enabled);
        self
    }

    pub fn legacy_headers(mut self, enabled: bool) -> Self {
        self.options = self.options.legacy_headers(enabled);
        self
    }

    pub fn skip_successful_requests(mut self, enabled: bool) -> Self {
        self.options = self.options.skip_successful_requests(enabled);
        self
    }

    pub fn skip_failed_requests(mut self, enabled: bool) -> Self {
        self.options = self.options.skip_failed_requests(enabled);
        self
    }

    pub fn handler(
        mut self,
        handler: impl Fn(&Rejection<'_>) -> Response<Body> + Send + Sync + 'static,
    ) -> Self {
        self.options = self.options.handler(handler);
        self
    }

    /// Replace all response options at once.
    pub fn options(mut self, options: LimitOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: RateLimitStore> tower::Layer<HttpService> for RateLimit<S> {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: HttpService) -> Self::Service {
        RateLimitService {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            limit: self.clone(),
        }
    }
}

pub struct RateLimitService<S: RateLimitStore = FixedWindowStore> {
    inner: SharedService,
    limit: RateLimit<S>,
}

impl<S: RateLimitStore> Service<Request<Body>> for RateLimitService<S> {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        if self.limit.skip.as_ref().is_some_and(|skip| skip(&req)) {
            return Box::pin(forward(inner, req));
        }

        let check = Check {
            store: self.limit.store.clone(),
            key: (self.limit.key_fn)(&req),
            limit: self.limit.max,
            code: RATE_LIMIT_EXCEEDED,
            message: None,
        };
        let options = self.limit.options.clone();

        Box::pin(enforce(vec![check], req, inner, options))
    }
}
