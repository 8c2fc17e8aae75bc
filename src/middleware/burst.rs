use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::{Request, Response};
use tower::Service;

use super::rate_limiter::{Check, LimitOptions, ResponseFuture, SharedService, enforce};
use crate::http::{Body, BoxError, HttpService, client_ip};
use crate::store::FixedWindowStore;

pub const BURST_RATE_LIMIT_EXCEEDED: &str = "BURST_RATE_LIMIT_EXCEEDED";
pub const SUSTAINED_RATE_LIMIT_EXCEEDED: &str = "SUSTAINED_RATE_LIMIT_EXCEEDED";

type KeyFn = Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>;

#[derive(Clone)]
struct Window {
    store: FixedWindowStore,
    max: u64,
}

impl Window {
    fn new(window: Duration, max: u64) -> Self {
        Self {
            store: FixedWindowStore::new(window, max),
            max,
        }
    }
}

/// Two stacked limits for the same caller: a short burst window and a
/// long sustained one. A request is rejected when either is exceeded.
///
/// The burst window is checked first. A request rejected there is not
/// counted against the sustained window.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use bulwark::middleware::BurstRateLimit;
///
/// // 10 per second, 300 per minute.
/// let limiter = BurstRateLimit::new(
///     (Duration::from_secs(1), 10),
///     (Duration::from_secs(60), 300),
/// );
/// ```
#[derive(Clone)]
pub struct BurstRateLimit {
    burst: Window,
    sustained: Window,
    key_fn: KeyFn,
    options: LimitOptions,
}

impl BurstRateLimit {
    /// `burst` and `sustained` are `(window, max)` pairs.
    pub fn new(burst: (Duration, u64), sustained: (Duration, u64)) -> Self {
        Self {
            burst: Window::new(burst.0, burst.1),
            sustained: Window::new(sustained.0, sustained.1),
            key_fn: Arc::new(|req| client_ip(req).unwrap_or("unknown").to_string()),
            options: LimitOptions::default(),
        }
    }

    /// Identify the caller. Both windows prefix the returned value with
    /// `burst:` and `sustained:` respectively.
    pub fn key_fn(mut self, f: impl Fn(&Request<Body>) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Arc::new(f);
        self
    }

    pub fn options(mut self, options: LimitOptions) -> Self {
        self.options = options;
        self
    }
}

impl tower::Layer<HttpService> for BurstRateLimit {
    type Service = BurstRateLimitService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        BurstRateLimitService {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            limit: self.clone(),
        }
    }
}

pub struct BurstRateLimitService {
    inner: SharedService,
    limit: BurstRateLimit,
}

impl Service<Request<Body>> for BurstRateLimitService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let caller = (self.limit.key_fn)(&req);
        let checks = vec![
            Check {
                store: self.limit.burst.store.clone(),
                key: format!("burst:{caller}"),
                limit: self.limit.burst.max,
                code: BURST_RATE_LIMIT_EXCEEDED,
                message: Some(Arc::from("Burst rate limit exceeded")),
            },
            Check {
                store: self.limit.sustained.store.clone(),
                key: format!("sustained:{caller}"),
                limit: self.limit.sustained.max,
                code: SUSTAINED_RATE_LIMIT_EXCEEDED,
                message: Some(Arc::from("Sustained rate limit exceeded")),
            },
        ];
        Box::pin(enforce(checks, req, self.inner.clone(), self.limit.options.clone()))
    }
}
