use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::{Request, Response};
use serde::Deserialize;
use thiserror::Error;
use tower::Service;

use super::presets::user_id;
use super::rate_limiter::{
    Check, LimitOptions, RATE_LIMIT_EXCEEDED, ResponseFuture, SharedService, enforce, forward,
};
use crate::http::{Body, BoxError, HttpService, client_ip};
use crate::store::FixedWindowStore;

/// Service plan of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Pro, Tier::Enterprise];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Requests per minute granted to the tier.
    pub fn default_limit(self) -> u64 {
        match self {
            Tier::Free => 60,
            Tier::Basic => 300,
            Tier::Pro => 1000,
            Tier::Enterprise => 10_000,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown tier `{0}`")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownTier(s.to_string()))
    }
}

type TierFn = Arc<dyn Fn(&Request<Body>) -> Tier + Send + Sync>;

#[derive(Clone)]
struct TierLimit {
    store: FixedWindowStore,
    max: u64,
}

/// Rate limit whose window and ceiling depend on the caller's [`Tier`].
///
/// Every tier counts in its own store under the key built by [`tier_key`],
/// so a caller moving between tiers starts with a fresh allowance. Defaults
/// are one-minute windows with [`Tier::default_limit`] requests.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use bulwark::middleware::{Tier, TieredRateLimit};
///
/// let limiter = TieredRateLimit::from_header("x-plan")
///     .limit(Tier::Free, Duration::from_secs(60), 30);
/// ```
#[derive(Clone)]
pub struct TieredRateLimit {
    tiers: HashMap<Tier, TierLimit>,
    tier_fn: TierFn,
    options: LimitOptions,
}

impl TieredRateLimit {
    /// Resolve each request's tier with `tier_fn`.
    pub fn new(tier_fn: impl Fn(&Request<Body>) -> Tier + Send + Sync + 'static) -> Self {
        let tiers = Tier::ALL
            .into_iter()
            .map(|tier| {
                let max = tier.default_limit();
                let store = FixedWindowStore::new(Duration::from_secs(60), max);
                (tier, TierLimit { store, max })
            })
            .collect();
        Self {
            tiers,
            tier_fn: Arc::new(tier_fn),
            options: LimitOptions::default(),
        }
    }

    /// Read the tier from a request header. Missing or unrecognized values
    /// fall back to [`Tier::Free`].
    pub fn from_header(name: &'static str) -> Self {
        Self::new(move |req| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        })
    }

    /// Override the window and ceiling of one tier.
    pub fn limit(mut self, tier: Tier, window: Duration, max: u64) -> Self {
        let store = FixedWindowStore::new(window, max);
        self.tiers.insert(tier, TierLimit { store, max });
        self
    }

    pub fn options(mut self, options: LimitOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_for(&self, tier: Tier) -> Option<u64> {
        self.tiers.get(&tier).map(|t| t.max)
    }
}

/// `api:<tier>:<x-user-id | client ip | anonymous>`.
pub fn tier_key(tier: Tier, req: &Request<Body>) -> String {
    let caller = user_id(req).or_else(|| client_ip(req)).unwrap_or("anonymous");
    format!("api:{tier}:{caller}")
}

impl tower::Layer<HttpService> for TieredRateLimit {
    type Service = TieredRateLimitService;

    fn layer(&self, inner: HttpService) -> Self::Service {
        TieredRateLimitService {
            inner: Arc::new(tokio::sync::Mutex::new(inner)),
            tiers: Arc::new(self.tiers.clone()),
            tier_fn: self.tier_fn.clone(),
            options: self.options.clone(),
        }
    }
}

pub struct TieredRateLimitService {
    inner: SharedService,
    tiers: Arc<HashMap<Tier, TierLimit>>,
    tier_fn: TierFn,
    options: LimitOptions,
}

impl Service<Request<Body>> for TieredRateLimitService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let tier = (self.tier_fn)(&req);
        let Some(limit) = self
            .tiers
            .get(&tier)
            .or_else(|| self.tiers.get(&Tier::Free))
        else {
            return Box::pin(forward(self.inner.clone(), req));
        };

        let check = Check {
            store: limit.store.clone(),
            key: tier_key(tier, &req),
            limit: limit.max,
            code: RATE_LIMIT_EXCEEDED,
            message: None,
        };
        Box::pin(enforce(vec![check], req, self.inner.clone(), self.options.clone()))
    }
}
