//! Tower layers that enforce request rate limits.

mod burst;
pub mod presets;
mod rate_limiter;
mod tiered;

pub use burst::{
    BURST_RATE_LIMIT_EXCEEDED, BurstRateLimit, BurstRateLimitService, SUSTAINED_RATE_LIMIT_EXCEEDED,
};
pub use rate_limiter::{
    LimitOptions, RATE_LIMIT_EXCEEDED, RateLimit, RateLimitService, Rejection, default_key,
    default_rejection,
};
pub use tiered::{Tier, TieredRateLimit, TieredRateLimitService, UnknownTier, tier_key};
