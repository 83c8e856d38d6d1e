use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};

/// Per-connection inbound message rate limit, backed by `governor`'s token
/// bucket. Each connection owns its own limiter instance rather than sharing
/// a keyed limiter, since the registry already indexes connections and the
/// per-connection lifetime matches the bucket's lifetime exactly.
pub struct RateLimiter {
    inner: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl RateLimiter {
    pub fn new(per_second: u32, burst: u32) -> Self {
        let per_second = NonZeroU32::new(per_second.max(1)).expect("checked via max(1)");
        let burst = NonZeroU32::new(burst.max(1)).expect("checked via max(1)");
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self {
            inner: GovernorLimiter::direct(quota),
        }
    }

    /// Returns `true` if the message is allowed to proceed, consuming one
    /// token from the bucket.
    pub fn check(&self) -> bool {
        self.inner.check().is_ok()
    }
}

/// Shared handle, since the limiter sits behind a connection record that
/// multiple tasks (reader loop, chunk reassembly) may reference.
pub type SharedRateLimiter = Arc<RateLimiter>;

pub fn shared(per_second: u32, burst: u32) -> SharedRateLimiter {
    Arc::new(RateLimiter::new(per_second, burst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_capacity_is_consumed_then_exhausted() {
        let limiter = RateLimiter::new(1, 3);
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn a_single_token_bucket_allows_exactly_one_request_with_no_burst() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.check());
        assert!(!limiter.check());
    }
}
