//! Per-method token bucket admission control.
//!
//! Each bucket is a `governor` GCRA limiter driven by the shared
//! [`Clock`](crate::infrastructure::clock::Clock), so tests step time by
//! hand. A bucket of `burst` cells regains one cell every `1 / rate`
//! seconds; a rate of zero never refills.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tonic::Status;

use crate::infrastructure::clock::SharedClock;
use crate::infrastructure::metrics;

/// Message returned to rejected callers.
pub const RATE_LIMIT_EXCEEDED: &str = "rate limit exceeded";

/// Rate and capacity of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Tokens added per second.
    pub requests_per_second: f64,
    /// Bucket capacity.
    pub burst: u32,
}

impl RateLimit {
    /// Create a limit.
    #[must_use]
    pub const fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
        }
    }
}

/// `governor` clock reading the injectable [`SharedClock`].
#[derive(Debug, Clone)]
struct LimiterClock(SharedClock);

impl governor::clock::Clock for LimiterClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        self.0.now()
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, LimiterClock, NoOpMiddleware<Instant>>;

/// Token bucket with an injectable clock.
pub struct TokenBucket {
    limit: RateLimit,
    // `None` for a zero burst: nothing is ever admitted.
    limiter: Option<DirectLimiter>,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(limit: RateLimit, clock: SharedClock) -> Self {
        let limiter = quota(limit)
            .map(|quota| RateLimiter::direct_with_clock(quota, LimiterClock(clock)));
        Self { limit, limiter }
    }

    /// Limit this bucket enforces.
    #[must_use]
    pub const fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.limiter
            .as_ref()
            .is_some_and(|limiter| limiter.check().is_ok())
    }
}

fn quota(limit: RateLimit) -> Option<Quota> {
    let burst = NonZeroU32::new(limit.burst)?;
    Quota::with_period(replenish_period(limit.requests_per_second, burst))
        .map(|quota| quota.allow_burst(burst))
}

/// Time to regain one cell. Zero, negative and non-finite rates get the
/// longest period whose `period * burst` still fits the limiter's
/// nanosecond arithmetic, which never refills in practice.
fn replenish_period(requests_per_second: f64, burst: NonZeroU32) -> Duration {
    let ceiling = Duration::from_nanos(u64::MAX / 4 / u64::from(burst.get()));
    if !(requests_per_second.is_finite() && requests_per_second > 0.0) {
        return ceiling;
    }
    Duration::try_from_secs_f64(requests_per_second.recip())
        .map_or(ceiling, |period| period.clamp(Duration::from_nanos(1), ceiling))
}

/// Default bucket plus optional per-method buckets.
///
/// Methods without their own limit share the default bucket.
#[derive(Debug)]
pub struct MethodRateLimiter {
    default: TokenBucket,
    methods: HashMap<String, TokenBucket>,
    clock: SharedClock,
}

impl MethodRateLimiter {
    /// Create a limiter with only a default bucket.
    #[must_use]
    pub fn new(default: RateLimit, clock: SharedClock) -> Self {
        Self {
            default: TokenBucket::new(default, clock.clone()),
            methods: HashMap::new(),
            clock,
        }
    }

    /// Give `method` its own bucket.
    #[must_use]
    pub fn with_method_limit(mut self, method: impl Into<String>, limit: RateLimit) -> Self {
        self.methods
            .insert(method.into(), TokenBucket::new(limit, self.clock.clone()));
        self
    }

    /// Admit or reject one call to `method`.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when the applicable bucket is empty.
    pub fn check(&self, method: &str) -> Result<(), Status> {
        let bucket = self.methods.get(method).unwrap_or(&self.default);
        if bucket.try_acquire() {
            Ok(())
        } else {
            metrics::record_rate_limited(method);
            tracing::warn!(method, "Rate limit exceeded");
            Err(Status::resource_exhausted(RATE_LIMIT_EXCEEDED))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::clock::{ManualClock, SystemClock};

    fn manual() -> Arc<ManualClock> {
        Arc::new(ManualClock::new())
    }

    fn drain(bucket: &TokenBucket) -> usize {
        std::iter::from_fn(|| bucket.try_acquire().then_some(())).count()
    }

    #[test]
    fn burst_then_reject_then_refill_one() {
        let clock = manual();
        let bucket = TokenBucket::new(RateLimit::new(4.0, 3), clock.clone());

        for _ in 0..3 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        clock.advance(Duration::from_millis(250));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test_case(3.0 ; "thirds")]
    #[test_case(7.0 ; "sevenths")]
    #[test_case(10.0 ; "tenths")]
    #[test_case(0.3 ; "below one per second")]
    fn waiting_one_interval_admits_exactly_one(rate: f64) {
        let clock = manual();
        let bucket = TokenBucket::new(RateLimit::new(rate, 2), clock.clone());
        assert_eq!(drain(&bucket), 2);

        clock.advance(Duration::from_secs_f64(1.0 / rate));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let clock = manual();
        let bucket = TokenBucket::new(RateLimit::new(100.0, 2), clock.clone());
        assert!(bucket.try_acquire());

        clock.advance(Duration::from_secs(60));
        assert_eq!(drain(&bucket), 2);
    }

    #[test]
    fn zero_rate_never_refills() {
        let clock = manual();
        let bucket = TokenBucket::new(RateLimit::new(0.0, 2), clock.clone());
        assert_eq!(drain(&bucket), 2);

        clock.advance(Duration::from_secs(86_400));
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn zero_burst_rejects_everything() {
        let clock = manual();
        let bucket = TokenBucket::new(RateLimit::new(10.0, 0), clock.clone());
        clock.advance(Duration::from_secs(1));
        assert!(!bucket.try_acquire());
    }

    #[test_case(f64::NAN ; "nan")]
    #[test_case(f64::INFINITY ; "infinite")]
    #[test_case(-5.0 ; "negative")]
    #[test_case(1e-30 ; "vanishing")]
    #[test_case(1e30 ; "huge")]
    fn degenerate_rates_build_a_bucket(rate: f64) {
        let bucket = TokenBucket::new(RateLimit::new(rate, 1), manual());
        assert!(bucket.try_acquire());
        assert_eq!(bucket.limit().burst, 1);
    }

    #[test]
    fn rejection_is_resource_exhausted() {
        let limiter = MethodRateLimiter::new(RateLimit::new(1.0, 1), manual());
        assert!(limiter.check("/svc/A").is_ok());

        let status = limiter.check("/svc/A").unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(status.message(), RATE_LIMIT_EXCEEDED);
    }

    #[test]
    fn method_buckets_are_independent() {
        let limiter = MethodRateLimiter::new(RateLimit::new(1.0, 1), manual())
            .with_method_limit("/svc/Hot", RateLimit::new(1.0, 2));

        assert!(limiter.check("/svc/Hot").is_ok());
        assert!(limiter.check("/svc/Hot").is_ok());
        assert!(limiter.check("/svc/Hot").is_err());

        // Default bucket untouched by the exhausted method bucket.
        assert!(limiter.check("/svc/Cold").is_ok());
        // Unconfigured methods share the default bucket.
        assert!(limiter.check("/svc/Other").is_err());
    }

    #[test]
    fn concurrent_callers_never_overspend() {
        let bucket = Arc::new(TokenBucket::new(
            RateLimit::new(0.0, 100),
            SystemClock::shared(),
        ));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if bucket.try_acquire() {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::Relaxed), 100);
    }

    proptest! {
        #[test]
        fn admissions_never_exceed_burst_plus_refill(
            burst in 0u32..50,
            rate in 0.1f64..1000.0,
            steps in prop::collection::vec((0u64..2000, 0usize..8), 1..64),
        ) {
            let clock = manual();
            let bucket = TokenBucket::new(RateLimit::new(rate, burst), clock.clone());
            let mut elapsed = Duration::ZERO;
            let mut admitted = 0usize;

            for (millis, tries) in steps {
                let step = Duration::from_millis(millis);
                clock.advance(step);
                elapsed += step;
                admitted += (0..tries).filter(|_| bucket.try_acquire()).count();

                #[allow(clippy::cast_precision_loss)]
                let ceiling = elapsed.as_secs_f64().mul_add(rate, f64::from(burst)) + 1.0;
                #[allow(clippy::cast_precision_loss)]
                let admitted_f = admitted as f64;
                prop_assert!(admitted_f <= ceiling);
            }
            if burst == 0 {
                prop_assert_eq!(admitted, 0);
            }
        }
    }
}
