use crate::clock::Clock;
use crate::config::LimiterConfig;
use crate::error::ConfigError;
use crate::rate_limit::Decision;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const MILLIS_PER_MINUTE: u64 = 60_000;

#[derive(Debug)]
struct BucketState {
    available: u32,
    last_refill_millis: u64,
}

/// A token bucket admitting up to `capacity` requests in a burst.
///
/// Replenishes `requests_per_minute / 60` tokens per second, in whole tokens only: time that
/// has not yet earned a full token keeps accruing, but once any token is credited the
/// fractional remainder is dropped. Very low rates therefore refill slightly slower than the
/// nominal rate.
///
/// Refill, check, and decrement happen under one lock, so concurrent callers can never
/// consume more than `capacity` tokens between refills.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    requests_per_minute: u32,
    state: Mutex<BucketState>,
    last_access_millis: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket. Both `capacity` and `requests_per_minute` must be positive.
    pub fn new(
        capacity: u32,
        requests_per_minute: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let config = LimiterConfig { requests_per_minute, burst_capacity: capacity };
        config.validate()?;
        Ok(Self::from_config(&config, clock))
    }

    /// Build from an already validated config.
    pub(crate) fn from_config(config: &LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            capacity: config.burst_capacity,
            requests_per_minute: config.requests_per_minute,
            state: Mutex::new(BucketState {
                available: config.burst_capacity,
                last_refill_millis: now,
            }),
            last_access_millis: AtomicU64::new(now),
            clock,
        }
    }

    /// Consume one token if available.
    pub fn try_consume(&self) -> bool {
        self.acquire().is_allowed()
    }

    /// Consume one token, reporting what is left or how long until the next token.
    pub fn acquire(&self) -> Decision {
        let mut state = self.lock_refilled();
        if state.available > 0 {
            state.available -= 1;
            Decision::Allowed { remaining: state.available }
        } else {
            Decision::Denied { retry_after: Duration::from_secs(self.secs_per_token()) }
        }
    }

    /// Tokens available right now, after refill. Never exceeds [`capacity`](Self::capacity).
    pub fn available_tokens(&self) -> u32 {
        self.lock_refilled().available
    }

    /// `0` while tokens remain, otherwise the whole seconds one token takes to accrue.
    pub fn seconds_until_next_token(&self) -> u64 {
        if self.available_tokens() > 0 {
            0
        } else {
            self.secs_per_token()
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate_per_second(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    /// Record use of this bucket for idle expiry.
    pub fn touch(&self) {
        self.last_access_millis.fetch_max(self.clock.now_millis(), Ordering::AcqRel);
    }

    pub fn last_access_millis(&self) -> u64 {
        self.last_access_millis.load(Ordering::Acquire)
    }

    fn secs_per_token(&self) -> u64 {
        // ceil(1 / rate) with rate = rpm / 60
        60u64.div_ceil(u64::from(self.requests_per_minute))
    }

    fn lock_refilled(&self) -> std::sync::MutexGuard<'_, BucketState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now_millis();
        // A clock reading older than the last refill credits nothing and never rewinds.
        let elapsed = now.saturating_sub(state.last_refill_millis);
        let earned = elapsed.saturating_mul(u64::from(self.requests_per_minute)) / MILLIS_PER_MINUTE;
        if earned > 0 {
            let refilled = u64::from(state.available).saturating_add(earned);
            state.available = refilled.min(u64::from(self.capacity)) as u32;
            state.last_refill_millis = now;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn new_bucket(capacity: u32, rpm: u32) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(capacity, rpm, Arc::new(clock.clone())).expect("valid");
        (bucket, clock)
    }

    #[test]
    fn rejects_non_positive_parameters() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        assert!(matches!(
            TokenBucket::new(0, 60, clock.clone()),
            Err(ConfigError::InvalidBurstCapacity { provided: 0 })
        ));
        assert!(matches!(
            TokenBucket::new(10, 0, clock),
            Err(ConfigError::InvalidRequestsPerMinute { provided: 0 })
        ));
    }

    #[test]
    fn exactly_capacity_consumptions_succeed() {
        let (bucket, _clock) = new_bucket(5, 60);
        for _ in 0..5 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());
        assert_eq!(bucket.available_tokens(), 0);
    }

    #[test]
    fn refills_one_token_per_second_at_sixty_rpm() {
        let (bucket, clock) = new_bucket(3, 60);
        while bucket.try_consume() {}
        clock.advance(Duration::from_millis(999));
        assert!(!bucket.try_consume());
        clock.advance(Duration::from_millis(1));
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let (bucket, clock) = new_bucket(4, 60);
        assert!(bucket.try_consume());
        clock.advance(Duration::from_secs(3600));
        assert_eq!(bucket.available_tokens(), 4);
    }

    #[test]
    fn fractional_accrual_is_not_credited_early() {
        // 1 rpm: one token per minute
        let (bucket, clock) = new_bucket(1, 1);
        assert!(bucket.try_consume());
        clock.advance(Duration::from_secs(59));
        assert_eq!(bucket.available_tokens(), 0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(bucket.available_tokens(), 1);
    }

    #[test]
    fn remainder_is_dropped_once_a_token_is_credited() {
        // 60 rpm, 1.5s elapsed credits one token; the spare 0.5s is discarded.
        let (bucket, clock) = new_bucket(2, 60);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        clock.advance(Duration::from_millis(1500));
        assert!(bucket.try_consume());
        clock.advance(Duration::from_millis(600));
        assert!(!bucket.try_consume());
        clock.advance(Duration::from_millis(400));
        assert!(bucket.try_consume());
    }

    #[test]
    fn seconds_until_next_token_reflects_state() {
        let (bucket, _clock) = new_bucket(1, 60);
        assert_eq!(bucket.seconds_until_next_token(), 0);
        assert!(bucket.try_consume());
        assert_eq!(bucket.seconds_until_next_token(), 1);

        let (slow, _clock) = new_bucket(1, 7);
        assert!(slow.try_consume());
        // 60 / 7 = 8.57.. -> 9
        assert_eq!(slow.seconds_until_next_token(), 9);
    }

    #[test]
    fn denied_decision_carries_retry_after() {
        let (bucket, _clock) = new_bucket(1, 30);
        assert_eq!(bucket.acquire(), Decision::Allowed { remaining: 0 });
        assert_eq!(bucket.acquire(), Decision::Denied { retry_after: Duration::from_secs(2) });
    }

    #[test]
    fn touch_never_moves_access_time_backwards() {
        let (bucket, clock) = new_bucket(1, 60);
        clock.set_millis(5_000);
        bucket.touch();
        clock.set_millis(1_000);
        bucket.touch();
        assert_eq!(bucket.last_access_millis(), 5_000);
    }

    #[test]
    fn concurrent_consumers_never_exceed_capacity() {
        let (bucket, _clock) = new_bucket(50, 60);
        let bucket = Arc::new(bucket);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                std::thread::spawn(move || (0..20).filter(|_| bucket.try_consume()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
