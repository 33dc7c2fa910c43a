//! Clocks, exponential backoff and token-bucket pacing for outbound calls.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time source for everything that waits. Production code uses [`SystemClock`];
/// tests drive [`ManualClock`] so backoff and throttling run without real timers.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
    fn wall(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Virtual clock: `sleep` advances time instantly and records the requested duration.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    state: Mutex<ManualClockState>,
}

#[derive(Debug, Default)]
struct ManualClockState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new(wall_origin: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin,
            state: Mutex::new(ManualClockState::default()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.elapsed += by;
    }

    pub fn elapsed(&self) -> Duration {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed
    }

    /// Every non-zero duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sleeps
            .clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::MAX);
        self.wall_origin + elapsed
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32
            .checked_shl(u32::try_from(attempt_index).unwrap_or(u32::MAX))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// At most `requests` calls per `interval`, refilled one token at a time.
    pub fn per_interval(requests: u32, interval: Duration) -> Self {
        let capacity = requests.max(1);
        Self {
            capacity,
            refill_every: interval / capacity,
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    clock: Arc<dyn Clock>,
    state: tokio::sync::Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig, clock: Arc<dyn Clock>) -> Self {
        let last_refill = clock.now();
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            clock,
            state: tokio::sync::Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill,
            }),
        }
    }

    /// Wait until a token is available and consume it.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            if self.refill_every.is_zero() {
                return;
            }

            let now = self.clock.now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            if elapsed >= self.refill_every {
                let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
                if refills >= u128::from(self.capacity) {
                    state.tokens = self.capacity;
                    state.last_refill = now;
                } else {
                    // refills < capacity, so it fits in u32
                    let refills = refills as u32;
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    state.last_refill += self.refill_every * refills;
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let since_refill = now.saturating_duration_since(state.last_refill);
            let sleep_for = self.refill_every.saturating_sub(since_refill);
            drop(state);
            self.clock.sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }
}
