// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: retry backoff, per-config rate limiting, and a
//! global transport throttle.
//!
//! - [`RetryPolicy`]: bounded exponential backoff shared by the scheduler
//!   and the sequential workers
//! - [`ChannelRateLimiter`]: token bucket per replication config, refilled
//!   lazily in whole minutes
//! - [`TransportThrottle`]: process-wide ceiling on outbound transport calls
//!
//! # Example
//!
//! ```rust
//! use channel_replication::resilience::{ChannelRateLimiter, RetryPolicy};
//! use std::time::Duration;
//!
//! let limiter = ChannelRateLimiter::new();
//! assert!(limiter.try_acquire(7, 1));
//! assert!(!limiter.try_acquire(7, 1)); // bucket empty until the next minute
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(2), Duration::from_secs(60));
//! assert_eq!(policy.next_delay(1), Duration::from_secs(4));
//! ```

use crate::config::ConfigId;
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff.
///
/// `attempt` is zero-based: the delay after the first failure is
/// `next_delay(0) == base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Ceiling for exponential growth.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Media-group batches: fewer attempts, re-sending an album is costly.
    pub fn batch() -> Self {
        Self {
            max_attempts: 2,
            ..Self::default()
        }
    }

    /// Fast-fail policy for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

// =============================================================================
// Per-config token bucket
// =============================================================================

const REFILL_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: u32,
    capacity: u32,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            last_refill: now,
        }
    }

    /// Add `rate` tokens per whole elapsed minute, capped at capacity.
    /// The fractional minute is carried over by advancing `last_refill`
    /// only by the whole minutes consumed.
    fn refill(&mut self, rate: u32, now: Instant) {
        if self.capacity != rate {
            self.capacity = rate;
            self.tokens = self.tokens.min(rate);
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let minutes = (elapsed.as_millis() / REFILL_PERIOD.as_millis()) as u64;
        if minutes == 0 {
            return;
        }

        let added = minutes.saturating_mul(u64::from(rate));
        let tokens = (u64::from(self.tokens) + added).min(u64::from(self.capacity));
        self.tokens = tokens as u32;
        self.last_refill += REFILL_PERIOD * minutes.min(u64::from(u32::MAX)) as u32;
    }
}

/// Point-in-time view of one config's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimiterSnapshot {
    pub tokens: u32,
    pub capacity: u32,
    /// Time until the next whole-minute refill.
    pub refill_in: Duration,
}

/// Token bucket rate limiter keyed by config id.
///
/// Buckets are created lazily and full. There is no background timer:
/// every check refills first. Check-and-decrement happens under the map
/// shard lock, so concurrent deliveries for one config never spend the
/// same token twice.
#[derive(Debug, Default)]
pub struct ChannelRateLimiter {
    buckets: DashMap<ConfigId, TokenBucket>,
}

impl ChannelRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take one token for `config_id` at the configured rate.
    ///
    /// A rate of zero means unlimited.
    pub fn try_acquire(&self, config_id: ConfigId, rate_per_minute: u32) -> bool {
        self.try_acquire_at(config_id, rate_per_minute, Instant::now())
    }

    /// Same as [`try_acquire`](Self::try_acquire) with an explicit clock.
    pub fn try_acquire_at(&self, config_id: ConfigId, rate_per_minute: u32, now: Instant) -> bool {
        if rate_per_minute == 0 {
            return true;
        }

        let mut bucket = self
            .buckets
            .entry(config_id)
            .or_insert_with(|| TokenBucket::full(rate_per_minute, now));
        bucket.refill(rate_per_minute, now);

        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    /// Time until the bucket for `config_id` next refills.
    pub fn time_until_refill(&self, config_id: ConfigId) -> Duration {
        let now = Instant::now();
        self.buckets
            .get(&config_id)
            .map(|b| REFILL_PERIOD.saturating_sub(now.saturating_duration_since(b.last_refill)))
            .unwrap_or(Duration::ZERO)
    }

    /// Current state for observability. `None` until first use.
    pub fn snapshot(&self, config_id: ConfigId) -> Option<RateLimiterSnapshot> {
        let now = Instant::now();
        self.buckets.get(&config_id).map(|b| RateLimiterSnapshot {
            tokens: b.tokens,
            capacity: b.capacity,
            refill_in: REFILL_PERIOD.saturating_sub(now.saturating_duration_since(b.last_refill)),
        })
    }

    /// Forget a config's bucket (config deleted or edited).
    pub fn reset(&self, config_id: ConfigId) {
        self.buckets.remove(&config_id);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// =============================================================================
// Global transport throttle
// =============================================================================

/// Process-wide ceiling on outbound transport calls.
///
/// Platforms enforce a global send rate per client on top of any
/// per-destination limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_throttle_enabled")]
    pub enabled: bool,

    /// Sustained calls per second.
    #[serde(default = "default_per_second")]
    pub per_second: u32,

    /// Calls that may be made back-to-back.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_throttle_enabled() -> bool {
    true
}

fn default_per_second() -> u32 {
    30
}

fn default_burst() -> u32 {
    30
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: default_throttle_enabled(),
            per_second: default_per_second(),
            burst: default_burst(),
        }
    }
}

/// Blocking GCRA throttle in front of the transport.
pub struct TransportThrottle {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: ThrottleConfig,
}

impl TransportThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Build from settings, `None` when disabled.
    pub fn from_config(config: &ThrottleConfig) -> Option<Self> {
        config.enabled.then(|| Self::new(config.clone()))
    }

    /// Wait for a permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }
}
