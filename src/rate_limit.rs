// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Rate Limiting
//!
//! Per-client token bucket admission control. The number of tracked clients
//! is capped so that an attack from many distinct addresses cannot grow the
//! bucket map without bound; once the cap is reached, unseen clients are
//! rejected outright.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default ceiling on the number of tracked client keys.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

/// Slack when comparing token levels. Durations are whole nanoseconds, so a
/// refill interval of `1/rate` seconds can fall a hair short of one token.
const TOKEN_EPSILON: f64 = 1e-6;

/// Token bucket for rate limiting a single client.
#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens.
    tokens: f64,
    /// Maximum tokens (burst).
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last time tokens were updated.
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        TokenBucket {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate,
            last_update: now,
        }
    }

    /// Token level at `now`, without mutating the bucket.
    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    /// Refills tokens based on elapsed time.
    fn refill(&mut self, now: Instant) {
        self.tokens = self.tokens_at(now);
        if now > self.last_update {
            self.last_update = now;
        }
    }

    /// Tries to consume one token.
    ///
    /// Returns true if successful, false if rate limited.
    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// A bucket that has refilled to capacity has not been used since it
    /// last drained. This cannot tell an idle client from one that simply
    /// paused long enough to refill.
    fn is_full(&self, now: Instant) -> bool {
        self.tokens_at(now) + TOKEN_EPSILON >= self.capacity
    }
}

/// Rate limiter for multiple clients.
pub struct RateLimiter {
    /// Per-client token buckets.
    buckets: Mutex<HashMap<String, TokenBucket>>,
    /// Tokens added per second.
    rate_per_sec: f64,
    /// Bucket capacity.
    burst: u32,
    /// Hard cap on tracked clients.
    max_tracked_keys: usize,
    /// Stops the background sweep.
    shutdown: CancellationToken,
}

impl RateLimiter {
    /// Creates a new rate limiter.
    ///
    /// `rate_per_sec` is the sustained rate and `burst` the bucket capacity
    /// for each client. At most `max_tracked_keys` clients are tracked at once.
    pub fn new(rate_per_sec: f64, burst: u32, max_tracked_keys: usize) -> Self {
        RateLimiter {
            buckets: Mutex::new(HashMap::new()),
            rate_per_sec,
            burst,
            max_tracked_keys,
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tries to consume a token for this client.
    ///
    /// Returns true if allowed, false if rate limited or if the client is new
    /// and the tracking ceiling has been reached.
    pub fn allow(&self, client_key: &str) -> bool {
        self.allow_at(client_key, Instant::now())
    }

    fn allow_at(&self, client_key: &str, now: Instant) -> bool {
        let mut buckets = self.lock();
        if let Some(bucket) = buckets.get_mut(client_key) {
            return bucket.try_consume(now);
        }

        if buckets.len() >= self.max_tracked_keys {
            return false;
        }

        let mut bucket = TokenBucket::new(self.burst, self.rate_per_sec, now);
        let allowed = bucket.try_consume(now);
        buckets.insert(client_key.to_string(), bucket);
        allowed
    }

    /// Removes buckets that have refilled to capacity.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut buckets = self.lock();
        let initial_count = buckets.len();

        buckets.retain(|_, bucket| !bucket.is_full(now));

        initial_count - buckets.len()
    }

    /// Returns the number of client buckets currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    /// Spawns the periodic sweep on the current tokio runtime.
    ///
    /// The task runs until [`RateLimiter::stop`] is called.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(
                                removed,
                                remaining = limiter.tracked_keys(),
                                "Swept idle rate limiter entries"
                            );
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Rate limiter sweep stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stops the background sweep. Safe to call more than once.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Returns true once [`RateLimiter::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
