//! Per-identity token-bucket rate limiting with tiered capacity.
//!
//! Buckets are created lazily on first use and refilled at check time
//! (`elapsed * rate`, capped at capacity) — there are no background refill
//! timers. When per-source-address limiting is enabled, a second bucket
//! dimension exists and the configured [`CombinePolicy`] decides whether
//! every dimension must admit or any one is enough.
//!
//! Idle buckets are evicted by the periodic sweep so abandoned identities
//! do not accumulate state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{CombinePolicy, LimitsConfig, TierConfig};
use crate::metrics;
use crate::util::now_ms;

/// Which axis a bucket limits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Dimension {
    Identity,
    SourceAddress,
}

/// Outcome of a limit check.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    /// Whole tokens left after this check.
    pub remaining: u32,
    /// Epoch ms when the bucket is full again.
    pub reset_at_ms: u64,
    /// Seconds until at least one token is available. Only set when denied.
    pub retry_after: Option<f64>,
}

/// One token bucket.
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn new(tier: &TierConfig) -> Self {
        let now = Instant::now();
        Self {
            tokens: tier.capacity,
            capacity: tier.capacity,
            refill_per_sec: tier.refill_per_min / 60.0,
            last_refill: now,
            last_used: now,
        }
    }

    /// Lazy refill: top up for the time elapsed since the last check.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        self.last_used = now;
    }

    fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    fn take(&mut self) {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
        }
    }

    /// Seconds until one whole token is available.
    fn time_to_token(&self) -> f64 {
        if self.tokens >= 1.0 || self.refill_per_sec <= 0.0 {
            0.0
        } else {
            (1.0 - self.tokens) / self.refill_per_sec
        }
    }

    /// Epoch ms when the bucket refills completely.
    fn reset_at_ms(&self) -> u64 {
        if self.refill_per_sec <= 0.0 {
            return now_ms();
        }
        let secs = (self.capacity - self.tokens).max(0.0) / self.refill_per_sec;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let offset = (secs * 1000.0) as u64;
        now_ms() + offset
    }
}

/// Per-bucket view folded into the final [`Decision`].
struct BucketCheck {
    allowed: bool,
    remaining: f64,
    retry_after: f64,
    reset_at_ms: u64,
}

/// Tier-driven token-bucket limiter.
pub struct RateLimiter {
    config: LimitsConfig,
    buckets: RwLock<HashMap<(Dimension, String), Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn bucket(&self, dimension: Dimension, key: &str, tier: &TierConfig) -> Arc<Mutex<Bucket>> {
        {
            let buckets = self.buckets.read().expect("limiter map lock poisoned");
            if let Some(bucket) = buckets.get(&(dimension, key.to_string())) {
                return Arc::clone(bucket);
            }
        }
        let mut buckets = self.buckets.write().expect("limiter map lock poisoned");
        Arc::clone(
            buckets
                .entry((dimension, key.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(tier)))),
        )
    }

    /// Admit or reject one operation for `identity`, optionally also
    /// checked against the caller's source address.
    pub fn check(&self, identity: &str, source_addr: Option<&str>) -> Decision {
        let tier = self.config.tier_for(identity);
        let now = Instant::now();

        // Resolve both Arcs before locking either bucket: the map lock is
        // never taken while a bucket lock is held, and the identity bucket
        // always locks before the source bucket.
        let identity_arc = self.bucket(Dimension::Identity, identity, &tier);
        let source_arc = match source_addr {
            Some(addr) if self.config.per_source_address => {
                Some(self.bucket(Dimension::SourceAddress, addr, &tier))
            }
            _ => None,
        };

        let mut identity_bucket = identity_arc.lock().expect("bucket lock poisoned");
        identity_bucket.refill(now);
        let mut source_bucket = source_arc
            .as_ref()
            .map(|arc| arc.lock().expect("bucket lock poisoned"));
        if let Some(ref mut bucket) = source_bucket {
            bucket.refill(now);
        }

        let mut checks = vec![BucketCheck {
            allowed: identity_bucket.has_token(),
            remaining: identity_bucket.tokens,
            retry_after: identity_bucket.time_to_token(),
            reset_at_ms: identity_bucket.reset_at_ms(),
        }];
        if let Some(ref bucket) = source_bucket {
            checks.push(BucketCheck {
                allowed: bucket.has_token(),
                remaining: bucket.tokens,
                retry_after: bucket.time_to_token(),
                reset_at_ms: bucket.reset_at_ms(),
            });
        }

        let allowed = match self.config.combine {
            CombinePolicy::All => checks.iter().all(|c| c.allowed),
            CombinePolicy::Any => checks.iter().any(|c| c.allowed),
        };

        if allowed {
            identity_bucket.take();
            if let Some(ref mut bucket) = source_bucket {
                bucket.take();
            }
        } else {
            metrics::record_rate_limited(identity);
            debug!(identity, "Rate limit exceeded");
        }

        let consumed = f64::from(u8::from(allowed));
        let (remaining, retry_after, reset_at_ms) = match self.config.combine {
            CombinePolicy::All => (
                checks
                    .iter()
                    .map(|c| c.remaining)
                    .fold(f64::INFINITY, f64::min),
                checks.iter().map(|c| c.retry_after).fold(0.0, f64::max),
                checks.iter().map(|c| c.reset_at_ms).max().unwrap_or(0),
            ),
            CombinePolicy::Any => (
                checks.iter().map(|c| c.remaining).fold(0.0, f64::max),
                checks
                    .iter()
                    .map(|c| c.retry_after)
                    .fold(f64::INFINITY, f64::min),
                checks.iter().map(|c| c.reset_at_ms).min().unwrap_or(0),
            ),
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let remaining = (remaining - consumed).max(0.0).floor() as u32;
        Decision {
            allowed,
            remaining,
            reset_at_ms,
            retry_after: if allowed { None } else { Some(retry_after) },
        }
    }

    /// Drop buckets untouched for longer than `max_idle`. Locks one bucket
    /// at a time.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.write().expect("limiter map lock poisoned");
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let bucket = bucket.lock().expect("bucket lock poisoned");
            bucket.last_used.elapsed() <= max_idle
        });
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate buckets");
        }
        evicted
    }

    /// Number of live buckets, for diagnostics.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().expect("limiter map lock poisoned").len()
    }
}
