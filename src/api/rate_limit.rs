// =============================================================================
// Rate Limiter — token bucket admission control for broker REST calls
// =============================================================================
//
// The broker enforces 20 REST calls per second per app key. We cap ourselves
// at 18/s for safety margin. A token bucket allows short bursts up to
// `max_tokens` while bounding the sustained rate at `refill_rate`.
//
// `acquire()` serialises contending callers behind a single async lock and
// sleeps until a token is available. `available()` is a lock-free
// approximation for metrics readers.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

/// Safe-margin default: broker allows 20/s, we use 18/s.
pub const DEFAULT_CALLS_PER_SECOND: f64 = 18.0;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter.
pub struct RateLimiter {
    refill_rate: f64,
    max_tokens: f64,
    bucket: tokio::sync::Mutex<Bucket>,
    /// Epoch for the lock-free mirror timestamps.
    origin: Instant,
    /// Token count at the last refill, as f64 bits.
    approx_tokens: AtomicU64,
    /// Nanoseconds since `origin` of the last refill.
    approx_refill_nanos: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter allowing `calls_per_second` sustained calls with a
    /// burst capacity of `max_burst` (defaults to `calls_per_second` rounded
    /// down when `None`).
    pub fn new(calls_per_second: f64, max_burst: Option<u32>) -> Self {
        let max_tokens = match max_burst {
            Some(n) => n as f64,
            None => calls_per_second.floor(),
        };
        let now = Instant::now();

        tracing::info!(
            refill_rate = calls_per_second,
            max_tokens,
            "rate limiter initialised"
        );

        Self {
            refill_rate: calls_per_second,
            max_tokens,
            bucket: tokio::sync::Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: now,
            }),
            origin: now,
            approx_tokens: AtomicU64::new(max_tokens.to_bits()),
            approx_refill_nanos: AtomicU64::new(0),
        }
    }

    /// Credit tokens proportional to elapsed time, capped at `max_tokens`.
    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        bucket.last_refill = now;

        // Mirror for lock-free readers.
        self.approx_tokens
            .store(bucket.tokens.to_bits(), Ordering::Relaxed);
        self.approx_refill_nanos.store(
            now.duration_since(self.origin).as_nanos() as u64,
            Ordering::Relaxed,
        );
    }

    /// Acquire one token, sleeping until one is available.
    ///
    /// Contending callers are serialised by the bucket lock, so waits are
    /// FIFO in lock-acquisition order.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        if bucket.tokens < 1.0 {
            let deficit = 1.0 - bucket.tokens;
            let wait = deficit / self.refill_rate;
            debug!(
                wait_seconds = format!("{wait:.4}"),
                current_tokens = format!("{:.2}", bucket.tokens),
                "rate limiter waiting for refill"
            );
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            self.refill(&mut bucket);
        }

        bucket.tokens -= 1.0;
        self.approx_tokens
            .store(bucket.tokens.to_bits(), Ordering::Relaxed);
    }

    /// Approximate number of currently available tokens, without locking.
    pub fn available(&self) -> f64 {
        let tokens = f64::from_bits(self.approx_tokens.load(Ordering::Relaxed));
        let refill_nanos = self.approx_refill_nanos.load(Ordering::Relaxed);
        let now_nanos = Instant::now().duration_since(self.origin).as_nanos() as u64;
        let elapsed = Duration::from_nanos(now_nanos.saturating_sub(refill_nanos)).as_secs_f64();
        (tokens + elapsed * self.refill_rate).min(self.max_tokens)
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CALLS_PER_SECOND, None)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("refill_rate", &self.refill_rate)
            .field("max_tokens", &self.max_tokens)
            .field("available", &self.available())
            .finish()
    }
}
