use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Fixed-point scale applied to token counts so fractional refill amounts
/// survive storage in an `AtomicU64`.
const SCALE: f64 = 1_000.0;

/// Token bucket with rate = target_rps, capacity = burst. Refill is
/// continuous, computed from elapsed monotonic time on every acquire
/// attempt rather than on a timer tick.
///
/// `target_rps == 0` disables limiting entirely (`try_acquire` always
/// succeeds).
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    tokens_scaled: AtomicU64,
    last_refill: std::sync::Mutex<Instant>,
}

impl TokenBucket {
    pub fn new(target_rps: f64, burst: Option<f64>) -> Self {
        let capacity = burst.unwrap_or((target_rps * 2.0).max(1.0));
        Self {
            rate_per_sec: target_rps,
            capacity,
            tokens_scaled: AtomicU64::new((capacity * SCALE) as u64),
            last_refill: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_per_sec <= 0.0
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock().expect("token bucket mutex poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(*last).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        *last = now;
        let added = elapsed * self.rate_per_sec * SCALE;
        if added < 1.0 {
            // Too little time passed to add a whole scaled unit; give the
            // elapsed budget back so it accumulates across calls instead of
            // being silently dropped.
            *last = now - std::time::Duration::from_secs_f64(elapsed);
            return;
        }
        let cap_scaled = (self.capacity * SCALE) as u64;
        self.tokens_scaled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_add(added as u64).min(cap_scaled))
            })
            .ok();
    }

    /// Attempts to consume one token. Returns `true` on success.
    pub fn try_acquire(&self) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill();
        let unit = SCALE as u64;
        self.tokens_scaled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                if t >= unit {
                    Some(t - unit)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Blocks (async) until a token becomes available.
    pub async fn acquire(&self) {
        if self.is_unlimited() {
            return;
        }
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = std::time::Duration::from_secs_f64((1.0 / self.rate_per_sec).max(0.001));
            tokio::time::sleep(wait.min(std::time::Duration::from_millis(50))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_target_rps_disables_limiting() {
        let bucket = TokenBucket::new(0.0, None);
        for _ in 0..10_000 {
            assert!(bucket.try_acquire());
        }
    }

    #[test]
    fn bucket_starts_full_at_capacity() {
        let bucket = TokenBucket::new(10.0, Some(5.0));
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn default_burst_is_double_target_rps() {
        let bucket = TokenBucket::new(100.0, None);
        assert_eq!(bucket.capacity, 200.0);
    }

    #[test]
    fn minimum_burst_is_one() {
        let bucket = TokenBucket::new(0.1, None);
        assert!(bucket.capacity >= 1.0);
    }

    #[tokio::test]
    async fn refills_over_time() {
        let bucket = TokenBucket::new(1000.0, Some(1.0));
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test]
    async fn acquire_blocks_until_token_available() {
        let bucket = TokenBucket::new(500.0, Some(1.0));
        assert!(bucket.try_acquire());
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }
}
