use std::time::Duration;

use tokio::time::Instant;

/// Token-bucket state for one limiter instance.
///
/// Refill is computed lazily from the time since the last confirmed
/// admission; there is no periodic refill tick. Invariants:
/// `0 <= tokens <= capacity` and `capacity >= min_capacity` at all times.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: u64,
    /// Largest single unit that must always fit. Capacity never shrinks
    /// below this.
    min_capacity: u64,
    /// Bucket-depth cap; `u64::MAX` for the global role.
    max_capacity: u64,
    fill_rate: u64,
    tokens: f64,
    last_confirm: Instant,
}

impl TokenBucket {
    pub(crate) fn new(fill_rate: u64, min_capacity: u64, now: Instant) -> Self {
        Self::bounded(fill_rate, min_capacity, u64::MAX, now)
    }

    /// A bucket whose capacity is additionally capped at `max_capacity`
    /// (per-peer role). `min_capacity` wins if the two conflict.
    pub(crate) fn bounded(
        fill_rate: u64,
        min_capacity: u64,
        max_capacity: u64,
        now: Instant,
    ) -> Self {
        let capacity = fill_rate.min(max_capacity).max(min_capacity);
        Self {
            capacity,
            min_capacity,
            max_capacity,
            fill_rate,
            // Starts full so a fresh limiter admits the first burst.
            tokens: capacity as f64,
            last_confirm: now,
        }
    }

    /// Tokens available at `now`, clamped to capacity.
    pub(crate) fn available(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_confirm).as_secs_f64();
        (self.tokens + elapsed * self.fill_rate as f64).min(self.capacity as f64)
    }

    /// Deducts `size` tokens and records the confirm time if they are
    /// available. A unit larger than the capacity is never admitted.
    pub(crate) fn try_admit(&mut self, size: u64, now: Instant) -> bool {
        if size > self.capacity {
            return false;
        }

        let available = self.available(now);
        if (size as f64) > available {
            return false;
        }

        self.tokens = available - size as f64;
        self.last_confirm = now;
        debug_assert!(self.tokens >= 0.0, "negative tokens");
        debug_assert!(self.tokens <= self.capacity as f64, "tokens above capacity");
        true
    }

    /// The earliest instant at which `size` tokens will be available, or
    /// `None` if they never will be (oversized unit, or a zero fill rate
    /// with insufficient tokens).
    pub(crate) fn deadline_for(&self, size: u64, now: Instant) -> Option<Instant> {
        if size > self.capacity {
            return None;
        }

        let available = self.available(now);
        if (size as f64) <= available {
            return Some(now);
        }
        if self.fill_rate == 0 {
            return None;
        }

        let wait = (size as f64 - available) / self.fill_rate as f64;
        Some(now + Duration::from_secs_f64(wait))
    }

    /// Applies a new fill rate. Capacity follows the rate but never shrinks
    /// below `min_capacity`; tokens are clamped down if capacity shrank.
    pub(crate) fn set_rate(&mut self, fill_rate: u64, now: Instant) {
        // Settle accrual at the old rate before switching.
        self.tokens = self.available(now);
        self.last_confirm = now;

        self.fill_rate = fill_rate;
        self.capacity = fill_rate.min(self.max_capacity).max(self.min_capacity);
        self.tokens = self.tokens.min(self.capacity as f64);
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn fill_rate(&self) -> u64 {
        self.fill_rate
    }

    #[cfg(test)]
    pub(crate) fn set_tokens(&mut self, tokens: f64, now: Instant) {
        self.tokens = tokens;
        self.last_confirm = now;
    }
}
