//! Retry bookkeeping for a single dispatched request.
//!
//! Semantics:
//! - `retries` counts re-sends after the initial attempt, so a request is sent at most
//!   `retries + 1` times for transient failures.
//! - Only 5xx responses and local timeouts consume the budget.
//! - 429 responses never consume it; they are paced by the rate-limit wait loop instead.
//! - There is no backoff between retries.

/// How a response status is handled by the bucket handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx: hand the response back.
    Success,
    /// 429: local bookkeeping was stale; wait and resend.
    RateLimited,
    /// 5xx: retry while budget remains.
    ServerError,
    /// Other 4xx: structured API error, never retried.
    ClientError,
    /// 1xx/3xx: passed through untouched.
    Other,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => StatusClass::Success,
            429 => StatusClass::RateLimited,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Other,
        }
    }
}

/// Remaining retries for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max: u32,
    used: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Retries consumed so far.
    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// Consume one retry. Returns `false` once the budget is spent.
    pub fn try_consume(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.used += 1;
        true
    }
}
