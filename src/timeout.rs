//! Local timeout raced against every transport call.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// The transport call did not finish within the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transport call timed out after {elapsed:?} (limit: {timeout:?})")]
pub struct Elapsed {
    pub elapsed: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. A zero duration is rejected earlier by option validation.
    pub fn new(duration: Duration) -> Self {
        debug_assert!(duration > Duration::ZERO, "timeout duration must be non-zero");
        Self { duration }
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Drive `operation` to completion or fail once the limit passes; the operation is dropped
    /// (and so aborted) on timeout.
    pub async fn run<F>(&self, operation: F) -> Result<F::Output, Elapsed>
    where
        F: Future,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, operation).await {
            Ok(output) => Ok(output),
            Err(_) => Err(Elapsed { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
