//! Counter of invalid (401/403/429) responses in a ten-minute window.
//!
//! The counter only drives warning emission; it never changes how a request is handled.

use crate::telemetry::InvalidRequestWarning;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Length of the counting window.
pub const INVALID_REQUEST_WINDOW: Duration = Duration::from_secs(600);

#[derive(Debug, Default)]
struct Window {
    count: u64,
    reset_at: Option<u64>,
}

/// Shared invalid-request window. Clones observe the same counter.
#[derive(Debug, Clone, Default)]
pub struct InvalidRequestTracker {
    window: Arc<Mutex<Window>>,
}

impl InvalidRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a status counts as an invalid request.
    pub fn is_invalid_status(status: u16) -> bool {
        matches!(status, 401 | 403 | 429)
    }

    /// Count one invalid response at `now` (milliseconds).
    ///
    /// Returns a warning when `interval` is non-zero and the count is a multiple of it.
    pub fn record(&self, now: u64, interval: u64) -> Option<InvalidRequestWarning> {
        let window_ms = INVALID_REQUEST_WINDOW.as_millis() as u64;
        let mut window = self.lock();

        let reset_at = match window.reset_at {
            Some(reset_at) if reset_at > now => reset_at,
            _ => {
                window.count = 0;
                let reset_at = now + window_ms;
                window.reset_at = Some(reset_at);
                reset_at
            }
        };
        window.count += 1;

        if interval > 0 && window.count % interval == 0 {
            Some(InvalidRequestWarning {
                count: window.count,
                remaining_time: Duration::from_millis(reset_at - now),
            })
        } else {
            None
        }
    }

    /// Invalid responses in the current window as of the last record.
    pub fn count(&self) -> u64 {
        self.lock().count
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
