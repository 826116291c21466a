use crate::error::{PipelineError, PipelineResult};
use std::time::Duration;

/// Bounded retry with a fixed backoff between attempts.
///
/// `max_attempts` counts the first try, so 1 means "no retry".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds or attempts are exhausted. `op` receives the
    /// 1-based attempt number. `keep_going` is checked before every backoff
    /// sleep so shutdown is never delayed by retries.
    pub fn run<T, F, K>(&self, mut keep_going: K, mut op: F) -> PipelineResult<T>
    where
        F: FnMut(u32) -> PipelineResult<T>,
        K: FnMut() -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        self.max_attempts,
                        e,
                        self.backoff
                    );
                    if !keep_going() {
                        return Err(PipelineError::Shutdown);
                    }
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
