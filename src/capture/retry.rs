use crate::constants::{CAPTURE_RETRY_BASE, CAPTURE_RETRY_MAX, MAX_CAPTURE_FAILURES};
use std::time::Duration;

/// What a capture loop should do after a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Counts consecutive capture failures and spaces out retries.
#[derive(Debug, Clone)]
pub struct CaptureRetry {
    consecutive: u32,
    limit: u32,
}

impl Default for CaptureRetry {
    fn default() -> Self {
        Self::new(MAX_CAPTURE_FAILURES)
    }
}

impl CaptureRetry {
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit: limit.max(1),
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    pub fn failed(&mut self) -> RetryDecision {
        self.consecutive += 1;
        if self.consecutive >= self.limit {
            return RetryDecision::GiveUp;
        }
        let shift = (self.consecutive - 1).min(16);
        RetryDecision::RetryAfter((CAPTURE_RETRY_BASE * (1u32 << shift)).min(CAPTURE_RETRY_MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut retry = CaptureRetry::new(100);
        assert_eq!(retry.failed(), RetryDecision::RetryAfter(Duration::from_millis(10)));
        assert_eq!(retry.failed(), RetryDecision::RetryAfter(Duration::from_millis(20)));
        assert_eq!(retry.failed(), RetryDecision::RetryAfter(Duration::from_millis(40)));
        for _ in 0..20 {
            retry.failed();
        }
        assert_eq!(retry.failed(), RetryDecision::RetryAfter(CAPTURE_RETRY_MAX));
    }

    #[test]
    fn gives_up_after_limit_consecutive_failures() {
        let mut retry = CaptureRetry::new(3);
        assert!(matches!(retry.failed(), RetryDecision::RetryAfter(_)));
        assert!(matches!(retry.failed(), RetryDecision::RetryAfter(_)));
        assert_eq!(retry.failed(), RetryDecision::GiveUp);
    }

    #[test]
    fn success_resets_the_count() {
        let mut retry = CaptureRetry::new(3);
        retry.failed();
        retry.failed();
        retry.succeeded();
        assert_eq!(retry.consecutive(), 0);
        assert!(matches!(retry.failed(), RetryDecision::RetryAfter(_)));
        assert!(matches!(retry.failed(), RetryDecision::RetryAfter(_)));
        assert_eq!(retry.failed(), RetryDecision::GiveUp);
    }
}
