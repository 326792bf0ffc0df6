use std::time::Duration;

use tokio::time::Instant;

use crate::request::GenerationRequest;

use super::classify::FailureClass;

/// One provider attempt, kept for the retry history table.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// Strategy that produced this attempt (`initial` for the first)
    pub strategy: String,
    pub model: Option<String>,
    pub failure: Option<(FailureClass, String)>,
}

/// Retry state for a single request. Lives only as long as the request is
/// being worked on.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub original_request: GenerationRequest,
    pub attempt_number: u32,
    /// Strategy labels in the order they were applied. Alternate models are
    /// labelled per model so a chain can be walked without repeating a step.
    pub strategies_tried: Vec<String>,
    pub last_error: Option<String>,
    pub start_time: Instant,
    pub history: Vec<AttemptRecord>,
}

impl RetryContext {
    pub fn new(original_request: GenerationRequest) -> Self {
        Self {
            original_request,
            attempt_number: 0,
            strategies_tried: Vec::new(),
            last_error: None,
            start_time: Instant::now(),
            history: Vec::new(),
        }
    }

    pub fn has_tried(&self, label: &str) -> bool {
        self.strategies_tried.iter().any(|s| s == label)
    }

    /// Add a strategy label. Returns false if it was already present.
    pub fn record_strategy(&mut self, label: String) -> bool {
        if self.has_tried(&label) {
            return false;
        }
        self.strategies_tried.push(label);
        true
    }

    /// The sole stopping authority: both the attempt cap and the wall-clock cap
    /// must still have room.
    pub fn should_continue(&self, max_attempts: u32, max_elapsed: Duration) -> bool {
        self.attempt_number < max_attempts && self.start_time.elapsed() < max_elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::AssetKind;

    #[test]
    fn test_strategies_are_an_ordered_set() {
        let mut ctx = RetryContext::new(GenerationRequest::new("x", AssetKind::Image));
        assert!(ctx.record_strategy("immediate_retry".to_string()));
        assert!(ctx.record_strategy("delayed_retry".to_string()));
        assert!(!ctx.record_strategy("immediate_retry".to_string()));
        assert_eq!(ctx.strategies_tried, vec!["immediate_retry", "delayed_retry"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_continue_checks_both_caps() {
        let mut ctx = RetryContext::new(GenerationRequest::new("x", AssetKind::Image));
        ctx.attempt_number = 2;
        assert!(ctx.should_continue(3, Duration::from_secs(10)));

        ctx.attempt_number = 3;
        assert!(!ctx.should_continue(3, Duration::from_secs(10)));

        ctx.attempt_number = 1;
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!ctx.should_continue(3, Duration::from_secs(10)));
    }
}
