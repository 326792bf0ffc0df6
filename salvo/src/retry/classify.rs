//! Mapping provider failures onto retry categories.

use serde::Serialize;

use crate::provider::ProviderError;

use super::strategy::Strategy;

/// Why a provider call failed, as far as retrying is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    RateLimit,
    Timeout,
    ContentSafety,
    InvalidInput,
    ProviderUnavailable,
    QuotaExhausted,
    Transient5xx,
    Unclassified,
}

const QUOTA_PATTERNS: &[&str] = &[
    "quota",
    "insufficient funds",
    "insufficient credit",
    "insufficient balance",
    "billing",
    "payment required",
    "invalid api key",
    "unauthorized",
];

const SAFETY_PATTERNS: &[&str] = &[
    "content policy",
    "safety",
    "nsfw",
    "moderation",
    "flagged",
    "blocked",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "rate-limit", "too many requests", "throttl"];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

const UNAVAILABLE_PATTERNS: &[&str] = &[
    "unavailable",
    "overloaded",
    "model not found",
    "no such model",
    "connection refused",
    "connection failed",
    "circuit open",
];

const INVALID_PATTERNS: &[&str] = &["invalid", "validation", "unsupported", "malformed", "too long"];

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::RateLimit => "rate_limit",
            FailureClass::Timeout => "timeout",
            FailureClass::ContentSafety => "content_safety",
            FailureClass::InvalidInput => "invalid_input",
            FailureClass::ProviderUnavailable => "provider_unavailable",
            FailureClass::QuotaExhausted => "quota_exhausted",
            FailureClass::Transient5xx => "transient_5xx",
            FailureClass::Unclassified => "unclassified",
        }
    }

    /// Strategies to try for this failure, in order.
    pub fn plan(&self) -> &'static [Strategy] {
        use Strategy::*;
        match self {
            FailureClass::RateLimit => &[DelayedRetry, AlternateModel],
            FailureClass::Timeout => &[ImmediateRetry, ParameterReduction],
            FailureClass::ContentSafety => &[PromptSimplification, GenericFallback],
            FailureClass::InvalidInput => &[PromptSimplification, ParameterReduction, GenericFallback],
            FailureClass::ProviderUnavailable => &[AlternateModel],
            FailureClass::QuotaExhausted => &[Abandon],
            FailureClass::Transient5xx => &[ImmediateRetry, DelayedRetry, AlternateModel],
            FailureClass::Unclassified => &[
                ImmediateRetry,
                ParameterReduction,
                AlternateModel,
                GenericFallback,
            ],
        }
    }

    /// Whether this failure says something about the health of the provider
    /// key, and so should count towards opening its circuit.
    pub fn trips_circuit(&self) -> bool {
        matches!(
            self,
            FailureClass::Timeout
                | FailureClass::ProviderUnavailable
                | FailureClass::Transient5xx
                | FailureClass::RateLimit
        )
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

/// Classify a provider error by message pattern first, then status code.
pub fn classify(error: &ProviderError) -> FailureClass {
    let message = error.message.to_lowercase();

    if matches!(error.status, Some(401 | 402 | 403)) || matches_any(&message, QUOTA_PATTERNS) {
        return FailureClass::QuotaExhausted;
    }
    if error.status == Some(451) || matches_any(&message, SAFETY_PATTERNS) {
        return FailureClass::ContentSafety;
    }
    if error.status == Some(429) || matches_any(&message, RATE_LIMIT_PATTERNS) {
        return FailureClass::RateLimit;
    }
    if matches!(error.status, Some(408 | 504)) || matches_any(&message, TIMEOUT_PATTERNS) {
        return FailureClass::Timeout;
    }
    if error.status == Some(503) || matches_any(&message, UNAVAILABLE_PATTERNS) {
        return FailureClass::ProviderUnavailable;
    }

    match error.status {
        Some(status) if (500..600).contains(&status) => FailureClass::Transient5xx,
        Some(400 | 404 | 413 | 422) => FailureClass::InvalidInput,
        _ if matches_any(&message, INVALID_PATTERNS) => FailureClass::InvalidInput,
        _ => FailureClass::Unclassified,
    }
}
