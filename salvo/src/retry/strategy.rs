//! Fallback strategies and the request transformations they apply.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Same request, no delay
    ImmediateRetry,
    /// Same request after exponential backoff
    DelayedRetry,
    /// Cheaper parameters (fewer steps, smaller size)
    ParameterReduction,
    /// Shorter, plainer prompt
    PromptSimplification,
    /// Next model from the static fallback chain
    AlternateModel,
    /// Configured placeholder artifact, no provider call
    GenericFallback,
    /// Stop immediately
    Abandon,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ImmediateRetry => "immediate_retry",
            Strategy::DelayedRetry => "delayed_retry",
            Strategy::ParameterReduction => "parameter_reduction",
            Strategy::PromptSimplification => "prompt_simplification",
            Strategy::AlternateModel => "alternate_model",
            Strategy::GenericFallback => "generic_fallback",
            Strategy::Abandon => "abandon",
        }
    }

    /// Whether a success reached through this strategy is a degraded result.
    pub fn degrades(&self) -> bool {
        matches!(
            self,
            Strategy::PromptSimplification | Strategy::AlternateModel | Strategy::GenericFallback
        )
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff: `backoff_ms * factor^retry`, capped at `max_backoff_ms`.
pub fn backoff(retry: u32, backoff_ms: u64, factor: u64, max_backoff_ms: u64) -> Duration {
    let exponential = backoff_ms.saturating_mul(factor.saturating_pow(retry));
    Duration::from_millis(exponential.min(max_backoff_ms))
}

/// Keep the first sentence of the prompt, without bracketed asides, cut to
/// `max_words` words. Returns `None` if that changes nothing.
pub fn simplify_prompt(prompt: &str, max_words: usize) -> Option<String> {
    let mut depth = 0usize;
    let unbracketed: String = prompt
        .chars()
        .filter(|c| match *c {
            '(' | '[' | '{' => {
                depth += 1;
                false
            }
            ')' | ']' | '}' => {
                depth = depth.saturating_sub(1);
                false
            }
            _ => depth == 0,
        })
        .collect();

    let first_sentence = unbracketed
        .split(['.', ';', '!', '?', '\n'])
        .find(|s| !s.trim().is_empty())
        .unwrap_or("");

    let simplified = first_sentence
        .split_whitespace()
        .take(max_words.max(1))
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches([',', ':', '-'])
        .to_string();

    let original = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    (!simplified.is_empty() && simplified != original).then_some(simplified)
}

/// Numeric parameters that make a generation cheaper or faster when lowered,
/// with the floor each is not reduced below.
const REDUCIBLE: &[(&str, u64)] = &[
    ("steps", 4),
    ("num_inference_steps", 4),
    ("num_frames", 8),
    ("duration", 1),
    ("width", 256),
    ("height", 256),
];

/// Halve the reducible parameters and drop `quality` to `standard`. Returns
/// `None` if nothing could be reduced.
pub fn reduce_parameters(
    parameters: &serde_json::Map<String, serde_json::Value>,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    let mut reduced = parameters.clone();
    let mut changed = false;

    for &(key, floor) in REDUCIBLE {
        if let Some(value) = parameters.get(key).and_then(|v| v.as_u64()) {
            let lowered = (value / 2).max(floor);
            if lowered < value {
                reduced.insert(key.to_string(), lowered.into());
                changed = true;
            }
        }
    }

    if let Some(quality) = parameters.get("quality").and_then(|v| v.as_str()) {
        if !matches!(quality, "standard" | "low" | "draft") {
            reduced.insert("quality".to_string(), "standard".into());
            changed = true;
        }
    }

    changed.then_some(reduced)
}
