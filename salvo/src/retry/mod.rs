//! Error classification and ordered fallback strategies.
//!
//! [`RetryStrategist::execute`] drives one request through its attempts. After
//! each failure the error is classified, and the first strategy in that class's
//! plan that is applicable and not yet tried is applied. Strategies compound:
//! an alternate model keeps an earlier simplified prompt.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, RetryConfig};
use crate::error::Error;
use crate::provider::{GeneratedArtifact, ProviderError};
use crate::request::{AssetKind, GenerationRequest};

pub mod classify;
pub mod context;
pub mod strategy;

pub use classify::{classify, FailureClass};
pub use context::{AttemptRecord, RetryContext};
pub use strategy::Strategy;

/// Why a single attempt did not produce an artifact.
#[derive(Debug)]
pub enum AttemptError {
    /// The provider was called and failed
    Provider(ProviderError),
    /// The provider key's circuit is open; no call was made
    CircuitOpen(String),
    /// Stop retrying and surface this error (budget rejection, persistence failure)
    Fatal(Error),
}

impl From<ProviderError> for AttemptError {
    fn from(error: ProviderError) -> Self {
        AttemptError::Provider(error)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutput {
    Generated(GeneratedArtifact),
    /// Placeholder artifact from `fallback_artifacts`
    Fallback(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub output: AttemptOutput,
    /// The request variant that succeeded
    pub request: GenerationRequest,
    pub attempts: u32,
    pub strategies_tried: Vec<String>,
    /// Prompt or model changed, or a placeholder was used
    pub degraded: bool,
    pub history: Vec<AttemptRecord>,
}

#[derive(Debug)]
pub struct RetryFailure {
    pub error: Error,
    /// Class of the last provider failure, if there was one
    pub class: Option<FailureClass>,
    pub attempts: u32,
    pub strategies_tried: Vec<String>,
    pub history: Vec<AttemptRecord>,
}

impl RetryFailure {
    /// Name recorded in the `error_class` column.
    pub fn error_class(&self) -> &'static str {
        match (&self.error, self.class) {
            (Error::BudgetExceeded { .. }, _) => self.error.category(),
            (_, Some(class)) => class.as_str(),
            (error, None) => error.category(),
        }
    }
}

/// What applying a strategy means for the next attempt.
enum Action {
    Retry,
    Delay(Duration),
    Retarget(GenerationRequest),
    Fallback(PathBuf),
    Abandon,
}

pub struct RetryStrategist {
    config: RetryConfig,
    model_fallbacks: HashMap<String, Vec<String>>,
    fallback_artifacts: HashMap<AssetKind, PathBuf>,
}

impl RetryStrategist {
    pub fn new(
        config: &RetryConfig,
        model_fallbacks: HashMap<String, Vec<String>>,
        fallback_artifacts: HashMap<AssetKind, PathBuf>,
    ) -> Self {
        Self {
            config: config.clone(),
            model_fallbacks,
            fallback_artifacts,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.retry,
            config.model_fallbacks.clone(),
            config.fallback_artifacts.clone(),
        )
    }

    /// Run `generate` until it succeeds, a fallback artifact is used, or the
    /// plan or the caps are exhausted.
    ///
    /// `generate` receives the request variant to try and the 1-based attempt
    /// number.
    pub async fn execute<F, Fut>(
        &self,
        request: &GenerationRequest,
        mut generate: F,
    ) -> Result<RetryOutcome, RetryFailure>
    where
        F: FnMut(GenerationRequest, u32) -> Fut,
        Fut: Future<Output = Result<GeneratedArtifact, AttemptError>>,
    {
        let mut ctx = RetryContext::new(request.clone());
        let mut current = request.clone();
        let mut strategy_label = "initial".to_string();
        let mut degraded = false;

        loop {
            ctx.attempt_number += 1;
            let attempt = ctx.attempt_number;

            let (class, message) = match generate(current.clone(), attempt).await {
                Ok(artifact) => {
                    ctx.history.push(AttemptRecord {
                        attempt,
                        strategy: strategy_label,
                        model: current.model.clone(),
                        failure: None,
                    });
                    return Ok(RetryOutcome {
                        output: AttemptOutput::Generated(artifact),
                        request: current,
                        attempts: attempt,
                        strategies_tried: ctx.strategies_tried,
                        degraded,
                        history: ctx.history,
                    });
                }
                Err(AttemptError::Fatal(error)) => {
                    return Err(RetryFailure {
                        error,
                        class: ctx.history.last().and_then(|h| h.failure.as_ref().map(|f| f.0)),
                        attempts: attempt - 1,
                        strategies_tried: ctx.strategies_tried,
                        history: ctx.history,
                    });
                }
                Err(AttemptError::Provider(error)) => (classify(&error), error.to_string()),
                Err(AttemptError::CircuitOpen(key)) => (
                    FailureClass::ProviderUnavailable,
                    format!("circuit open for {key}"),
                ),
            };

            tracing::info!(
                attempt,
                strategy = %strategy_label,
                class = %class,
                error = %message,
                "Attempt failed"
            );
            ctx.history.push(AttemptRecord {
                attempt,
                strategy: strategy_label.clone(),
                model: current.model.clone(),
                failure: Some((class, message.clone())),
            });
            ctx.last_error = Some(message.clone());

            let Some((strategy, label, action)) = self.next_action(class, &ctx, &current) else {
                return Err(exhausted(ctx, class, message));
            };
            let abandon = matches!(action, Action::Abandon);
            if !abandon && !ctx.should_continue(self.config.max_attempts, self.config.max_elapsed) {
                return Err(exhausted(ctx, class, message));
            }

            tracing::debug!(strategy = %label, attempt, "Applying fallback strategy");
            ctx.record_strategy(label.clone());
            strategy_label = label;
            degraded |= strategy.degrades();

            match action {
                Action::Retry => {}
                Action::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    if !ctx.should_continue(self.config.max_attempts, self.config.max_elapsed) {
                        return Err(exhausted(ctx, class, message));
                    }
                }
                Action::Retarget(next) => current = next,
                Action::Fallback(path) => {
                    return Ok(RetryOutcome {
                        output: AttemptOutput::Fallback(path),
                        request: current,
                        attempts: attempt,
                        strategies_tried: ctx.strategies_tried,
                        degraded: true,
                        history: ctx.history,
                    });
                }
                Action::Abandon => {
                    tracing::warn!(class = %class, "Abandoning request");
                    return Err(RetryFailure {
                        error: Error::ProviderFatal(message),
                        class: Some(class),
                        attempts: attempt,
                        strategies_tried: ctx.strategies_tried,
                        history: ctx.history,
                    });
                }
            }
        }
    }

    /// First applicable, untried strategy in the plan for `class`.
    fn next_action(
        &self,
        class: FailureClass,
        ctx: &RetryContext,
        current: &GenerationRequest,
    ) -> Option<(Strategy, String, Action)> {
        class.plan().iter().find_map(|&strategy| {
            let (label, action) = self.prepare(strategy, ctx, current)?;
            (!ctx.has_tried(&label)).then_some((strategy, label, action))
        })
    }

    /// Work out what `strategy` would do for the current request. `None` when
    /// it doesn't apply (nothing to reduce, no alternate left, no placeholder,
    /// or a backoff longer than the time left).
    fn prepare(
        &self,
        strategy: Strategy,
        ctx: &RetryContext,
        current: &GenerationRequest,
    ) -> Option<(String, Action)> {
        let label = strategy.as_str().to_string();
        match strategy {
            Strategy::ImmediateRetry => Some((label, Action::Retry)),
            Strategy::DelayedRetry => {
                let delay = strategy::backoff(
                    ctx.attempt_number.saturating_sub(1),
                    self.config.backoff_ms,
                    self.config.backoff_factor,
                    self.config.max_backoff_ms,
                );
                // A wait that ends past the wall-clock cap can't lead to another call
                let remaining = self.config.max_elapsed.saturating_sub(ctx.start_time.elapsed());
                (delay < remaining).then_some((label, Action::Delay(delay)))
            }
            Strategy::ParameterReduction => {
                let parameters = strategy::reduce_parameters(&current.parameters)?;
                let mut next = current.clone();
                next.parameters = parameters;
                Some((label, Action::Retarget(next)))
            }
            Strategy::PromptSimplification => {
                let prompt =
                    strategy::simplify_prompt(&current.prompt, self.config.simplified_prompt_words)?;
                let mut next = current.clone();
                next.prompt = prompt;
                Some((label, Action::Retarget(next)))
            }
            Strategy::AlternateModel => {
                let original = ctx.original_request.model.as_deref()?;
                let model = self
                    .model_fallbacks
                    .get(original)?
                    .iter()
                    .find(|m| {
                        current.model.as_deref() != Some(m.as_str())
                            && !ctx.has_tried(&format!("{label}:{m}"))
                    })?
                    .clone();
                let mut next = current.clone();
                next.model = Some(model.clone());
                Some((format!("{label}:{model}"), Action::Retarget(next)))
            }
            Strategy::GenericFallback => {
                let path = self.fallback_artifacts.get(&current.asset_kind)?;
                Some((label, Action::Fallback(path.clone())))
            }
            Strategy::Abandon => Some((label, Action::Abandon)),
        }
    }
}

fn exhausted(ctx: RetryContext, class: FailureClass, last_error: String) -> RetryFailure {
    let strategies = if ctx.strategies_tried.is_empty() {
        "none".to_string()
    } else {
        ctx.strategies_tried.join(", ")
    };
    tracing::warn!(
        attempts = ctx.attempt_number,
        strategies = %strategies,
        "Retries exhausted"
    );
    RetryFailure {
        error: Error::RetriesExhausted {
            attempts: ctx.attempt_number,
            strategies,
            last_error,
        },
        class: Some(class),
        attempts: ctx.attempt_number,
        strategies_tried: ctx.strategies_tried,
        history: ctx.history,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProvider, Provider};
    use crate::request::Tier;
    use rust_decimal::Decimal;

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            max_elapsed: Duration::from_secs(600),
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 60_000,
            simplified_prompt_words: 4,
        }
    }

    fn strategist() -> RetryStrategist {
        RetryStrategist::new(&retry_config(), HashMap::new(), HashMap::new())
    }

    async fn run(
        strategist: &RetryStrategist,
        provider: &MockProvider,
        request: &GenerationRequest,
    ) -> Result<RetryOutcome, RetryFailure> {
        strategist
            .execute(request, |attempt, _| {
                let provider = provider.clone();
                async move {
                    provider
                        .generate(&attempt, Duration::from_secs(5))
                        .await
                        .map_err(AttemptError::from)
                }
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_delayed_success() {
        let provider = MockProvider::new();
        provider.add_response("fox", Err(ProviderError::with_status(500, "internal error")));
        provider.add_response("fox", Err(ProviderError::with_status(500, "internal error")));

        let request = GenerationRequest::new("fox", AssetKind::Image);
        let outcome = run(&strategist(), &provider, &request).await.unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.strategies_tried, vec!["immediate_retry", "delayed_retry"]);
        assert!(!outcome.degraded);
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(outcome.history[2].strategy, "delayed_retry");
        assert!(outcome.history[2].failure.is_none());
        assert_eq!(provider.calls_for("fox"), 3);
    }

    #[tokio::test]
    async fn test_content_safety_simplifies_prompt() {
        let provider = MockProvider::new();
        let prompt = "A soldier in a gory battle scene. Photorealistic.";
        provider.add_response(prompt, Err(ProviderError::with_status(400, "blocked by safety filter")));

        let request = GenerationRequest::new(prompt, AssetKind::Illustration);
        let outcome = run(&strategist(), &provider, &request).await.unwrap();

        assert!(outcome.degraded);
        assert_eq!(outcome.request.prompt, "A soldier in a");
        assert_eq!(outcome.strategies_tried, vec!["prompt_simplification"]);
    }

    #[tokio::test]
    async fn test_content_safety_falls_back_to_placeholder() {
        let provider = MockProvider::new();
        let prompt = "something unsafe and long enough to simplify";
        provider.add_response(prompt, Err(ProviderError::new("content policy violation")));
        provider.add_response("something unsafe and long", Err(ProviderError::new("content policy violation")));

        let strategist = RetryStrategist::new(
            &retry_config(),
            HashMap::new(),
            HashMap::from([(AssetKind::Icon, PathBuf::from("/assets/icon.png"))]),
        );
        let request = GenerationRequest::new(prompt, AssetKind::Icon);
        let outcome = run(&strategist, &provider, &request).await.unwrap();

        assert_eq!(outcome.output, AttemptOutput::Fallback(PathBuf::from("/assets/icon.png")));
        assert!(outcome.degraded);
        assert_eq!(
            outcome.strategies_tried,
            vec!["prompt_simplification", "generic_fallback"]
        );
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_quota_abandons_immediately() {
        let provider = MockProvider::new();
        provider.add_response("x", Err(ProviderError::with_status(402, "insufficient funds")));

        let request = GenerationRequest::new("x", AssetKind::Image);
        let failure = run(&strategist(), &provider, &request).await.unwrap_err();

        assert!(matches!(failure.error, Error::ProviderFatal(_)));
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.error_class(), "quota_exhausted");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_walks_model_chain() {
        let provider = MockProvider::new();
        provider.add_response("x", Err(ProviderError::with_status(503, "overloaded")));
        provider.add_response("x", Err(ProviderError::with_status(503, "overloaded")));

        let strategist = RetryStrategist::new(
            &retry_config(),
            HashMap::from([(
                "flux-pro".to_string(),
                vec!["flux-dev".to_string(), "flux-schnell".to_string()],
            )]),
            HashMap::new(),
        );
        let request = GenerationRequest::new("x", AssetKind::Image).with_model("flux-pro");
        let outcome = run(&strategist, &provider, &request).await.unwrap();

        assert_eq!(outcome.request.model.as_deref(), Some("flux-schnell"));
        assert!(outcome.degraded);
        assert_eq!(
            outcome.strategies_tried,
            vec!["alternate_model:flux-dev", "alternate_model:flux-schnell"]
        );
        let models: Vec<_> = provider.get_calls().into_iter().map(|c| c.model).collect();
        assert_eq!(
            models,
            vec![
                Some("flux-pro".to_string()),
                Some("flux-dev".to_string()),
                Some("flux-schnell".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_no_strategy_is_repeated() {
        let provider = MockProvider::new();
        for _ in 0..10 {
            provider.add_response("x", Err(ProviderError::new("request timed out after 5s")));
        }

        let request = GenerationRequest::new("x", AssetKind::Image);
        let failure = run(&strategist(), &provider, &request).await.unwrap_err();

        // initial + immediate retry; nothing to reduce
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.strategies_tried, vec!["immediate_retry"]);
        assert!(matches!(failure.error, Error::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(failure.error_class(), "timeout");
    }

    #[tokio::test]
    async fn test_attempt_cap_stops_retrying() {
        let provider = MockProvider::new();
        for _ in 0..10 {
            provider.add_response("x", Err(ProviderError::with_status(500, "internal error")));
        }

        let mut config = retry_config();
        config.max_attempts = 2;
        let strategist = RetryStrategist::new(&config, HashMap::new(), HashMap::new());
        let request = GenerationRequest::new("x", AssetKind::Image);
        let failure = run(&strategist, &provider, &request).await.unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_never_outlasts_wall_clock_cap() {
        let provider = MockProvider::new();
        for _ in 0..10 {
            provider.add_response("x", Err(ProviderError::with_status(500, "internal error")));
        }

        let mut config = retry_config();
        config.max_attempts = 10;
        config.max_elapsed = Duration::from_secs(1);
        config.backoff_ms = 5000;
        let strategist = RetryStrategist::new(&config, HashMap::new(), HashMap::new());
        let request = GenerationRequest::new("x", AssetKind::Image);

        let start = tokio::time::Instant::now();
        let failure = run(&strategist, &provider, &request).await.unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(provider.call_count(), 2);
        assert_eq!(failure.strategies_tried, vec!["immediate_retry"]);
        assert!(matches!(failure.error, Error::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_fatal_error_stops_without_counting_an_attempt() {
        let request = GenerationRequest::new("x", AssetKind::Image).with_tier(Tier::Sample);
        let failure = strategist()
            .execute(&request, |_, _| async {
                Err(AttemptError::Fatal(Error::BudgetExceeded {
                    tier: Tier::Sample,
                    requested: Decimal::ONE,
                    remaining: Decimal::ZERO,
                }))
            })
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::BudgetExceeded { .. }));
        assert_eq!(failure.attempts, 0);
        assert_eq!(failure.error_class(), "budget_exceeded");
    }

    #[tokio::test]
    async fn test_open_circuit_is_treated_as_unavailable() {
        let strategist = RetryStrategist::new(
            &retry_config(),
            HashMap::from([("a".to_string(), vec!["b".to_string()])]),
            HashMap::new(),
        );
        let request = GenerationRequest::new("x", AssetKind::Image).with_model("a");

        let outcome = strategist
            .execute(&request, |attempt, _| async move {
                if attempt.model.as_deref() == Some("a") {
                    Err(AttemptError::CircuitOpen("a".to_string()))
                } else {
                    Ok(GeneratedArtifact::bytes(b"ok".to_vec()))
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.request.model.as_deref(), Some("b"));
        assert_eq!(
            outcome.history[0].failure.as_ref().map(|f| f.0),
            Some(FailureClass::ProviderUnavailable)
        );
    }
}
