//! Configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `salvo.yaml` and can be set with `-f` or the `SALVO_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `salvo.yaml`)
//! 2. **Environment variables** - Variables prefixed with `SALVO_` override YAML values
//!
//! Nested values use double underscores, e.g. `SALVO_BUDGET__PRODUCTION_CEILING=25.00` sets
//! `budget.production_ceiling`.
//!
//! ## Example
//!
//! ```yaml
//! database:
//!   url: sqlite://salvo.db
//! output_dir: ./artifacts
//! provider:
//!   url: https://images.example.com/v1/generate
//!   default_model: flux-dev
//! budget:
//!   sample_ceiling: 5.00
//!   production_ceiling: 50.00
//!   window: 24h
//! costs:
//!   default: 0.04
//!   per_model:
//!     flux-pro: 0.15
//! scheduler:
//!   concurrency: 3
//!   request_timeout: 2m
//! model_fallbacks:
//!   flux-pro: [flux-dev, flux-schnell]
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::request::{AssetKind, GenerationRequest};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "SALVO_CONFIG", default_value = "salvo.yaml")]
    pub config: String,

    /// Validate configuration and exit without doing anything else
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a batch of requests, resuming the run if it was interrupted
    Run {
        /// JSON array or JSON-lines file of generation requests
        requests: PathBuf,

        /// Run identifier; reuse it to resume. Defaults to a fresh id.
        #[arg(long)]
        run_id: Option<String>,

        /// Override `scheduler.concurrency`
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Show checkpoint progress for a run
    Status { run_id: String },
    /// Mark a run cancelled so it is no longer resumed
    Cancel { run_id: String },
    /// Remove stale cache entries
    Sweep {
        /// Remove entries older than this (defaults to `cache.ttl`)
        #[arg(long, value_parser = humantime::parse_duration)]
        max_age: Option<Duration>,
    },
    /// Show spend and remaining budget per tier
    Ledger,
}

/// Main configuration.
///
/// Every field has a default, so an empty file is a valid (mock-free but
/// provider-less) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite database holding the ledger, cache index and checkpoints
    pub database: DatabaseConfig,
    /// Root directory for downloaded artifacts
    pub output_dir: PathBuf,
    /// Generation provider endpoint
    pub provider: ProviderConfig,
    /// Spending ceilings
    pub budget: BudgetConfig,
    /// Price table used to estimate request cost
    pub costs: CostsConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub checkpoint: CheckpointConfig,
    pub cache: CacheConfig,
    /// Ordered alternates per model, tried when a model is unavailable
    pub model_fallbacks: HashMap<String, Vec<String>>,
    /// Placeholder artifacts used by the generic-fallback strategy
    pub fallback_artifacts: HashMap<AssetKind, PathBuf>,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            output_dir: PathBuf::from("artifacts"),
            provider: ProviderConfig::default(),
            budget: BudgetConfig::default(),
            costs: CostsConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            checkpoint: CheckpointConfig::default(),
            cache: CacheConfig::default(),
            model_fallbacks: HashMap::new(),
            fallback_artifacts: HashMap::new(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite connection string
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://salvo.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    /// Generation endpoint. Required for `run`.
    pub url: Option<String>,
    /// Bearer token sent with every call
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Model used for requests that don't name one
    pub default_model: Option<String>,
}

/// Ceilings per tier. Tiers are independent pools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    pub sample_ceiling: Decimal,
    pub production_ceiling: Decimal,
    /// Optional cap across both tiers
    pub global_ceiling: Option<Decimal>,
    /// Only spend inside this trailing window counts (e.g. `24h` for a daily budget).
    /// Unset means all-time.
    #[serde(with = "humantime_serde")]
    pub window: Option<Duration>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            sample_ceiling: Decimal::new(5, 0),
            production_ceiling: Decimal::new(50, 0),
            global_ceiling: None,
            window: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CostsConfig {
    /// Price when neither the model nor the asset kind has one
    pub default: Decimal,
    pub per_model: HashMap<String, Decimal>,
    pub per_asset_kind: HashMap<AssetKind, Decimal>,
}

impl Default for CostsConfig {
    fn default() -> Self {
        Self {
            default: Decimal::new(4, 2),
            per_model: HashMap::new(),
            per_asset_kind: HashMap::new(),
        }
    }
}

impl CostsConfig {
    /// Estimated cost of a request: explicit override, then model price, then
    /// asset-kind price, then the default.
    pub fn estimate(&self, request: &GenerationRequest, model: Option<&str>) -> Decimal {
        if let Some(cost) = request.estimated_cost {
            return cost;
        }
        model
            .and_then(|m| self.per_model.get(m))
            .or_else(|| self.per_asset_kind.get(&request.asset_kind))
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Maximum in-flight provider calls
    pub concurrency: usize,
    /// Deadline for a single provider call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Provider request-rate cap. None means unlimited.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            request_timeout: Duration::from_secs(120),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Sustained rate
    pub requests_per_second: f64,
    /// Bucket size
    #[serde(default = "RateLimitConfig::default_burst")]
    pub burst: u32,
}

impl RateLimitConfig {
    fn default_burst() -> u32 {
        1
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Provider attempts per request, including the first
    pub max_attempts: u32,
    /// Wall-clock cap per request across all attempts
    #[serde(with = "humantime_serde")]
    pub max_elapsed: Duration,
    /// Delay before the first delayed retry
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
    /// Word limit applied by the prompt-simplification strategy
    pub simplified_prompt_words: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_elapsed: Duration::from_secs(600),
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 60_000,
            simplified_prompt_words: 12,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Concurrent probes allowed while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_probes: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Persist progress after this many recorded outcomes
    pub interval: usize,
    /// Also write `<dir>/<run_id>.json` on every flush
    pub mirror_dir: Option<PathBuf>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 10,
            mirror_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Entries older than this are misses. None means entries never expire.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(30 * 24 * 60 * 60)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("SALVO_").split("__").ignore(&["CONFIG"]))
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), Error> {
        if self.scheduler.concurrency == 0 {
            return Err(Error::Config("scheduler.concurrency must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.backoff_factor == 0 {
            return Err(Error::Config("retry.backoff_factor must be at least 1".to_string()));
        }
        if self.checkpoint.interval == 0 {
            return Err(Error::Config("checkpoint.interval must be at least 1".to_string()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.half_open_max_probes == 0 {
            return Err(Error::Config(
                "circuit_breaker.half_open_max_probes must be at least 1".to_string(),
            ));
        }
        if let Some(rate) = &self.scheduler.rate_limit {
            if rate.requests_per_second.is_nan() || rate.requests_per_second <= 0.0 || rate.burst == 0
            {
                return Err(Error::Config(
                    "scheduler.rate_limit needs a positive requests_per_second and burst".to_string(),
                ));
            }
        }

        let ceilings = [
            ("budget.sample_ceiling", Some(self.budget.sample_ceiling)),
            ("budget.production_ceiling", Some(self.budget.production_ceiling)),
            ("budget.global_ceiling", self.budget.global_ceiling),
        ];
        for (name, value) in ceilings {
            if value.is_some_and(|v| v.is_sign_negative()) {
                return Err(Error::Config(format!("{name} cannot be negative")));
            }
        }

        if let Some((model, _)) = self
            .costs
            .per_model
            .iter()
            .find(|(_, cost)| cost.is_sign_negative())
        {
            return Err(Error::Config(format!("costs.per_model.{model} cannot be negative")));
        }

        for (model, alternates) in &self.model_fallbacks {
            if alternates.iter().any(|alt| alt == model) {
                return Err(Error::Config(format!(
                    "model_fallbacks.{model} lists itself as an alternate"
                )));
            }
        }

        Ok(())
    }
}
