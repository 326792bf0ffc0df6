//! Bounded, resumable, cost-aware batch generation against paid content providers.
//!
//! This crate turns a list of generation requests into downloaded artifacts while:
//! - Skipping work already done (content-addressed cache keyed by request fingerprint)
//! - Never exceeding a spending ceiling (ledger transaction around every paid call)
//! - Riding out provider failures (classified retries, fallbacks and circuit breakers)
//! - Surviving restarts (periodic checkpoints; a resumed run skips completed requests)
//!
//! # Example
//! ```ignore
//! use salvo::{BatchScheduler, Config, HttpProvider, SqliteStorage};
//!
//! let storage = Arc::new(SqliteStorage::connect(&config.database.url, 5).await?);
//! let provider = Arc::new(HttpProvider::new(url, api_key));
//! let scheduler = Arc::new(BatchScheduler::new(storage, provider, &config));
//!
//! let report = scheduler.run_batch(requests, None, Some(run_id)).await?;
//! println!("{report}");
//! ```

pub mod artifacts;
pub mod cache;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod ledger;
pub mod provider;
pub mod rate_limit;
pub mod report;
pub mod request;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

#[cfg(test)]
mod test;

// Re-export commonly used types
pub use cache::ContentCache;
pub use checkpoint::CheckpointStore;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakers, CircuitState};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::BudgetLedger;
pub use provider::{GeneratedArtifact, HttpProvider, MockProvider, Provider, ProviderError};
pub use rate_limit::RateLimiter;
pub use report::BatchReport;
pub use request::*;
pub use retry::RetryStrategist;
pub use scheduler::BatchScheduler;
pub use storage::{InMemoryStorage, SqliteStorage, Storage};
