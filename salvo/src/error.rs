use rust_decimal::Decimal;
use thiserror::Error;

use crate::request::{Fingerprint, Tier};

/// Result type for salvo operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a generation batch.
///
/// Per-request variants (`BudgetExceeded`, `Provider*`, `RetriesExhausted`) are
/// contained by the scheduler and never unwind a batch. `Database` and
/// `Migration` are persistence failures and abort the batch.
#[derive(Debug, Error)]
pub enum Error {
    /// A prospective charge would breach the tier (or global) ceiling
    #[error("Budget exceeded for {tier} tier: requested {requested}, remaining {remaining}")]
    BudgetExceeded {
        tier: Tier,
        requested: Decimal,
        remaining: Decimal,
    },

    /// Timeouts, 5xx responses, rate limits: worth retrying
    #[error("Transient provider error: {0}")]
    ProviderTransient(String),

    /// Content-safety or invalid-input rejections: retried only via a changed request
    #[error("Provider rejected request: {0}")]
    ProviderRejected(String),

    /// Quota or auth failures: abandoned immediately
    #[error("Fatal provider error: {0}")]
    ProviderFatal(String),

    /// The circuit for a provider key is open and no call was made
    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    /// A cache entry points at an artifact that no longer exists
    #[error("Cache entry {fingerprint} references missing artifact {path}")]
    CacheCorruption { fingerprint: Fingerprint, path: String },

    /// Every applicable fallback strategy was tried without success
    #[error("Retries exhausted after {attempts} attempts ({strategies}): {last_error}")]
    RetriesExhausted {
        attempts: u32,
        strategies: String,
        last_error: String,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Entity not found
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// Invalid request or input file
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The batch was canceled by the operator
    #[error("Canceled: {0}")]
    Canceled(String),

    /// Filesystem error (artifact writes, checkpoint mirrors)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport failed (artifact downloads)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error means nothing can be safely recorded any more.
    ///
    /// Only these abort a batch; everything else is contained to one request.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Migration(_))
    }

    /// Short, stable category name used in reports and the `assets` table.
    pub fn category(&self) -> &'static str {
        match self {
            Error::BudgetExceeded { .. } => "budget_exceeded",
            Error::ProviderTransient(_) => "provider_transient",
            Error::ProviderRejected(_) => "provider_rejected",
            Error::ProviderFatal(_) => "provider_fatal",
            Error::CircuitOpen(_) => "circuit_open",
            Error::CacheCorruption { .. } => "cache_corruption",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::Database(_) | Error::Migration(_) => "persistence_failure",
            Error::NotFound { .. } => "not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Config(_) => "config",
            Error::Canceled(_) => "canceled",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Http(_) => "http",
            Error::Other(_) => "other",
        }
    }
}
