use std::future::Future;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::Result;
use crate::request::{Fingerprint, RunId, TransactionId};

pub mod in_memory;
pub mod models;
pub mod sqlite;


pub use in_memory::InMemoryStorage;
pub use models::*;
pub use sqlite::SqliteStorage;

/// Durable record of assets, cache entries, ledger rows, runs and retry history.
///
/// Every write is committed before the call returns; callers rely on this for
/// crash safety (a ledger row opened before a paid call survives the process).
pub trait Storage: Send + Sync {
    /// Insert or replace the outcome row for `(run_id, sequence_index)`.
    fn upsert_asset(&self, asset: &AssetRecord) -> impl Future<Output = Result<()>> + Send;

    /// All asset rows for a run, ordered by sequence index.
    fn list_assets(&self, run_id: &RunId) -> impl Future<Output = Result<Vec<AssetRecord>>> + Send;

    /// Look up a cache entry without touching its use count.
    fn get_cache_entry(
        &self,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<Option<CacheEntry>>> + Send;

    /// Insert a cache entry, or bump `use_count` and `last_used_at` if the
    /// fingerprint is already present. Returns the stored entry.
    fn put_cache_entry(
        &self,
        entry: &CacheEntry,
    ) -> impl Future<Output = Result<CacheEntry>> + Send;

    /// Record a cache hit.
    fn touch_cache_entry(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Returns whether an entry was removed.
    fn delete_cache_entry(
        &self,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn list_cache_entries(&self) -> impl Future<Output = Result<Vec<CacheEntry>>> + Send;

    /// Insert a new ledger row.
    fn insert_transaction(&self, entry: &LedgerEntry) -> impl Future<Output = Result<()>> + Send;

    /// Move a transaction to `status`, optionally replacing its amount.
    ///
    /// # Errors
    /// - `NotFound` if the transaction doesn't exist
    fn update_transaction(
        &self,
        id: TransactionId,
        status: TransactionStatus,
        amount: Option<Decimal>,
        retry_count: Option<u32>,
    ) -> impl Future<Output = Result<LedgerEntry>> + Send;

    fn get_transaction(
        &self,
        id: TransactionId,
    ) -> impl Future<Output = Result<Option<LedgerEntry>>> + Send;

    /// Ledger rows matching `filter`, oldest first.
    fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> impl Future<Output = Result<Vec<LedgerEntry>>> + Send;

    /// Mark every pending row failed, keeping its reserved amount. Returns the
    /// ids that were changed.
    fn fail_pending_transactions(&self) -> impl Future<Output = Result<Vec<TransactionId>>> + Send;

    /// Insert or replace a run row.
    fn save_run(&self, run: &RunRecord) -> impl Future<Output = Result<()>> + Send;

    fn get_run(&self, run_id: &RunId) -> impl Future<Output = Result<Option<RunRecord>>> + Send;

    /// All runs, most recently updated first.
    fn list_runs(&self) -> impl Future<Output = Result<Vec<RunRecord>>> + Send;

    fn append_retry_history(
        &self,
        entry: &RetryHistoryEntry,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Retry attempts recorded for a fingerprint, in attempt order.
    fn list_retry_history(
        &self,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<Vec<RetryHistoryEntry>>> + Send;
}
