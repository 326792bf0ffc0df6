//! In-memory storage implementation.
//!
//! Keeps every table in a `parking_lot::RwLock`-guarded map. Suitable for tests
//! and dry runs; everything is lost when the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::request::{Fingerprint, RunId, TransactionId};

use super::models::*;
use super::Storage;

/// In-memory implementation of the Storage trait.
///
/// Cloning is cheap and clones share state, so a test can hand one copy to the
/// scheduler and inspect another.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    assets: Arc<RwLock<HashMap<(RunId, usize), AssetRecord>>>,
    cache: Arc<RwLock<HashMap<Fingerprint, CacheEntry>>>,
    transactions: Arc<RwLock<Vec<LedgerEntry>>>,
    runs: Arc<RwLock<HashMap<RunId, RunRecord>>>,
    retry_history: Arc<RwLock<Vec<RetryHistoryEntry>>>,
}

impl InMemoryStorage {
    /// Create a new in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    async fn upsert_asset(&self, asset: &AssetRecord) -> Result<()> {
        self.assets
            .write()
            .insert((asset.run_id.clone(), asset.sequence_index), asset.clone());
        Ok(())
    }

    async fn list_assets(&self, run_id: &RunId) -> Result<Vec<AssetRecord>> {
        let mut assets: Vec<AssetRecord> = self
            .assets
            .read()
            .values()
            .filter(|a| &a.run_id == run_id)
            .cloned()
            .collect();
        assets.sort_by_key(|a| a.sequence_index);
        Ok(assets)
    }

    async fn get_cache_entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        Ok(self.cache.read().get(fingerprint).cloned())
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        let mut cache = self.cache.write();
        let stored = cache
            .entry(entry.fingerprint.clone())
            .and_modify(|existing| {
                existing.use_count += 1;
                existing.last_used_at = entry.last_used_at;
            })
            .or_insert_with(|| entry.clone());
        Ok(stored.clone())
    }

    async fn touch_cache_entry(&self, fingerprint: &Fingerprint, at: DateTime<Utc>) -> Result<()> {
        if let Some(existing) = self.cache.write().get_mut(fingerprint) {
            existing.use_count += 1;
            existing.last_used_at = at;
        }
        Ok(())
    }

    async fn delete_cache_entry(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.cache.write().remove(fingerprint).is_some())
    }

    async fn list_cache_entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries: Vec<CacheEntry> = self.cache.read().values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    async fn insert_transaction(&self, entry: &LedgerEntry) -> Result<()> {
        let mut transactions = self.transactions.write();
        if transactions.iter().any(|t| t.id == entry.id) {
            return Err(Error::InvalidRequest(format!(
                "transaction {} already exists",
                entry.id
            )));
        }
        transactions.push(entry.clone());
        Ok(())
    }

    async fn update_transaction(
        &self,
        id: TransactionId,
        status: TransactionStatus,
        amount: Option<Decimal>,
        retry_count: Option<u32>,
    ) -> Result<LedgerEntry> {
        let mut transactions = self.transactions.write();
        let entry = transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound {
                resource: "transaction",
                id: id.0.to_string(),
            })?;

        entry.status = status;
        if let Some(amount) = amount {
            entry.amount = amount;
        }
        if let Some(retry_count) = retry_count {
            entry.retry_count = retry_count;
        }
        if status != TransactionStatus::Pending {
            entry.closed_at = Some(Utc::now());
        }
        Ok(entry.clone())
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<LedgerEntry>> {
        Ok(self
            .transactions
            .read()
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .transactions
            .read()
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn fail_pending_transactions(&self) -> Result<Vec<TransactionId>> {
        let now = Utc::now();
        let mut changed = Vec::new();
        for entry in self.transactions.write().iter_mut() {
            if entry.status == TransactionStatus::Pending {
                entry.status = TransactionStatus::Failed;
                entry.closed_at = Some(now);
                changed.push(entry.id);
            }
        }
        Ok(changed)
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.runs.write().insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().get(run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self.runs.read().values().cloned().collect();
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(runs)
    }

    async fn append_retry_history(&self, entry: &RetryHistoryEntry) -> Result<()> {
        self.retry_history.write().push(entry.clone());
        Ok(())
    }

    async fn list_retry_history(&self, fingerprint: &Fingerprint) -> Result<Vec<RetryHistoryEntry>> {
        let mut history: Vec<RetryHistoryEntry> = self
            .retry_history
            .read()
            .iter()
            .filter(|h| &h.fingerprint == fingerprint)
            .cloned()
            .collect();
        history.sort_by_key(|h| h.attempt);
        Ok(history)
    }
}
