//! Budget ledger and transaction guard.
//!
//! Every paid call is bracketed by a ledger row: opened `pending` (reserving the
//! estimate) before the call and closed `success`/`failed` after it. The budget
//! check and the insert of the pending row happen under one lock, so concurrent
//! workers can never jointly overshoot a ceiling.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::BudgetConfig;
use crate::error::{Error, Result};
use crate::request::{GenerationRequest, RunId, Tier, TransactionId};
use crate::storage::{LedgerEntry, Storage, TransactionFilter, TransactionStatus};

/// Result of a budget pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetCheck {
    pub allowed: bool,
    /// Remaining headroom before this charge
    pub remaining: Decimal,
}

/// How a paid call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Success,
    /// The provider failed; nothing was delivered
    Failed,
    /// The provider charged but the artifact never made it to disk. The
    /// reserved amount stays unless an actual cost is given.
    Undelivered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierSummary {
    pub tier: Tier,
    pub ceiling: Decimal,
    pub spent: Decimal,
    pub remaining: Decimal,
    pub pending: usize,
    pub success: usize,
    pub failed: usize,
    pub rolled_back: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub tiers: Vec<TierSummary>,
    pub global_spent: Decimal,
    pub global_ceiling: Option<Decimal>,
    /// Accounting window, if spend is only counted over a trailing period
    #[serde(with = "humantime_serde")]
    pub window: Option<Duration>,
}

pub struct BudgetLedger<S: Storage> {
    storage: Arc<S>,
    config: BudgetConfig,
    /// Serializes all ledger writes; held across check + open.
    write_lock: Mutex<()>,
}

impl<S: Storage> BudgetLedger<S> {
    pub fn new(storage: Arc<S>, config: &BudgetConfig) -> Self {
        Self {
            storage,
            config: config.clone(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn ceiling(&self, tier: Tier) -> Decimal {
        match tier {
            Tier::Sample => self.config.sample_ceiling,
            Tier::Production => self.config.production_ceiling,
        }
    }

    fn window_start(&self) -> Option<DateTime<Utc>> {
        let window = chrono::Duration::from_std(self.config.window?).ok()?;
        Some(Utc::now() - window)
    }

    /// Spend counted against a tier, or across all tiers for `None`.
    ///
    /// Every row counts, whatever its status: pending rows are reserved spend
    /// and rolled-back rows keep the cost the provider already charged.
    pub async fn spent(&self, tier: Option<Tier>) -> Result<Decimal> {
        let rows = self
            .storage
            .list_transactions(&TransactionFilter {
                tier,
                since: self.window_start(),
                ..Default::default()
            })
            .await?;
        Ok(rows.iter().map(|r| r.amount).sum())
    }

    /// Headroom left for `tier`, taking the global ceiling into account.
    pub async fn remaining(&self, tier: Tier) -> Result<Decimal> {
        let tier_remaining = self.ceiling(tier) - self.spent(Some(tier)).await?;
        let remaining = match self.config.global_ceiling {
            Some(global) => tier_remaining.min(global - self.spent(None).await?),
            None => tier_remaining,
        };
        Ok(remaining.max(Decimal::ZERO))
    }

    /// Would a charge of `cost` fit? Read-only; use [`open_transaction`](Self::open_transaction)
    /// to actually reserve it.
    pub async fn check_budget(&self, cost: Decimal, tier: Tier) -> Result<BudgetCheck> {
        let remaining = self.remaining(tier).await?;
        Ok(BudgetCheck {
            allowed: cost <= remaining,
            remaining,
        })
    }

    /// Check the budget and, if it allows, insert a pending row reserving `cost`.
    ///
    /// # Errors
    /// - `BudgetExceeded` if the charge would breach a ceiling. No row is written.
    pub async fn open_transaction(
        &self,
        request: &GenerationRequest,
        cost: Decimal,
        run_id: Option<&RunId>,
    ) -> Result<TransactionId> {
        let _guard = self.write_lock.lock().await;

        let check = self.check_budget(cost, request.tier).await?;
        if !check.allowed {
            tracing::warn!(
                tier = %request.tier,
                requested = %cost,
                remaining = %check.remaining,
                "Budget check rejected request"
            );
            return Err(Error::BudgetExceeded {
                tier: request.tier,
                requested: cost,
                remaining: check.remaining,
            });
        }

        let entry = LedgerEntry {
            id: TransactionId::new(),
            run_id: run_id.cloned(),
            fingerprint: request.fingerprint(),
            asset_kind: request.asset_kind,
            model: request.model.clone(),
            tier: request.tier,
            amount: cost,
            status: TransactionStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            closed_at: None,
        };
        self.storage.insert_transaction(&entry).await?;

        tracing::debug!(
            transaction_id = %entry.id,
            tier = %entry.tier,
            amount = %cost,
            "Opened transaction"
        );
        Ok(entry.id)
    }

    /// Close a pending transaction.
    ///
    /// Without `actual_cost`, a success keeps the reserved amount and a failure
    /// records zero.
    pub async fn close_transaction(
        &self,
        id: TransactionId,
        outcome: TransactionOutcome,
        actual_cost: Option<Decimal>,
        retry_count: u32,
    ) -> Result<LedgerEntry> {
        let _guard = self.write_lock.lock().await;

        let (status, amount) = match outcome {
            TransactionOutcome::Success => (TransactionStatus::Success, actual_cost),
            TransactionOutcome::Failed => (
                TransactionStatus::Failed,
                Some(actual_cost.unwrap_or(Decimal::ZERO)),
            ),
            TransactionOutcome::Undelivered => (TransactionStatus::Failed, actual_cost),
        };

        let entry = self
            .storage
            .update_transaction(id, status, amount, Some(retry_count))
            .await?;

        tracing::debug!(
            transaction_id = %id,
            status = %entry.status,
            amount = %entry.amount,
            "Closed transaction"
        );
        Ok(entry)
    }

    /// Mark a transaction rolled back. The amount is kept: rollback is an audit
    /// marker and never refunds what the provider charged.
    pub async fn rollback(&self, id: TransactionId) -> Result<LedgerEntry> {
        let _guard = self.write_lock.lock().await;
        self.storage
            .update_transaction(id, TransactionStatus::RolledBack, None, None)
            .await
    }

    /// Fail rows left pending by a crashed process. Their reserved amount stays
    /// as spend, since the provider may have charged for the call.
    pub async fn reconcile_pending(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let ids = self.storage.fail_pending_transactions().await?;
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "Reconciled pending transactions from a previous run");
        }
        Ok(ids.len())
    }

    pub async fn summary(&self) -> Result<LedgerSummary> {
        let rows = self
            .storage
            .list_transactions(&TransactionFilter {
                since: self.window_start(),
                ..Default::default()
            })
            .await?;

        let global_spent: Decimal = rows.iter().map(|r| r.amount).sum();
        let global_remaining = self.config.global_ceiling.map(|c| c - global_spent);

        let tiers = Tier::ALL
            .iter()
            .map(|&tier| {
                let tier_rows: Vec<&LedgerEntry> = rows.iter().filter(|r| r.tier == tier).collect();
                let count = |status: TransactionStatus| tier_rows.iter().filter(|r| r.status == status).count();
                let spent: Decimal = tier_rows.iter().map(|r| r.amount).sum();
                let ceiling = self.ceiling(tier);
                let remaining = match global_remaining {
                    Some(global) => (ceiling - spent).min(global),
                    None => ceiling - spent,
                };

                TierSummary {
                    tier,
                    ceiling,
                    spent,
                    remaining: remaining.max(Decimal::ZERO),
                    pending: count(TransactionStatus::Pending),
                    success: count(TransactionStatus::Success),
                    failed: count(TransactionStatus::Failed),
                    rolled_back: count(TransactionStatus::RolledBack),
                }
            })
            .collect();

        Ok(LedgerSummary {
            tiers,
            global_spent,
            global_ceiling: self.config.global_ceiling,
            window: self.config.window,
        })
    }
}
