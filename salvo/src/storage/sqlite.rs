//! SQLite storage backend.
//!
//! Uses a WAL-mode connection pool with embedded migrations. Queries are built at
//! runtime (`sqlx::query`) so the crate compiles without a live database. Money
//! is stored as decimal strings and summed in Rust to avoid float rounding.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::request::{Fingerprint, RunId, TransactionId};

use super::models::*;
use super::Storage;

/// SQLite storage backend.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `url` and run migrations.
    ///
    /// # Example
    /// ```ignore
    /// let storage = SqliteStorage::connect("sqlite://salvo.db", 5).await?;
    /// ```
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?;
        Self::connect_with(options, max_connections).await
    }

    /// Open the database file at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::connect_with(SqliteConnectOptions::new().filename(path), 5).await
    }

    async fn connect_with(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).map_err(|e| Error::Other(anyhow!("invalid decimal '{value}': {e}")))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Other(anyhow!("invalid uuid '{value}': {e}")))
}

#[derive(FromRow)]
struct AssetRow {
    run_id: String,
    sequence_index: i64,
    fingerprint: String,
    asset_kind: String,
    model: Option<String>,
    prompt: String,
    status: String,
    cost: String,
    retry_count: i64,
    file_path: Option<String>,
    error_class: Option<String>,
    error_message: Option<String>,
    strategies_tried: String,
    degraded: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AssetRow> for AssetRecord {
    type Error = Error;

    fn try_from(row: AssetRow) -> Result<Self> {
        Ok(AssetRecord {
            fingerprint: Fingerprint::from(row.fingerprint),
            run_id: RunId::from(row.run_id),
            sequence_index: row.sequence_index as usize,
            asset_kind: row.asset_kind.parse()?,
            model: row.model,
            prompt: row.prompt,
            status: row.status.parse()?,
            cost: parse_decimal(&row.cost)?,
            retry_count: row.retry_count as u32,
            file_path: row.file_path,
            error_class: row.error_class,
            error_message: row.error_message,
            strategies_tried: serde_json::from_str(&row.strategies_tried)?,
            degraded: row.degraded,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct CacheRow {
    fingerprint: String,
    artifact_path: String,
    created_at: DateTime<Utc>,
    size_bytes: i64,
    use_count: i64,
    last_used_at: DateTime<Utc>,
}

impl From<CacheRow> for CacheEntry {
    fn from(row: CacheRow) -> Self {
        CacheEntry {
            fingerprint: Fingerprint::from(row.fingerprint),
            artifact_path: row.artifact_path,
            created_at: row.created_at,
            size_bytes: row.size_bytes.max(0) as u64,
            use_count: row.use_count.max(0) as u64,
            last_used_at: row.last_used_at,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: String,
    run_id: Option<String>,
    fingerprint: String,
    asset_kind: String,
    model: Option<String>,
    tier: String,
    amount: String,
    status: String,
    retry_count: i64,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for LedgerEntry {
    type Error = Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(LedgerEntry {
            id: TransactionId::from(parse_uuid(&row.id)?),
            run_id: row.run_id.map(RunId::from),
            fingerprint: Fingerprint::from(row.fingerprint),
            asset_kind: row.asset_kind.parse()?,
            model: row.model,
            tier: row.tier.parse()?,
            amount: parse_decimal(&row.amount)?,
            status: row.status.parse()?,
            retry_count: row.retry_count as u32,
            created_at: row.created_at,
            closed_at: row.closed_at,
        })
    }
}

#[derive(FromRow)]
struct RunRow {
    run_id: String,
    total_assets: i64,
    completed_count: i64,
    failed_count: i64,
    total_cost: String,
    last_index: Option<i64>,
    status: String,
    progress: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self> {
        let progress: RunProgress = serde_json::from_str(&row.progress)?;
        Ok(RunRecord {
            run_id: RunId::from(row.run_id),
            total_assets: row.total_assets as usize,
            completed_count: row.completed_count as usize,
            failed_count: row.failed_count as usize,
            total_cost: parse_decimal(&row.total_cost)?,
            last_index: row.last_index.map(|i| i as usize),
            status: row.status.parse()?,
            completed_indices: progress.completed,
            failed_indices: progress.failed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct RetryHistoryRow {
    fingerprint: String,
    run_id: Option<String>,
    attempt: i64,
    strategy: String,
    error_class: Option<String>,
    error_message: Option<String>,
    model: Option<String>,
    recorded_at: DateTime<Utc>,
}

impl From<RetryHistoryRow> for RetryHistoryEntry {
    fn from(row: RetryHistoryRow) -> Self {
        RetryHistoryEntry {
            fingerprint: Fingerprint::from(row.fingerprint),
            run_id: row.run_id.map(RunId::from),
            attempt: row.attempt as u32,
            strategy: row.strategy,
            error_class: row.error_class,
            error_message: row.error_message,
            model: row.model,
            recorded_at: row.recorded_at,
        }
    }
}

const TRANSACTION_COLUMNS: &str = "id, run_id, fingerprint, asset_kind, model, tier, amount, \
     status, retry_count, created_at, closed_at";

const RUN_COLUMNS: &str = "run_id, total_assets, completed_count, failed_count, total_cost, \
     last_index, status, progress, created_at, updated_at";

impl Storage for SqliteStorage {
    async fn upsert_asset(&self, asset: &AssetRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assets (
                run_id, sequence_index, fingerprint, asset_kind, model, prompt, status,
                cost, retry_count, file_path, error_class, error_message,
                strategies_tried, degraded, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id, sequence_index) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                asset_kind = excluded.asset_kind,
                model = excluded.model,
                prompt = excluded.prompt,
                status = excluded.status,
                cost = excluded.cost,
                retry_count = excluded.retry_count,
                file_path = excluded.file_path,
                error_class = excluded.error_class,
                error_message = excluded.error_message,
                strategies_tried = excluded.strategies_tried,
                degraded = excluded.degraded,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(asset.run_id.as_str())
        .bind(asset.sequence_index as i64)
        .bind(asset.fingerprint.as_str())
        .bind(asset.asset_kind.as_str())
        .bind(asset.model.as_deref())
        .bind(&asset.prompt)
        .bind(asset.status.as_str())
        .bind(asset.cost.to_string())
        .bind(asset.retry_count as i64)
        .bind(asset.file_path.as_deref())
        .bind(asset.error_class.as_deref())
        .bind(asset.error_message.as_deref())
        .bind(serde_json::to_string(&asset.strategies_tried)?)
        .bind(asset.degraded)
        .bind(asset.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_assets(&self, run_id: &RunId) -> Result<Vec<AssetRecord>> {
        let rows: Vec<AssetRow> = sqlx::query_as(
            r#"
            SELECT run_id, sequence_index, fingerprint, asset_kind, model, prompt, status,
                   cost, retry_count, file_path, error_class, error_message,
                   strategies_tried, degraded, updated_at
            FROM assets
            WHERE run_id = ?
            ORDER BY sequence_index ASC
            "#,
        )
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AssetRecord::try_from).collect()
    }

    async fn get_cache_entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let row: Option<CacheRow> = sqlx::query_as(
            r#"
            SELECT fingerprint, artifact_path, created_at, size_bytes, use_count, last_used_at
            FROM cache
            WHERE fingerprint = ?
            "#,
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CacheEntry::from))
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<CacheEntry> {
        let row: CacheRow = sqlx::query_as(
            r#"
            INSERT INTO cache (fingerprint, artifact_path, created_at, size_bytes, use_count, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (fingerprint) DO UPDATE SET
                use_count = cache.use_count + 1,
                last_used_at = excluded.last_used_at
            RETURNING fingerprint, artifact_path, created_at, size_bytes, use_count, last_used_at
            "#,
        )
        .bind(entry.fingerprint.as_str())
        .bind(&entry.artifact_path)
        .bind(entry.created_at)
        .bind(entry.size_bytes as i64)
        .bind(entry.use_count as i64)
        .bind(entry.last_used_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheEntry::from(row))
    }

    async fn touch_cache_entry(&self, fingerprint: &Fingerprint, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE cache SET use_count = use_count + 1, last_used_at = ? WHERE fingerprint = ?")
            .bind(at)
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_cache_entry(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cache WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_cache_entries(&self) -> Result<Vec<CacheEntry>> {
        let rows: Vec<CacheRow> = sqlx::query_as(
            r#"
            SELECT fingerprint, artifact_path, created_at, size_bytes, use_count, last_used_at
            FROM cache
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CacheEntry::from).collect())
    }

    async fn insert_transaction(&self, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, run_id, fingerprint, asset_kind, model, tier, amount, status,
                retry_count, created_at, closed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.0.to_string())
        .bind(entry.run_id.as_ref().map(|r| r.as_str()))
        .bind(entry.fingerprint.as_str())
        .bind(entry.asset_kind.as_str())
        .bind(entry.model.as_deref())
        .bind(entry.tier.as_str())
        .bind(entry.amount.to_string())
        .bind(entry.status.as_str())
        .bind(entry.retry_count as i64)
        .bind(entry.created_at)
        .bind(entry.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_transaction(
        &self,
        id: TransactionId,
        status: TransactionStatus,
        amount: Option<Decimal>,
        retry_count: Option<u32>,
    ) -> Result<LedgerEntry> {
        let closed_at = (status != TransactionStatus::Pending).then(Utc::now);
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE transactions SET
                status = ?,
                amount = COALESCE(?, amount),
                retry_count = COALESCE(?, retry_count),
                closed_at = COALESCE(?, closed_at)
            WHERE id = ?
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(status.as_str())
        .bind(amount.map(|a| a.to_string()))
        .bind(retry_count.map(|r| r as i64))
        .bind(closed_at)
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound {
            resource: "transaction",
            id: id.0.to_string(),
        })?
        .try_into()
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<LedgerEntry>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?"
        ))
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(LedgerEntry::try_from).transpose()
    }

    async fn list_transactions(&self, filter: &TransactionFilter) -> Result<Vec<LedgerEntry>> {
        let tier = filter.tier.map(|t| t.as_str());
        let status = filter.status.map(|s| s.as_str());
        let run_id = filter.run_id.as_ref().map(|r| r.as_str());

        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM transactions
            WHERE (? IS NULL OR tier = ?)
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR run_id = ?)
            ORDER BY created_at ASC
            "#
        ))
        .bind(tier)
        .bind(tier)
        .bind(status)
        .bind(status)
        .bind(run_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = rows
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        // Timestamps are compared as values, not as stored text
        entries.retain(|e| filter.matches(e));
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    async fn fail_pending_transactions(&self) -> Result<Vec<TransactionId>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE transactions
            SET status = 'failed', closed_at = ?
            WHERE status = 'pending'
            RETURNING id
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        ids.into_iter()
            .map(|(id,)| parse_uuid(&id).map(TransactionId::from))
            .collect()
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let progress = serde_json::to_string(&RunProgress {
            completed: run.completed_indices.clone(),
            failed: run.failed_indices.clone(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO runs (
                run_id, total_assets, completed_count, failed_count, total_cost,
                last_index, status, progress, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id) DO UPDATE SET
                total_assets = excluded.total_assets,
                completed_count = excluded.completed_count,
                failed_count = excluded.failed_count,
                total_cost = excluded.total_cost,
                last_index = excluded.last_index,
                status = excluded.status,
                progress = excluded.progress,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(run.run_id.as_str())
        .bind(run.total_assets as i64)
        .bind(run.completed_count as i64)
        .bind(run.failed_count as i64)
        .bind(run.total_cost.to_string())
        .bind(run.last_index.map(|i| i as i64))
        .bind(run.status.as_str())
        .bind(progress)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?"))
                .bind(run_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs"))
            .fetch_all(&self.pool)
            .await?;

        let mut runs = rows
            .into_iter()
            .map(RunRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(runs)
    }

    async fn append_retry_history(&self, entry: &RetryHistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO retry_history (
                fingerprint, run_id, attempt, strategy, error_class, error_message, model, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.fingerprint.as_str())
        .bind(entry.run_id.as_ref().map(|r| r.as_str()))
        .bind(entry.attempt as i64)
        .bind(&entry.strategy)
        .bind(entry.error_class.as_deref())
        .bind(entry.error_message.as_deref())
        .bind(entry.model.as_deref())
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_retry_history(&self, fingerprint: &Fingerprint) -> Result<Vec<RetryHistoryEntry>> {
        let rows: Vec<RetryHistoryRow> = sqlx::query_as(
            r#"
            SELECT fingerprint, run_id, attempt, strategy, error_class, error_message, model, recorded_at
            FROM retry_history
            WHERE fingerprint = ?
            ORDER BY attempt ASC, id ASC
            "#,
        )
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(RetryHistoryEntry::from).collect())
    }
}
