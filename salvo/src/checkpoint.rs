//! Durable run progress.
//!
//! Outcomes are accumulated in memory and written to storage every `interval`
//! records and on every failure, so a crash loses at most `interval - 1`
//! successes. Each flush can also be mirrored to `<mirror_dir>/<run_id>.json`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::CheckpointConfig;
use crate::error::{Error, Result};
use crate::request::RunId;
use crate::storage::{RunRecord, RunStatus, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Success,
    Failed,
}

/// Where a resumed run picks up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// Highest durably recorded success index
    pub last_index: Option<usize>,
    pub run: RunRecord,
}

/// Final numbers for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub run_id: RunId,
    pub total_assets: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_cost: Decimal,
    pub status: RunStatus,
}

impl From<&RunRecord> for RunStats {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.run_id.clone(),
            total_assets: run.total_assets,
            completed: run.completed_count,
            failed: run.failed_count,
            total_cost: run.total_cost,
            status: run.status,
        }
    }
}

struct ActiveRun {
    record: RunRecord,
    unflushed: usize,
}

pub struct CheckpointStore<S: Storage> {
    storage: Arc<S>,
    interval: usize,
    mirror_dir: Option<PathBuf>,
    active: Mutex<HashMap<RunId, ActiveRun>>,
}

impl<S: Storage> CheckpointStore<S> {
    pub fn new(storage: Arc<S>, config: &CheckpointConfig) -> Self {
        Self {
            storage,
            interval: config.interval.max(1),
            mirror_dir: config.mirror_dir.clone(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new run.
    ///
    /// # Errors
    /// - `InvalidRequest` if a run with this id already exists
    pub async fn start_run(&self, run_id: &RunId, total_assets: usize) -> Result<RunRecord> {
        let mut active = self.active.lock().await;

        if active.contains_key(run_id) || self.storage.get_run(run_id).await?.is_some() {
            return Err(Error::InvalidRequest(format!("run {run_id} already exists")));
        }

        let record = RunRecord::new(run_id.clone(), total_assets);
        self.write(&record).await?;
        tracing::info!(run_id = %run_id, total_assets, "Started run");

        active.insert(
            run_id.clone(),
            ActiveRun {
                record: record.clone(),
                unflushed: 0,
            },
        );
        Ok(record)
    }

    /// A run is resumable iff it exists and is neither completed nor cancelled.
    pub async fn can_resume(&self, run_id: &RunId) -> Result<bool> {
        if let Some(run) = self.active.lock().await.get(run_id) {
            return Ok(run.record.status.is_resumable());
        }
        Ok(self
            .storage
            .get_run(run_id)
            .await?
            .is_some_and(|run| run.status.is_resumable()))
    }

    /// Reload a run from storage and mark it in progress.
    pub async fn resume(&self, run_id: &RunId) -> Result<ResumePoint> {
        let mut active = self.active.lock().await;

        let mut record = self
            .storage
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                resource: "run",
                id: run_id.to_string(),
            })?;

        if !record.status.is_resumable() {
            return Err(Error::InvalidRequest(format!(
                "run {run_id} is {} and cannot be resumed",
                record.status
            )));
        }

        record.status = RunStatus::InProgress;
        record.updated_at = Utc::now();
        self.write(&record).await?;

        tracing::info!(
            run_id = %run_id,
            completed = record.completed_count,
            failed = record.failed_count,
            last_index = ?record.last_index,
            "Resuming run"
        );

        let point = ResumePoint {
            last_index: record.last_index,
            run: record.clone(),
        };
        active.insert(
            run_id.clone(),
            ActiveRun {
                record,
                unflushed: 0,
            },
        );
        Ok(point)
    }

    /// Record one outcome. Tolerates out-of-order and repeated indices; a
    /// success recorded for an index that previously failed replaces the failure.
    pub async fn record(
        &self,
        run_id: &RunId,
        index: usize,
        status: RecordStatus,
        cost: Decimal,
    ) -> Result<()> {
        let mut active = self.active.lock().await;
        let run = active.get_mut(run_id).ok_or_else(|| Error::NotFound {
            resource: "active run",
            id: run_id.to_string(),
        })?;

        let record = &mut run.record;
        match status {
            RecordStatus::Success => {
                if record.completed_indices.insert(index) {
                    record.completed_count += 1;
                    if record.failed_indices.remove(&index) {
                        record.failed_count -= 1;
                    }
                }
                record.last_index = record.last_index.max(Some(index));
            }
            RecordStatus::Failed => {
                if !record.completed_indices.contains(&index) && record.failed_indices.insert(index) {
                    record.failed_count += 1;
                }
            }
        }
        record.total_cost += cost;
        record.status = RunStatus::InProgress;
        record.updated_at = Utc::now();
        run.unflushed += 1;

        if status == RecordStatus::Failed || run.unflushed >= self.interval {
            let snapshot = run.record.clone();
            run.unflushed = 0;
            self.write(&snapshot).await?;
        }
        Ok(())
    }

    /// Force the in-memory progress of a run to storage.
    pub async fn flush(&self, run_id: &RunId) -> Result<()> {
        let mut active = self.active.lock().await;
        if let Some(run) = active.get_mut(run_id) {
            let snapshot = run.record.clone();
            run.unflushed = 0;
            self.write(&snapshot).await?;
        }
        Ok(())
    }

    /// Mark a run completed and release it.
    pub async fn complete(&self, run_id: &RunId) -> Result<RunStats> {
        let mut active = self.active.lock().await;
        let mut run = active.remove(run_id).ok_or_else(|| Error::NotFound {
            resource: "active run",
            id: run_id.to_string(),
        })?;

        run.record.status = RunStatus::Completed;
        run.record.updated_at = Utc::now();
        self.write(&run.record).await?;

        let stats = RunStats::from(&run.record);
        tracing::info!(
            run_id = %run_id,
            completed = stats.completed,
            failed = stats.failed,
            total_cost = %stats.total_cost,
            "Run completed"
        );
        Ok(stats)
    }

    /// Mark a run cancelled so it will not be resumed. Works on runs owned by
    /// another process too.
    pub async fn cancel(&self, run_id: &RunId) -> Result<RunStats> {
        let mut active = self.active.lock().await;
        let mut record = match active.remove(run_id) {
            Some(run) => run.record,
            None => self
                .storage
                .get_run(run_id)
                .await?
                .ok_or_else(|| Error::NotFound {
                    resource: "run",
                    id: run_id.to_string(),
                })?,
        };

        record.status = RunStatus::Cancelled;
        record.updated_at = Utc::now();
        self.write(&record).await?;
        tracing::info!(run_id = %run_id, "Run cancelled");
        Ok(RunStats::from(&record))
    }

    /// Current view of a run: in-memory progress if active here, else storage.
    pub async fn status(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        if let Some(run) = self.active.lock().await.get(run_id) {
            return Ok(Some(run.record.clone()));
        }
        self.storage.get_run(run_id).await
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        self.storage.list_runs().await
    }

    async fn write(&self, record: &RunRecord) -> Result<()> {
        self.storage.save_run(record).await?;

        if let Some(dir) = &self.mirror_dir {
            tokio::fs::create_dir_all(dir).await?;
            let path = dir.join(format!("{}.json", record.run_id));
            let tmp = dir.join(format!("{}.json.tmp", record.run_id));
            tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }

        tracing::trace!(
            run_id = %record.run_id,
            completed = record.completed_count,
            failed = record.failed_count,
            "Checkpoint written"
        );
        Ok(())
    }
}
