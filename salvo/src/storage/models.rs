//! Rows persisted by the [`Storage`](super::Storage) backends.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::request::{AssetKind, Fingerprint, RunId, Tier, TransactionId};

/// Implements `as_str` / `FromStr` / `Display` for a unit-only status enum.
macro_rules! status_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Other(anyhow::anyhow!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// A content-addressed pointer from a fingerprint to an artifact on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub artifact_path: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub use_count: u64,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    RolledBack,
}

status_enum!(TransactionStatus {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
    RolledBack => "rolled_back",
});

/// One ledger row. `amount` is the reserved estimate while pending and the
/// actual charge once closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: TransactionId,
    pub run_id: Option<RunId>,
    pub fingerprint: Fingerprint,
    pub asset_kind: AssetKind,
    pub model: Option<String>,
    pub tier: Tier,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    InProgress,
    Completed,
    Cancelled,
}

status_enum!(RunStatus {
    Started => "started",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Started | RunStatus::InProgress)
    }
}

/// Durable progress of one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub total_assets: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub total_cost: Decimal,
    /// Highest index recorded as a success, if any
    pub last_index: Option<usize>,
    pub status: RunStatus,
    pub completed_indices: BTreeSet<usize>,
    pub failed_indices: BTreeSet<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(run_id: RunId, total_assets: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            total_assets,
            completed_count: 0,
            failed_count: 0,
            total_cost: Decimal::ZERO,
            last_index: None,
            status: RunStatus::Started,
            completed_indices: BTreeSet::new(),
            failed_indices: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// The index sets of a run, stored as one JSON column.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RunProgress {
    pub completed: BTreeSet<usize>,
    pub failed: BTreeSet<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Pending,
    Generated,
    Cached,
    Degraded,
    Failed,
}

status_enum!(AssetStatus {
    Pending => "pending",
    Generated => "generated",
    Cached => "cached",
    Degraded => "degraded",
    Failed => "failed",
});

/// Outcome of one request within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub fingerprint: Fingerprint,
    pub run_id: RunId,
    pub sequence_index: usize,
    pub asset_kind: AssetKind,
    pub model: Option<String>,
    pub prompt: String,
    pub status: AssetStatus,
    pub cost: Decimal,
    pub retry_count: u32,
    pub file_path: Option<String>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub strategies_tried: Vec<String>,
    pub degraded: bool,
    pub updated_at: DateTime<Utc>,
}

/// One provider attempt made while retrying a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    pub fingerprint: Fingerprint,
    pub run_id: Option<RunId>,
    pub attempt: u32,
    pub strategy: String,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub model: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Row filter for [`Storage::list_transactions`](super::Storage::list_transactions).
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub tier: Option<Tier>,
    pub status: Option<TransactionStatus>,
    pub run_id: Option<RunId>,
    /// Only rows created at or after this instant
    pub since: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.tier.is_none_or(|t| t == entry.tier)
            && self.status.is_none_or(|s| s == entry.status)
            && self
                .run_id
                .as_ref()
                .is_none_or(|r| entry.run_id.as_ref() == Some(r))
            && self.since.is_none_or(|since| entry.created_at >= since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names_parse_back() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Success,
            TransactionStatus::Failed,
            TransactionStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<TransactionStatus>().unwrap(), status);
        }
        assert_eq!("in_progress".parse::<RunStatus>().unwrap(), RunStatus::InProgress);
        assert!("done".parse::<AssetStatus>().is_err());
    }

    #[test]
    fn test_only_open_runs_are_resumable() {
        assert!(RunStatus::Started.is_resumable());
        assert!(RunStatus::InProgress.is_resumable());
        assert!(!RunStatus::Completed.is_resumable());
        assert!(!RunStatus::Cancelled.is_resumable());
    }
}
