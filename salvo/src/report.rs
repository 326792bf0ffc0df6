//! Per-run outcome summary.

use std::path::PathBuf;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::request::{Fingerprint, RunId};

/// Process exit code for an interrupted run (128 + SIGINT).
pub const EXIT_INTERRUPTED: i32 = 130;

/// How one request ended. The four kinds are disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Served from the content cache, or a duplicate of a request that succeeded
    Cached,
    Generated,
    /// Generated via a changed prompt or model, or a placeholder artifact
    Degraded,
    Failed,
}

impl OutcomeKind {
    pub fn is_success(&self) -> bool {
        !matches!(self, OutcomeKind::Failed)
    }
}

/// A request that ended in failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub index: usize,
    pub fingerprint: Fingerprint,
    pub error_class: String,
    pub message: String,
    pub attempts: u32,
    pub strategies_tried: Vec<String>,
}

/// Outcome of one request, as seen by the report.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub index: usize,
    pub fingerprint: Fingerprint,
    pub kind: OutcomeKind,
    pub cost: Decimal,
    pub file_path: Option<PathBuf>,
    pub failure: Option<FailureReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub run_id: RunId,
    /// Requests in the input file
    pub total: usize,
    pub cached: usize,
    pub generated: usize,
    pub degraded: usize,
    pub failed: usize,
    /// Already completed by an earlier attempt at this run
    pub skipped: usize,
    /// Requests folded into an earlier request with the same fingerprint
    pub duplicates: usize,
    pub total_cost: Decimal,
    pub failures: Vec<FailureReport>,
    /// Stopped by cancellation before every request was dispatched
    pub interrupted: bool,
}

impl BatchReport {
    pub fn new(run_id: RunId, total: usize) -> Self {
        Self {
            run_id,
            total,
            cached: 0,
            generated: 0,
            degraded: 0,
            failed: 0,
            skipped: 0,
            duplicates: 0,
            total_cost: Decimal::ZERO,
            failures: Vec::new(),
            interrupted: false,
        }
    }

    pub fn record(&mut self, outcome: &RequestOutcome) {
        match outcome.kind {
            OutcomeKind::Cached => self.cached += 1,
            OutcomeKind::Generated => self.generated += 1,
            OutcomeKind::Degraded => self.degraded += 1,
            OutcomeKind::Failed => self.failed += 1,
        }
        self.total_cost += outcome.cost;
        if let Some(failure) = &outcome.failure {
            self.failures.push(failure.clone());
        }
    }

    /// Requests with an outcome in this invocation, skipped ones excluded.
    pub fn processed(&self) -> usize {
        self.cached + self.generated + self.degraded + self.failed
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }

    /// 0 on full success, 130 if interrupted, 1 if anything failed.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }

    /// Failures sorted by sequence index.
    pub fn sorted_failures(&self) -> Vec<&FailureReport> {
        let mut failures: Vec<_> = self.failures.iter().collect();
        failures.sort_by_key(|f| f.index);
        failures
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        writeln!(
            f,
            "  {} requests: {} generated, {} cached, {} degraded, {} failed, {} skipped",
            self.total, self.generated, self.cached, self.degraded, self.failed, self.skipped
        )?;
        writeln!(f, "  total cost: {}", self.total_cost)?;
        if self.interrupted {
            writeln!(f, "  interrupted; resume with --run-id {}", self.run_id)?;
        }
        for failure in self.sorted_failures() {
            writeln!(
                f,
                "  #{} {} [{}] after {} attempts ({}): {}",
                failure.index,
                failure.fingerprint,
                failure.error_class,
                failure.attempts,
                if failure.strategies_tried.is_empty() {
                    "no strategies".to_string()
                } else {
                    failure.strategies_tried.join(", ")
                },
                failure.message
            )?;
        }
        Ok(())
    }
}
