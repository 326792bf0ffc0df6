//! Batch orchestration.
//!
//! [`BatchScheduler::run_batch`] takes a list of requests through the content
//! cache, the budget ledger, the per-model circuit breakers and the rate
//! limiter, and the retry strategist, with at most `concurrency` requests in
//! flight. Per-request failures are recorded and the batch carries on; only a
//! persistence failure or cancellation stops it early.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::artifacts::ArtifactWriter;
use crate::cache::ContentCache;
use crate::checkpoint::{CheckpointStore, RecordStatus};
use crate::circuit_breaker::CircuitBreakers;
use crate::config::{Config, CostsConfig};
use crate::error::{Error, Result};
use crate::ledger::{BudgetLedger, TransactionOutcome};
use crate::provider::{ArtifactContent, GeneratedArtifact, Provider, ProviderError};
use crate::rate_limit::RateLimiter;
use crate::report::{BatchReport, FailureReport, OutcomeKind, RequestOutcome};
use crate::request::{index_requests, Fingerprint, GenerationRequest, RunId, TransactionId};
use crate::retry::{classify, AttemptError, AttemptOutput, AttemptRecord, RetryOutcome, RetryStrategist};
use crate::storage::{AssetRecord, AssetStatus, RetryHistoryEntry, Storage};

pub struct BatchScheduler<S, P>
where
    S: Storage,
    P: Provider,
{
    storage: Arc<S>,
    provider: Arc<P>,
    cache: ContentCache<S>,
    ledger: BudgetLedger<S>,
    checkpoints: CheckpointStore<S>,
    breakers: CircuitBreakers,
    rate_limiter: Option<RateLimiter>,
    strategist: RetryStrategist,
    writer: ArtifactWriter,
    costs: CostsConfig,
    default_model: Option<String>,
    concurrency: usize,
    request_timeout: Duration,
    shutdown: CancellationToken,
    requests_in_flight: Arc<AtomicUsize>,
}

impl<S, P> BatchScheduler<S, P>
where
    S: Storage + 'static,
    P: Provider + 'static,
{
    pub fn new(storage: Arc<S>, provider: Arc<P>, config: &Config) -> Self {
        Self {
            cache: ContentCache::new(storage.clone(), &config.cache),
            ledger: BudgetLedger::new(storage.clone(), &config.budget),
            checkpoints: CheckpointStore::new(storage.clone(), &config.checkpoint),
            breakers: CircuitBreakers::new(&config.circuit_breaker),
            rate_limiter: RateLimiter::new(config.scheduler.rate_limit.as_ref()),
            strategist: RetryStrategist::from_config(config),
            writer: ArtifactWriter::new(&config.output_dir, config.scheduler.request_timeout),
            costs: config.costs.clone(),
            default_model: config.provider.default_model.clone(),
            concurrency: config.scheduler.concurrency.max(1),
            request_timeout: config.scheduler.request_timeout,
            shutdown: CancellationToken::new(),
            requests_in_flight: Arc::new(AtomicUsize::new(0)),
            storage,
            provider,
        }
    }

    /// Stop dispatching when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn cache(&self) -> &ContentCache<S> {
        &self.cache
    }

    pub fn ledger(&self) -> &BudgetLedger<S> {
        &self.ledger
    }

    pub fn checkpoints(&self) -> &CheckpointStore<S> {
        &self.checkpoints
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn requests_in_flight(&self) -> usize {
        self.requests_in_flight.load(Ordering::Relaxed)
    }

    /// Run a batch to completion, or until cancelled.
    ///
    /// With `run_id` naming an unfinished run, indices that run already
    /// completed are skipped. `concurrency` overrides the configured limit.
    ///
    /// # Errors
    /// - `InvalidRequest` if `run_id` names a completed or cancelled run
    /// - persistence failures, which abort the batch
    #[tracing::instrument(skip_all, fields(run_id = tracing::field::Empty, total = requests.len()))]
    pub async fn run_batch(
        self: &Arc<Self>,
        requests: Vec<GenerationRequest>,
        concurrency: Option<usize>,
        run_id: Option<RunId>,
    ) -> Result<BatchReport> {
        let requests: Vec<GenerationRequest> = index_requests(requests)
            .into_iter()
            .map(|request| self.resolve_model(request))
            .collect();
        let concurrency = concurrency.unwrap_or(self.concurrency).max(1);

        self.ledger.reconcile_pending().await?;

        let run_id = run_id.unwrap_or_else(RunId::generate);
        tracing::Span::current().record("run_id", tracing::field::display(&run_id));
        let completed = self.open_run(&run_id, requests.len()).await?;

        let mut report = BatchReport::new(run_id.clone(), requests.len());
        let mut outcomes: HashMap<Fingerprint, RequestOutcome> = HashMap::new();
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        let mut by_model: BTreeMap<Option<String>, Vec<GenerationRequest>> = BTreeMap::new();

        for request in requests {
            if completed.contains(&request.sequence_index) {
                report.skipped += 1;
                continue;
            }

            let fingerprint = request.fingerprint();
            if !seen.insert(fingerprint.clone()) {
                report.duplicates += 1;
                duplicates.push(request);
                continue;
            }

            if let Some(path) = self.cache.lookup(&fingerprint).await? {
                let outcome = self.settle_cached(&run_id, &request, &fingerprint, path).await?;
                report.record(&outcome);
                outcomes.insert(fingerprint, outcome);
                continue;
            }

            by_model.entry(request.model.clone()).or_default().push(request);
        }

        let queue: Vec<GenerationRequest> = by_model.into_values().flatten().collect();
        let queued = queue.len();
        tracing::info!(
            skipped = report.skipped,
            duplicates = report.duplicates,
            cache_hits = report.cached,
            to_generate = queued,
            concurrency,
            "Dispatching batch"
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set: JoinSet<Result<RequestOutcome>> = JoinSet::new();
        let mut abort: Option<Error> = None;
        let mut dispatched = 0usize;
        let mut missing = 0usize;

        for request in queue {
            while let Some(joined) = join_set.try_join_next() {
                collect(joined, &mut report, &mut outcomes, &mut abort, &mut missing);
            }
            if abort.is_some() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit.map_err(anyhow::Error::from)?,
            };

            let scheduler = Arc::clone(self);
            let run_id = run_id.clone();
            let requests_in_flight = self.requests_in_flight.clone();
            requests_in_flight.fetch_add(1, Ordering::Relaxed);
            dispatched += 1;

            join_set.spawn(async move {
                // Permit is held for the duration of this task
                let _permit = permit;
                let _guard = scopeguard::guard((), |_| {
                    requests_in_flight.fetch_sub(1, Ordering::Relaxed);
                });

                // A panic inside `process` still leaves this task to record
                // an outcome for the request
                let lost = request.clone();
                let worker = Arc::clone(&scheduler);
                let worker_run_id = run_id.clone();
                let handle = tokio::spawn(async move { worker.process(&worker_run_id, request).await });
                match handle.await {
                    Ok(result) => result,
                    Err(join_error) => scheduler.settle_lost(&run_id, &lost, join_error).await,
                }
            });
        }

        // In-flight requests always run to completion, even when cancelled.
        while let Some(joined) = join_set.join_next().await {
            collect(joined, &mut report, &mut outcomes, &mut abort, &mut missing);
        }

        if abort.is_none() {
            for request in duplicates {
                let fingerprint = request.fingerprint();
                let Some(primary) = outcomes.get(&fingerprint) else {
                    continue;
                };
                match self.settle_duplicate(&run_id, &request, primary).await {
                    Ok(outcome) => report.record(&outcome),
                    Err(error) => {
                        abort = Some(error);
                        break;
                    }
                }
            }
        }

        if let Some(error) = abort {
            tracing::error!(error = %error, "Persistence failure, aborting batch");
            if let Err(flush_error) = self.checkpoints.flush(&run_id).await {
                tracing::error!(error = %flush_error, "Failed to flush checkpoint after abort");
            }
            return Err(error);
        }

        // Tasks that died without an outcome count as failures, and keep the
        // run resumable so their indices are retried
        report.failed += missing;

        if dispatched < queued {
            report.interrupted = true;
            self.checkpoints.flush(&run_id).await?;
            tracing::warn!(
                processed = report.processed(),
                remaining = queued - dispatched,
                "Batch interrupted, run left resumable"
            );
        } else if missing > 0 {
            self.checkpoints.flush(&run_id).await?;
            tracing::error!(missing, "Requests finished without an outcome, run left resumable");
        } else {
            self.checkpoints.complete(&run_id).await?;
        }

        tracing::info!(
            generated = report.generated,
            cached = report.cached,
            degraded = report.degraded,
            failed = report.failed,
            total_cost = %report.total_cost,
            "Batch finished"
        );
        Ok(report)
    }

    fn resolve_model(&self, mut request: GenerationRequest) -> GenerationRequest {
        if request.model.is_none() {
            request.model = self.default_model.clone();
        }
        request
    }

    /// Start a new run or resume an unfinished one. Returns the indices
    /// already completed.
    async fn open_run(&self, run_id: &RunId, total: usize) -> Result<BTreeSet<usize>> {
        match self.checkpoints.status(run_id).await? {
            None => {
                self.checkpoints.start_run(run_id, total).await?;
                Ok(BTreeSet::new())
            }
            Some(run) if run.status.is_resumable() => {
                let point = self.checkpoints.resume(run_id).await?;
                if point.run.total_assets != total {
                    tracing::warn!(
                        recorded = point.run.total_assets,
                        supplied = total,
                        "Resumed run has a different number of requests"
                    );
                }
                Ok(point.run.completed_indices)
            }
            Some(run) => Err(Error::InvalidRequest(format!(
                "run {run_id} is {} and cannot be resumed",
                run.status
            ))),
        }
    }

    /// Take one uncached request through the retry strategist and record
    /// its outcome. Only persistence failures are returned as errors.
    #[tracing::instrument(
        skip_all,
        fields(index = request.sequence_index, model = ?request.model, fingerprint = %request.fingerprint())
    )]
    async fn process(&self, run_id: &RunId, request: GenerationRequest) -> Result<RequestOutcome> {
        let fingerprint = request.fingerprint();
        let charges = Mutex::new(Charges::default());
        let charges_ref = &charges;

        tracing::debug!("Processing request");
        let result = self
            .strategist
            .execute(&request, |attempt, number| {
                self.attempt(attempt, number, run_id, charges_ref)
            })
            .await;
        let Charges {
            spent: mut cost,
            unsettled,
        } = charges.into_inner();

        match result {
            Ok(outcome) => {
                self.save_history(run_id, &fingerprint, &outcome.history).await?;

                let (written, reported_cost) = match &outcome.output {
                    AttemptOutput::Generated(artifact) => (
                        self.writer.write(&fingerprint, &request, artifact).await,
                        artifact.cost,
                    ),
                    AttemptOutput::Fallback(source) => (
                        self.writer.copy_fallback(&fingerprint, &request, source).await,
                        None,
                    ),
                };
                let retry_count = outcome.attempts.saturating_sub(1);

                match written {
                    Ok(path) => {
                        // A degraded artifact doesn't answer the original request
                        if !outcome.degraded {
                            self.cache.store(&fingerprint, &path).await?;
                        }
                        if let Some(id) = unsettled {
                            let entry = self
                                .ledger
                                .close_transaction(id, TransactionOutcome::Success, reported_cost, retry_count)
                                .await?;
                            cost += entry.amount;
                        }
                        self.settle_success(run_id, &request, &fingerprint, &outcome, path, cost)
                            .await
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "Failed to write artifact");
                        // Paid for but not delivered; the charge stands
                        if let Some(id) = unsettled {
                            let entry = self
                                .ledger
                                .close_transaction(id, TransactionOutcome::Undelivered, reported_cost, retry_count)
                                .await?;
                            cost += entry.amount;
                        }
                        let failure = FailureReport {
                            index: request.sequence_index,
                            fingerprint: fingerprint.clone(),
                            error_class: error.category().to_string(),
                            message: error.to_string(),
                            attempts: outcome.attempts,
                            strategies_tried: outcome.strategies_tried,
                        };
                        self.settle_failure(run_id, &request, failure, cost).await
                    }
                }
            }
            Err(failure) => {
                if failure.error.is_persistence_failure() {
                    return Err(failure.error);
                }
                self.save_history(run_id, &fingerprint, &failure.history).await?;

                let report = FailureReport {
                    index: request.sequence_index,
                    fingerprint: fingerprint.clone(),
                    error_class: failure.error_class().to_string(),
                    message: failure.error.to_string(),
                    attempts: failure.attempts,
                    strategies_tried: failure.strategies_tried,
                };
                self.settle_failure(run_id, &request, report, cost).await
            }
        }
    }

    /// One paid provider call, bracketed by a ledger transaction.
    ///
    /// On success the artifact comes back as bytes and its transaction stays
    /// pending in `charges`, to be closed once the artifact is on disk.
    async fn attempt(
        &self,
        request: GenerationRequest,
        number: u32,
        run_id: &RunId,
        charges: &Mutex<Charges>,
    ) -> std::result::Result<GeneratedArtifact, AttemptError> {
        let key = self.provider_key(&request);
        let breaker = self.breakers.get(&key);
        if !breaker.can_attempt() {
            tracing::debug!(key = %key, "Circuit open, skipping call");
            return Err(AttemptError::CircuitOpen(key));
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let estimate = self.costs.estimate(&request, request.model.as_deref());
        let transaction = match self.ledger.open_transaction(&request, estimate, Some(run_id)).await {
            Ok(id) => id,
            Err(error) => {
                breaker.release_probe();
                return Err(AttemptError::Fatal(error));
            }
        };

        tracing::debug!(attempt = number, transaction_id = %transaction, "Calling provider");
        let result = tokio::time::timeout(
            self.request_timeout,
            self.provider.generate(&request, self.request_timeout),
        )
        .await
        .unwrap_or_else(|_| Err(ProviderError::timeout(self.request_timeout)));

        let retry_count = number.saturating_sub(1);
        match result {
            Ok(artifact) => {
                breaker.on_success();
                match self.writer.fetch(&artifact).await {
                    Ok(bytes) => {
                        charges.lock().unsettled = Some(transaction);
                        Ok(GeneratedArtifact {
                            content: ArtifactContent::Bytes(bytes),
                            cost: artifact.cost,
                        })
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "Artifact download failed");
                        let entry = self
                            .ledger
                            .close_transaction(transaction, TransactionOutcome::Undelivered, artifact.cost, retry_count)
                            .await
                            .map_err(AttemptError::Fatal)?;
                        charges.lock().spent += entry.amount;
                        let message = match error {
                            Error::ProviderTransient(message) => message,
                            other => format!("artifact download failed: {other}"),
                        };
                        Err(AttemptError::Provider(ProviderError::new(message)))
                    }
                }
            }
            Err(error) => {
                if classify(&error).trips_circuit() {
                    breaker.on_failure();
                } else {
                    breaker.on_rejection();
                }
                let entry = self
                    .ledger
                    .close_transaction(transaction, TransactionOutcome::Failed, None, retry_count)
                    .await
                    .map_err(AttemptError::Fatal)?;
                charges.lock().spent += entry.amount;
                Err(AttemptError::Provider(error))
            }
        }
    }

    fn provider_key(&self, request: &GenerationRequest) -> String {
        request
            .model
            .clone()
            .unwrap_or_else(|| self.provider.name().to_string())
    }

    async fn save_history(
        &self,
        run_id: &RunId,
        fingerprint: &Fingerprint,
        history: &[AttemptRecord],
    ) -> Result<()> {
        for record in history {
            let (error_class, error_message) = match &record.failure {
                Some((class, message)) => (Some(class.as_str().to_string()), Some(message.clone())),
                None => (None, None),
            };
            self.storage
                .append_retry_history(&RetryHistoryEntry {
                    fingerprint: fingerprint.clone(),
                    run_id: Some(run_id.clone()),
                    attempt: record.attempt,
                    strategy: record.strategy.clone(),
                    error_class,
                    error_message,
                    model: record.model.clone(),
                    recorded_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    async fn settle_success(
        &self,
        run_id: &RunId,
        request: &GenerationRequest,
        fingerprint: &Fingerprint,
        outcome: &RetryOutcome,
        path: PathBuf,
        cost: Decimal,
    ) -> Result<RequestOutcome> {
        let kind = if outcome.degraded {
            OutcomeKind::Degraded
        } else {
            OutcomeKind::Generated
        };
        let mut asset = asset_record(run_id, request, fingerprint);
        asset.status = if outcome.degraded {
            AssetStatus::Degraded
        } else {
            AssetStatus::Generated
        };
        asset.model = outcome.request.model.clone();
        asset.cost = cost;
        asset.retry_count = outcome.attempts.saturating_sub(1);
        asset.file_path = Some(path.to_string_lossy().into_owned());
        asset.strategies_tried = outcome.strategies_tried.clone();
        asset.degraded = outcome.degraded;
        self.storage.upsert_asset(&asset).await?;

        self.checkpoints
            .record(run_id, request.sequence_index, RecordStatus::Success, cost)
            .await?;

        tracing::info!(
            path = %path.display(),
            cost = %cost,
            attempts = outcome.attempts,
            degraded = outcome.degraded,
            "Request completed"
        );
        Ok(RequestOutcome {
            index: request.sequence_index,
            fingerprint: fingerprint.clone(),
            kind,
            cost,
            file_path: Some(path),
            failure: None,
        })
    }

    async fn settle_failure(
        &self,
        run_id: &RunId,
        request: &GenerationRequest,
        failure: FailureReport,
        cost: Decimal,
    ) -> Result<RequestOutcome> {
        let mut asset = asset_record(run_id, request, &failure.fingerprint);
        asset.status = AssetStatus::Failed;
        asset.cost = cost;
        asset.retry_count = failure.attempts.saturating_sub(1);
        asset.error_class = Some(failure.error_class.clone());
        asset.error_message = Some(failure.message.clone());
        asset.strategies_tried = failure.strategies_tried.clone();
        self.storage.upsert_asset(&asset).await?;

        self.checkpoints
            .record(run_id, request.sequence_index, RecordStatus::Failed, cost)
            .await?;

        tracing::warn!(
            error_class = %failure.error_class,
            attempts = failure.attempts,
            error = %failure.message,
            "Request failed"
        );
        Ok(RequestOutcome {
            index: request.sequence_index,
            fingerprint: failure.fingerprint.clone(),
            kind: OutcomeKind::Failed,
            cost,
            file_path: None,
            failure: Some(failure),
        })
    }

    /// Record a request whose task died before producing an outcome. Its
    /// ledger transaction, if one was open, stays pending until the next
    /// batch reconciles it.
    async fn settle_lost(
        &self,
        run_id: &RunId,
        request: &GenerationRequest,
        error: JoinError,
    ) -> Result<RequestOutcome> {
        tracing::error!(index = request.sequence_index, error = %error, "Request task failed");
        let failure = FailureReport {
            index: request.sequence_index,
            fingerprint: request.fingerprint(),
            error_class: "task_failed".to_string(),
            message: format!("request task failed: {error}"),
            attempts: 0,
            strategies_tried: Vec::new(),
        };
        self.settle_failure(run_id, request, failure, Decimal::ZERO).await
    }

    async fn settle_cached(
        &self,
        run_id: &RunId,
        request: &GenerationRequest,
        fingerprint: &Fingerprint,
        path: PathBuf,
    ) -> Result<RequestOutcome> {
        let mut asset = asset_record(run_id, request, fingerprint);
        asset.status = AssetStatus::Cached;
        asset.file_path = Some(path.to_string_lossy().into_owned());
        self.storage.upsert_asset(&asset).await?;

        self.checkpoints
            .record(run_id, request.sequence_index, RecordStatus::Success, Decimal::ZERO)
            .await?;

        tracing::debug!(index = request.sequence_index, fingerprint = %fingerprint, "Cache hit");
        Ok(RequestOutcome {
            index: request.sequence_index,
            fingerprint: fingerprint.clone(),
            kind: OutcomeKind::Cached,
            cost: Decimal::ZERO,
            file_path: Some(path),
            failure: None,
        })
    }

    /// Give a duplicate request the outcome of the request it was folded into.
    async fn settle_duplicate(
        &self,
        run_id: &RunId,
        request: &GenerationRequest,
        primary: &RequestOutcome,
    ) -> Result<RequestOutcome> {
        match (&primary.file_path, &primary.failure) {
            (Some(path), None) => {
                let degraded = primary.kind == OutcomeKind::Degraded;
                let mut asset = asset_record(run_id, request, &primary.fingerprint);
                asset.status = if degraded {
                    AssetStatus::Degraded
                } else {
                    AssetStatus::Cached
                };
                asset.degraded = degraded;
                asset.file_path = Some(path.to_string_lossy().into_owned());
                self.storage.upsert_asset(&asset).await?;
                self.checkpoints
                    .record(run_id, request.sequence_index, RecordStatus::Success, Decimal::ZERO)
                    .await?;

                Ok(RequestOutcome {
                    index: request.sequence_index,
                    fingerprint: primary.fingerprint.clone(),
                    kind: if degraded {
                        OutcomeKind::Degraded
                    } else {
                        OutcomeKind::Cached
                    },
                    cost: Decimal::ZERO,
                    file_path: Some(path.clone()),
                    failure: None,
                })
            }
            (_, failure) => {
                let failure = FailureReport {
                    index: request.sequence_index,
                    fingerprint: primary.fingerprint.clone(),
                    error_class: failure
                        .as_ref()
                        .map_or_else(|| "unknown".to_string(), |f| f.error_class.clone()),
                    message: failure.as_ref().map_or_else(
                        || format!("duplicate of request #{}", primary.index),
                        |f| format!("duplicate of request #{}: {}", primary.index, f.message),
                    ),
                    attempts: 0,
                    strategies_tried: Vec::new(),
                };
                self.settle_failure(run_id, request, failure, Decimal::ZERO).await
            }
        }
    }
}

fn asset_record(run_id: &RunId, request: &GenerationRequest, fingerprint: &Fingerprint) -> AssetRecord {
    AssetRecord {
        fingerprint: fingerprint.clone(),
        run_id: run_id.clone(),
        sequence_index: request.sequence_index,
        asset_kind: request.asset_kind,
        model: request.model.clone(),
        prompt: request.prompt.clone(),
        status: AssetStatus::Pending,
        cost: Decimal::ZERO,
        retry_count: 0,
        file_path: None,
        error_class: None,
        error_message: None,
        strategies_tried: Vec::new(),
        degraded: false,
        updated_at: Utc::now(),
    }
}

/// Money moved by one request's attempts. `unsettled` is the transaction of
/// the successful call, still pending until its artifact is written.
#[derive(Default)]
struct Charges {
    spent: Decimal,
    unsettled: Option<TransactionId>,
}

fn collect(
    joined: std::result::Result<Result<RequestOutcome>, JoinError>,
    report: &mut BatchReport,
    outcomes: &mut HashMap<Fingerprint, RequestOutcome>,
    abort: &mut Option<Error>,
    missing: &mut usize,
) {
    match joined {
        Ok(Ok(outcome)) => {
            report.record(&outcome);
            outcomes.insert(outcome.fingerprint.clone(), outcome);
        }
        Ok(Err(error)) => {
            tracing::error!(error = %error, "Request task failed");
            abort.get_or_insert(error);
        }
        Err(join_error) => {
            tracing::error!(error = %join_error, "Task panicked");
            *missing += 1;
        }
    }
}
