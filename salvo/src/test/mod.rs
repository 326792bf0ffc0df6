//! End-to-end tests of the batch pipeline against a scripted provider.

pub mod utils;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::circuit_breaker::CircuitState;
use crate::provider::{GeneratedArtifact, MockProvider, ProviderError};
use crate::request::{AssetKind, Fingerprint, GenerationRequest, RunId};
use crate::scheduler::BatchScheduler;
use crate::storage::{AssetStatus, RunStatus, SqliteStorage, Storage, TransactionStatus};
use crate::Error;
use utils::{create_test_config, harness, harness_with_provider, image_requests, numbered_requests};

fn fingerprint(prompt: &str) -> Fingerprint {
    Fingerprint::compute(AssetKind::Image, Some("flux-dev"), prompt)
}

/// 5 requests, concurrency 2, checkpoint interval 2; request #3 fails with a
/// 500 twice and succeeds on the delayed retry.
#[test_log::test(tokio::test)]
async fn test_transient_failures_recover_via_delayed_retry() {
    let h = harness(|config| {
        config.scheduler.concurrency = 2;
        config.checkpoint.interval = 2;
    });
    for _ in 0..2 {
        h.provider.add_response(
            "asset 3",
            Err(ProviderError::with_status(500, "internal server error")),
        );
    }

    let run_id = RunId::from("run_transient");
    let report = h
        .scheduler
        .run_batch(numbered_requests(5), None, Some(run_id.clone()))
        .await
        .unwrap();

    assert_eq!(report.generated, 5);
    assert_eq!(report.failed, 0);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.total_cost, Decimal::new(50, 2));

    let transactions = h.transactions().await;
    assert_eq!(transactions.len(), 7);
    let for_third: Vec<_> = transactions
        .iter()
        .filter(|t| t.fingerprint == fingerprint("asset 3"))
        .collect();
    assert_eq!(for_third.len(), 3);
    assert_eq!(
        for_third.iter().filter(|t| t.status == TransactionStatus::Failed).count(),
        2
    );
    assert_eq!(
        for_third.iter().filter(|t| t.status == TransactionStatus::Success).count(),
        1
    );

    let history = h
        .storage
        .list_retry_history(&fingerprint("asset 3"))
        .await
        .unwrap();
    let strategies: Vec<_> = history.iter().map(|h| h.strategy.as_str()).collect();
    assert_eq!(strategies, vec!["initial", "immediate_retry", "delayed_retry"]);
    assert_eq!(history[0].error_class.as_deref(), Some("transient_5xx"));
    assert!(history[2].error_class.is_none());

    let run = h.storage.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_count, 5);
    assert_eq!(run.failed_count, 0);
    assert_eq!(run.completed_indices, (0..5).collect::<BTreeSet<_>>());

    let assets = h.storage.list_assets(&run_id).await.unwrap();
    assert_eq!(assets.len(), 5);
    assert_eq!(assets[3].retry_count, 2);
    assert_eq!(assets[3].strategies_tried, vec!["immediate_retry", "delayed_retry"]);
    for asset in &assets {
        let path = asset.file_path.as_ref().unwrap();
        assert!(tokio::fs::try_exists(path).await.unwrap());
    }
}

#[test_log::test(tokio::test)]
async fn test_duplicates_and_cache_hits_never_pay_twice() {
    let h = harness(|_| {});
    let requests = image_requests(&["a red fox", "A  red FOX ", "a red fox"]);

    let first = h
        .scheduler
        .run_batch(requests.clone(), None, Some(RunId::from("run_first")))
        .await
        .unwrap();
    assert_eq!(first.generated, 1);
    assert_eq!(first.cached, 2);
    assert_eq!(first.duplicates, 2);
    assert_eq!(h.provider.call_count(), 1);

    let assets = h.storage.list_assets(&RunId::from("run_first")).await.unwrap();
    assert_eq!(assets.len(), 3);
    assert!(assets.iter().all(|a| a.file_path == assets[0].file_path));

    let second = h
        .scheduler
        .run_batch(requests, None, Some(RunId::from("run_second")))
        .await
        .unwrap();
    assert_eq!(second.cached, 3);
    assert_eq!(second.generated, 0);
    assert_eq!(second.total_cost, Decimal::ZERO);
    assert_eq!(h.provider.call_count(), 1);
    assert_eq!(h.transactions().await.len(), 1);
    assert!(h.scheduler.cache().stats().hits >= 1);
}

#[test_log::test(tokio::test)]
async fn test_open_circuit_stops_calls() {
    let h = harness(|config| {
        config.scheduler.concurrency = 1;
        config.circuit_breaker.failure_threshold = 2;
    });
    for i in 0..4 {
        h.provider.add_response(
            &format!("asset {i}"),
            Err(ProviderError::with_status(503, "service unavailable")),
        );
    }

    let report = h
        .scheduler
        .run_batch(numbered_requests(4), None, None)
        .await
        .unwrap();

    assert_eq!(report.failed, 4);
    assert_eq!(h.provider.call_count(), 2);
    assert_eq!(h.transactions().await.len(), 2);

    let snapshot = h.scheduler.breakers().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].key, "flux-dev");
    assert_eq!(snapshot[0].state, CircuitState::Open);

    let failures = report.sorted_failures();
    assert_eq!(failures[2].error_class, "provider_unavailable");
    assert!(failures[2].message.contains("circuit open"));
}

#[test_log::test(tokio::test)]
async fn test_alternate_model_result_is_degraded_and_uncached() {
    let h = harness(|config| {
        config
            .model_fallbacks
            .insert("flux-pro".to_string(), vec!["flux-dev".to_string()]);
    });
    h.provider.add_response(
        "a castle at dusk",
        Err(ProviderError::with_status(503, "model overloaded")),
    );
    let request = GenerationRequest::new("a castle at dusk", AssetKind::Image).with_model("flux-pro");
    let run_id = RunId::from("run_degraded");

    let report = h
        .scheduler
        .run_batch(vec![request.clone()], None, Some(run_id.clone()))
        .await
        .unwrap();

    assert_eq!(report.degraded, 1);
    assert_eq!(report.generated, 0);
    assert_eq!(report.exit_code(), 0);

    let assets = h.storage.list_assets(&run_id).await.unwrap();
    assert_eq!(assets[0].status, AssetStatus::Degraded);
    assert_eq!(assets[0].model.as_deref(), Some("flux-dev"));
    assert_eq!(assets[0].strategies_tried, vec!["alternate_model:flux-dev"]);
    assert!(assets[0].degraded);

    assert!(h
        .scheduler
        .cache()
        .lookup(&request.fingerprint())
        .await
        .unwrap()
        .is_none());

    let models: Vec<_> = h.provider.get_calls().into_iter().map(|c| c.model).collect();
    assert_eq!(
        models,
        vec![Some("flux-pro".to_string()), Some("flux-dev".to_string())]
    );
}

#[test_log::test(tokio::test)]
async fn test_generic_fallback_copies_placeholder_without_paying() {
    let assets_dir = tempfile::tempdir().unwrap();
    let placeholder = assets_dir.path().join("icon.png");
    tokio::fs::write(&placeholder, b"PLACEHOLDER").await.unwrap();

    let h = harness(|config| {
        config
            .fallback_artifacts
            .insert(AssetKind::Icon, placeholder.clone());
    });
    h.provider
        .add_response("gear", Err(ProviderError::with_status(451, "blocked")));
    let run_id = RunId::from("run_fallback");

    let report = h
        .scheduler
        .run_batch(
            vec![GenerationRequest::new("gear", AssetKind::Icon)],
            None,
            Some(run_id.clone()),
        )
        .await
        .unwrap();

    assert_eq!(report.degraded, 1);
    assert_eq!(report.total_cost, Decimal::ZERO);

    let transactions = h.transactions().await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Failed);
    assert_eq!(transactions[0].amount, Decimal::ZERO);

    let assets = h.storage.list_assets(&run_id).await.unwrap();
    let path = assets[0].file_path.as_ref().unwrap();
    assert_eq!(tokio::fs::read(path).await.unwrap(), b"PLACEHOLDER");
    assert_eq!(
        assets[0].strategies_tried,
        vec!["generic_fallback".to_string()]
    );
}

#[test_log::test(tokio::test)]
async fn test_concurrency_limit_is_respected() {
    let provider = MockProvider::new().with_latency(Duration::from_millis(50));
    let h = harness_with_provider(provider, |config| config.scheduler.concurrency = 2);

    let report = h
        .scheduler
        .run_batch(numbered_requests(6), None, None)
        .await
        .unwrap();

    assert_eq!(report.generated, 6);
    assert_eq!(h.provider.max_in_flight(), 2);
    assert_eq!(h.scheduler.requests_in_flight(), 0);
}

#[test_log::test(tokio::test)]
async fn test_completed_run_cannot_be_rerun() {
    let h = harness(|_| {});
    let run_id = RunId::from("run_done");
    h.scheduler
        .run_batch(numbered_requests(2), None, Some(run_id.clone()))
        .await
        .unwrap();

    let err = h
        .scheduler
        .run_batch(numbered_requests(2), None, Some(run_id))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[test_log::test(tokio::test)]
async fn test_sqlite_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = create_test_config(&dir);
    let db_path = dir.path().join("salvo.db");
    let provider = MockProvider::new();
    provider.add_response(
        "asset 1",
        Err(ProviderError::new("request timed out after 5s")),
    );

    let storage = Arc::new(SqliteStorage::open(&db_path).await.unwrap());
    let scheduler = Arc::new(BatchScheduler::new(
        storage.clone(),
        Arc::new(provider.clone()),
        &config,
    ));
    let report = scheduler
        .run_batch(numbered_requests(3), None, Some(RunId::from("run_a")))
        .await
        .unwrap();
    assert_eq!(report.generated, 3);
    assert_eq!(provider.call_count(), 4);
    drop(scheduler);
    storage.pool().close().await;

    let reopened = Arc::new(SqliteStorage::open(&db_path).await.unwrap());
    let scheduler = Arc::new(BatchScheduler::new(
        reopened.clone(),
        Arc::new(provider.clone()),
        &config,
    ));
    let report = scheduler
        .run_batch(numbered_requests(3), None, Some(RunId::from("run_b")))
        .await
        .unwrap();

    assert_eq!(report.cached, 3);
    assert_eq!(provider.call_count(), 4);

    let run = reopened.get_run(&RunId::from("run_a")).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.completed_count, 3);
}

#[test_log::test(tokio::test)]
async fn test_undelivered_artifact_keeps_charge_and_is_retried() {
    let h = harness(|_| {});
    h.provider.add_response(
        "asset 0",
        Ok(GeneratedArtifact::url("file:///nonexistent/salvo/missing.png")),
    );
    let run_id = RunId::from("run_undelivered");

    let report = h
        .scheduler
        .run_batch(numbered_requests(1), None, Some(run_id.clone()))
        .await
        .unwrap();

    assert_eq!(report.generated, 1);
    assert_eq!(h.provider.call_count(), 2);
    assert_eq!(report.total_cost, Decimal::new(20, 2));

    let transactions = h.transactions().await;
    assert_eq!(transactions.len(), 2);
    let failed: Vec<_> = transactions
        .iter()
        .filter(|t| t.status == TransactionStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].amount, Decimal::new(10, 2));
    assert_eq!(
        transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Success)
            .count(),
        1
    );

    let history = h
        .storage
        .list_retry_history(&fingerprint("asset 0"))
        .await
        .unwrap();
    assert_eq!(history[0].error_class.as_deref(), Some("unclassified"));
    assert_eq!(history[1].strategy, "immediate_retry");
}

#[test_log::test(tokio::test)]
async fn test_write_failure_leaves_no_success_row() {
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let output_dir = blocker.path().to_path_buf();
    let h = harness(|config| config.output_dir = output_dir.clone());
    let run_id = RunId::from("run_unwritable");

    let report = h
        .scheduler
        .run_batch(numbered_requests(1), None, Some(run_id.clone()))
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.generated, 0);
    assert_eq!(report.failures[0].attempts, 1);
    assert_eq!(h.provider.call_count(), 1);

    // The provider was paid, so the row is failed but keeps its amount
    let transactions = h.transactions().await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Failed);
    assert_eq!(transactions[0].amount, Decimal::new(10, 2));
    assert_eq!(h.scheduler.ledger().spent(None).await.unwrap(), Decimal::new(10, 2));

    let assets = h.storage.list_assets(&run_id).await.unwrap();
    assert_eq!(assets[0].status, AssetStatus::Failed);
    assert!(assets[0].file_path.is_none());
    assert!(h
        .scheduler
        .cache()
        .lookup(&fingerprint("asset 0"))
        .await
        .unwrap()
        .is_none());
}

#[test_log::test(tokio::test)]
async fn test_panicking_request_is_recorded_as_failed() {
    let h = harness(|_| {});
    h.provider.panic_on("asset 1");
    let run_id = RunId::from("run_panic");

    let report = h
        .scheduler
        .run_batch(numbered_requests(3), None, Some(run_id.clone()))
        .await
        .unwrap();

    assert_eq!(report.generated, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].index, 1);
    assert_eq!(report.failures[0].error_class, "task_failed");
    assert_eq!(h.scheduler.requests_in_flight(), 0);

    let run = h.storage.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.failed_indices, BTreeSet::from([1]));

    let assets = h.storage.list_assets(&run_id).await.unwrap();
    assert_eq!(assets.len(), 3);
    assert_eq!(assets[1].status, AssetStatus::Failed);

    // The call it was making never closed; the next batch reconciles it
    let pending = h
        .transactions()
        .await
        .into_iter()
        .filter(|t| t.status == TransactionStatus::Pending)
        .count();
    assert_eq!(pending, 1);
}
