use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tempfile::TempDir;

use crate::config::Config;
use crate::provider::MockProvider;
use crate::request::{AssetKind, GenerationRequest};
use crate::scheduler::BatchScheduler;
use crate::storage::{InMemoryStorage, LedgerEntry, Storage, TransactionFilter};

pub type TestScheduler = BatchScheduler<InMemoryStorage, MockProvider>;

/// Scheduler wired to in-memory storage and a scripted provider, writing
/// artifacts into a temp dir.
pub struct Harness {
    pub scheduler: Arc<TestScheduler>,
    pub storage: InMemoryStorage,
    pub provider: MockProvider,
    pub config: Config,
    pub dir: TempDir,
}

impl Harness {
    /// A second scheduler over the same storage and provider, as after a restart.
    pub fn restart(&self) -> Arc<TestScheduler> {
        Arc::new(BatchScheduler::new(
            Arc::new(self.storage.clone()),
            Arc::new(self.provider.clone()),
            &self.config,
        ))
    }

    pub async fn transactions(&self) -> Vec<LedgerEntry> {
        self.storage
            .list_transactions(&TransactionFilter::default())
            .await
            .unwrap()
    }
}

/// Defaults tuned for tests: small backoff, checkpoint every 2 records,
/// $0.10 per call, `flux-dev` as the default model.
pub fn create_test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.output_dir = dir.path().join("artifacts");
    config.provider.default_model = Some("flux-dev".to_string());
    config.costs.default = Decimal::new(10, 2);
    config.scheduler.concurrency = 2;
    config.scheduler.request_timeout = Duration::from_secs(5);
    config.retry.backoff_ms = 50;
    config.retry.max_backoff_ms = 500;
    config.checkpoint.interval = 2;
    config.cache.ttl = None;
    config
}

pub fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
    harness_with_provider(MockProvider::new(), configure)
}

pub fn harness_with_provider(provider: MockProvider, configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = create_test_config(&dir);
    configure(&mut config);

    let storage = InMemoryStorage::new();
    let scheduler = Arc::new(BatchScheduler::new(
        Arc::new(storage.clone()),
        Arc::new(provider.clone()),
        &config,
    ));

    Harness {
        scheduler,
        storage,
        provider,
        config,
        dir,
    }
}

pub fn image_requests(prompts: &[&str]) -> Vec<GenerationRequest> {
    prompts
        .iter()
        .map(|prompt| GenerationRequest::new(*prompt, AssetKind::Image))
        .collect()
}

/// Prompts `"asset 0"`, `"asset 1"`, ...
pub fn numbered_requests(count: usize) -> Vec<GenerationRequest> {
    (0..count)
        .map(|i| GenerationRequest::new(format!("asset {i}"), AssetKind::Image))
        .collect()
}
