use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;

use salvo::config::{Args, Command};
use salvo::{
    load_requests, telemetry, BatchScheduler, BudgetLedger, CheckpointStore, Config, ContentCache,
    HttpProvider, RunId, SqliteStorage,
};

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, finishing in-flight requests...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, finishing in-flight requests...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(ExitCode::SUCCESS);
    }

    telemetry::init_telemetry(config.log_format)?;
    tracing::debug!("{:?}", args);

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(ExitCode::from(2));
    };

    let storage = Arc::new(
        SqliteStorage::connect(&config.database.url, config.database.max_connections)
            .await
            .with_context(|| format!("opening database {}", config.database.url))?,
    );

    match command {
        Command::Run {
            requests,
            run_id,
            concurrency,
        } => {
            let url = config
                .provider
                .url
                .clone()
                .context("provider.url must be set to run a batch")?;
            let provider = Arc::new(HttpProvider::new(url, config.provider.api_key.clone()));

            let requests = load_requests(&requests)
                .await
                .with_context(|| format!("loading {}", requests.display()))?;

            let shutdown = CancellationToken::new();
            let scheduler = Arc::new(
                BatchScheduler::new(storage, provider, &config).with_cancellation(shutdown.clone()),
            );

            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                signal_token.cancel();
            });

            let report = scheduler
                .run_batch(requests, concurrency, run_id.map(RunId::from))
                .await?;
            println!("{report}");

            let code = u8::try_from(report.exit_code()).unwrap_or(1);
            Ok(ExitCode::from(code))
        }
        Command::Status { run_id } => {
            let run_id = RunId::from(run_id);
            let checkpoints = CheckpointStore::new(storage.clone(), &config.checkpoint);
            let run = checkpoints
                .status(&run_id)
                .await?
                .with_context(|| format!("run {run_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Cancel { run_id } => {
            let checkpoints = CheckpointStore::new(storage.clone(), &config.checkpoint);
            let stats = checkpoints.cancel(&RunId::from(run_id)).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep { max_age } => {
            let cache = ContentCache::new(storage.clone(), &config.cache);
            let removed = cache.sweep(max_age).await?;
            println!("Removed {removed} cache entries.");
            Ok(ExitCode::SUCCESS)
        }
        Command::Ledger => {
            let ledger = BudgetLedger::new(storage.clone(), &config.budget);
            let summary = ledger.summary().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
