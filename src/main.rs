mod main_runtime;

use anyhow::Context;
use clap::Parser;
use jobpilot::agent::{AgentRegistry, ProbeAgent, Stepwise};
use jobpilot::api::{create_router, AppState};
use jobpilot::cli::{Cli, Commands};
use jobpilot::config::AppConfig;
use jobpilot::persistence::{MemoryStore, PostgresStore, Store};
use jobpilot::scheduler::{Scheduler, Sweeper};
use main_runtime::{init_logging, init_logging_simple, shutdown_signal};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("failed to load configuration from {}", cli.config_dir))?;

    match cli.command {
        Some(Commands::CheckConfig) => {
            init_logging_simple();
            check_config(&config)
        }
        Some(Commands::Serve { bind, memory }) => {
            init_logging(&config.logging);
            serve(config, bind, memory).await
        }
        None => {
            init_logging(&config.logging);
            serve(config, None, false).await
        }
    }
}

fn check_config(config: &AppConfig) -> anyhow::Result<()> {
    match config.validate() {
        Ok(()) => {
            println!("\x1b[32m✓ Configuration is valid\x1b[0m");
            println!("  Workers per agent kind: {}", config.scheduler.worker_pool_size);
            println!(
                "  Timeouts: soft {}s / hard {}s",
                config.scheduler.soft_timeout_secs, config.scheduler.hard_timeout_secs
            );
            println!(
                "  Retries: {} attempts, backoff {}s..{}s",
                config.scheduler.max_attempts,
                config.scheduler.retry_base_delay_secs,
                config.scheduler.retry_max_delay_secs
            );
            println!(
                "  Brake: {}s window, partial policy {:?}",
                config.brake.ack_window_secs, config.brake.partial_policy
            );
            println!(
                "  Storage: {}",
                if config.database.url.is_some() {
                    "postgres"
                } else {
                    "memory"
                }
            );
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                println!("\x1b[31m✗ {}\x1b[0m", e);
            }
            anyhow::bail!("{} configuration error(s)", errors.len())
        }
    }
}

async fn open_store(config: &AppConfig, memory: bool) -> anyhow::Result<Arc<dyn Store>> {
    match (&config.database.url, memory) {
        (Some(url), false) => {
            let store = PostgresStore::new(url, config.database.max_connections)
                .await
                .context("failed to connect to the database")?;
            store.migrate().await.context("failed to run migrations")?;
            info!("Using postgres store");
            Ok(Arc::new(store))
        }
        _ => {
            warn!("Using in-memory store; state is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn serve(config: AppConfig, bind: Option<String>, memory: bool) -> anyhow::Result<()> {
    if let Err(errors) = config.validate() {
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }

    let store = open_store(&config, memory).await?;
    let registry = AgentRegistry::new().with(Arc::new(Stepwise(ProbeAgent)));

    let scheduler = Scheduler::new(&config, store, registry);
    let dispatchers = scheduler.start().await?;
    info!(
        "Scheduler started with {} dispatcher(s)",
        dispatchers.len()
    );

    let sweeper = Arc::new(Sweeper::new(scheduler.clone()));
    let sweep_handle = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run().await })
    };

    let addr = bind.unwrap_or_else(|| config.api.bind.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("HTTP API listening on {}", addr);

    let app = create_router(AppState::new(scheduler.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutdown signal received");
    sweeper.stop();
    scheduler.shutdown();

    let drain = async {
        for handle in dispatchers {
            let _ = handle.await;
        }
        let _ = sweep_handle.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain)
        .await
        .is_err()
    {
        warn!("Shutdown timed out after 10s, exiting anyway");
    }

    info!("Final stats: {}", scheduler.stats());
    Ok(())
}
