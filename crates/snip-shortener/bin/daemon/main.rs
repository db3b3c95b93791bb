mod cli;

use crate::cli::{StorageBackendArg, CLI};
use anyhow::Context;
use clap::Parser;
use snip_core::{deadline, CancellationToken, Repository};
use snip_generator::RandomGenerator;
use snip_shortener::{ServiceSettings, ShortenerTask, UrlService};
use snip_storage::{FileBackup, InMemoryRepository, MySqlRepository};
use snip_worker::{EngineSettings, TaskEngine};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CLI::parse();
    init_tracing(config.log_json);

    info!(
        base_url = %config.base_url,
        storage_backend = %config.storage,
        workers = config.workers,
        queue_size = config.queue_size,
        delete_batch_size = config.delete_batch_size,
        "starting snip daemon"
    );

    let shutdown = CancellationToken::new();
    let engine = Arc::new(TaskEngine::<ShortenerTask>::with_parent(
        EngineSettings::builder()
            .workers(config.workers)
            .queue_size(config.queue_size)
            .build(),
        &shutdown,
    ));
    let settings = ServiceSettings::builder()
        .base_url(config.base_url.clone())
        .delete_batch_size(config.delete_batch_size)
        .build();

    match config.storage {
        StorageBackendArg::InMemory => {
            let backup = FileBackup::new(&config.file_storage_path);
            let service = UrlService::new(
                InMemoryRepository::new(),
                RandomGenerator::default(),
                Arc::clone(&engine),
                settings,
            );
            service
                .load_snapshot(&backup, &shutdown)
                .await
                .with_context(|| format!("failed to load {}", backup.path().display()))?;

            run(&service, &shutdown).await?;

            service
                .save_snapshot(&backup, &CancellationToken::new())
                .await
                .with_context(|| format!("failed to save {}", backup.path().display()))?;
        }
        StorageBackendArg::Mysql => {
            let mysql_dsn = config
                .mysql_dsn
                .as_deref()
                .context("mysql dsn is required when storage backend is mysql")?;
            let repository = MySqlRepository::connect(mysql_dsn)
                .await
                .context("failed to connect to mysql")?;
            repository
                .ensure_schema()
                .await
                .context("failed to create schema")?;

            let service = UrlService::new(
                repository,
                RandomGenerator::default(),
                Arc::clone(&engine),
                settings,
            );
            run(&service, &shutdown).await?;
        }
    }

    info!("snip daemon stopped");
    Ok(())
}

/// Serves until ctrl-c, then drains pending deletions. A second ctrl-c
/// cancels `shutdown`, dropping whatever is still queued.
async fn run<R: Repository>(
    service: &UrlService<R, RandomGenerator>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    service
        .ping(&deadline(shutdown, PING_TIMEOUT))
        .await
        .context("storage is not reachable")?;
    info!("ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining pending tasks");

    let hard_stop = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second shutdown signal received, cancelling pending tasks");
                shutdown.cancel();
            }
        }
    });

    service.engine().shutdown().await;
    hard_stop.abort();
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
