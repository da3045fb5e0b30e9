use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tube_automator::{
    api::{self, AppState},
    config::ConfigStore,
    downloader::{self, Downloader},
    files,
    logging::{self, LogOptions},
    processor::MediaProcessor,
    scheduler::TaskScheduler,
};

const PUBLIC_DIR: &str = "public";

#[tokio::main]
async fn main() -> Result<()> {
    let store = ConfigStore::load_default();
    let settings = store.settings();

    logging::init(&LogOptions {
        directory: settings.logging.directory.clone(),
        level: settings.logging.level.clone(),
        console: true,
    })?;

    files::ensure_directory(&settings.downloads.directory)?;
    files::ensure_directory(&settings.processing.output_directory)?;

    let downloader = Arc::new(Downloader::from_settings(&settings.downloads));
    let processor = Arc::new(MediaProcessor::from_settings(&settings.processing));

    for (program, flag) in [
        (downloader.program(), "--version"),
        (processor.ffmpeg(), "-version"),
    ] {
        if !downloader::program_available(program, flag).await {
            warn!(
                program = %program.display(),
                "external tool not found; related endpoints will fail"
            );
        }
    }

    let scheduler = Arc::new(
        TaskScheduler::new(downloader.clone(), settings.scheduler.max_concurrent_tasks)
            .await
            .context("starting task scheduler")?,
    );
    if let Err(err) = scheduler
        .schedule_cleanup(
            &settings.scheduler.cleanup_schedule,
            settings.downloads.directory.clone(),
            settings.scheduler.retention_days,
        )
        .await
    {
        error!(
            schedule = %settings.scheduler.cleanup_schedule,
            "cleanup job not registered: {err}"
        );
    }

    let state = AppState {
        downloader,
        processor,
        scheduler: scheduler.clone(),
        default_quality: settings.downloads.default_quality.clone(),
        public_dir: PathBuf::from(PUBLIC_DIR),
    };
    let app = api::router(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    if let Err(err) = scheduler.shutdown().await {
        warn!("scheduler did not shut down cleanly: {err}");
    }
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {err}");
    }
}
