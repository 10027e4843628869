use anyhow::{Context, Result};
use presence_core::{ModelSlot, ScrfdDetector};
use presence_store::{AttendanceLedger, Storage};
use presenced::{spawn_sources, Config, SourceState, SourceTask};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        model = %config.model_path.display(),
        sources = ?config.sources,
        threshold = config.threshold,
        "configuration loaded"
    );

    let storage = Storage::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let ledger = AttendanceLedger::new(storage);

    let slot = Arc::new(
        ModelSlot::open(&config.model_path, config.threshold)
            .context("no usable recognition model; run `presence train` first")?,
    );

    let sources = config
        .require_sources()?
        .iter()
        .map(|locator| SourceTask::from_locator(locator, config.frame_timeout))
        .collect();
    let detector_model = config.detector_model.clone();
    let capture = spawn_sources(
        sources,
        || ScrfdDetector::load(&detector_model),
        Arc::clone(&slot),
        ledger,
    )
    .context("failed to start capture")?;

    tracing::info!("presenced ready");

    let stop = capture.stop_flag();
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let done = tokio::task::spawn_blocking(move || capture.join());
    tokio::pin!(done);

    let reports = loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("stop requested; waiting for sources");
                stop.store(true, Ordering::Relaxed);
            }
            Some(()) = hangup.recv() => {
                if let Err(e) = slot.reload() {
                    tracing::error!(error = %e, "model reload failed; keeping current model");
                }
            }
            joined = &mut done => break joined.context("capture threads did not join")?,
        }
    };

    let stalled = reports
        .iter()
        .filter(|r| r.state == SourceState::Stalled)
        .count();
    for report in &reports {
        tracing::info!(
            source = %report.source,
            state = ?report.state,
            frames = report.frames,
            marked = report.marked,
            error = report.error.as_deref().unwrap_or(""),
            "source report"
        );
    }
    tracing::info!(sources = reports.len(), stalled, "presenced shutting down");

    Ok(())
}
