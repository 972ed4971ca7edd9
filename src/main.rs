//! Argus: camera capture, detection overlay and H.264 streaming.

use std::sync::Arc;

use argus::cli::Args;
use argus::{Pipeline, PipelineConfig, Shutdown};
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing(filter: Option<&str>) {
    let filter = filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("argus=info"));

    #[cfg(feature = "profiling")]
    let tracy = Some(tracing_tracy::TracyLayer::default());
    #[cfg(not(feature = "profiling"))]
    let tracy: Option<tracing_subscriber::layer::Identity> = None;

    tracing_subscriber::registry()
        .with(tracy)
        .with(fmt::layer().with_timer(fmt::time::uptime()).with_filter(filter))
        .init();
}

#[cfg(feature = "v4l2")]
fn print_devices() -> Result<()> {
    let devices = argus::capture::devices::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for dev in devices {
        let preferred = dev.preferred_format().map_or("-".to_string(), |f| format!("{f:?}"));
        println!("{}  {}  {:?} (preferred {})", dev.path, dev.card, dev.formats, preferred);
    }
    Ok(())
}

#[cfg(not(feature = "v4l2"))]
fn print_devices() -> Result<()> {
    Err(color_eyre::eyre::eyre!("device listing needs the v4l2 feature"))
}

/// First SIGINT/SIGTERM drains the pipeline, a second one aborts it.
async fn watch_signals(shutdown: Shutdown) {
    let mut stops = 0;
    loop {
        wait_for_signal().await;
        stops += 1;
        if stops == 1 {
            info!("Shutdown requested, draining");
            shutdown.request_stop();
        } else {
            warn!("Second shutdown request, aborting");
            shutdown.abort();
            return;
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref());

    info!("Argus launching...");

    if args.list_devices {
        return print_devices();
    }

    let mut config = PipelineConfig::load(args.config.as_deref()).wrap_err("loading configuration")?;
    args.apply(&mut config);
    config.validate()?;
    let config = Arc::new(config);
    info!(
        "Streaming {}x{}@{} to {} ({} kbps, keyframe every {} frames, detection every {} frames)",
        config.capture.width,
        config.capture.height,
        config.capture.fps,
        config.sink_address(),
        config.encoder.bitrate_kbps,
        config.encoder.keyframe_interval,
        config.detection.interval,
    );

    let pipeline = Pipeline::new(Arc::clone(&config)).wrap_err("pipeline setup failed")?;
    let shutdown = Shutdown::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    pipeline.run(shutdown).await.wrap_err("pipeline stopped")?;

    info!("Argus shutting down");
    Ok(())
}
