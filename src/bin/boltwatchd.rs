//! boltwatchd - headless damaged-bolt inspection daemon
//!
//! This daemon:
//! 1. Loads the pipeline configuration (TOML file + environment overrides)
//! 2. Starts the pipeline worker over the configured sources
//! 3. Consumes pipeline events, logging statistics at a steady cadence
//! 4. Stops the pipeline cleanly on Ctrl-C (or after `--run-for` seconds)

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select, tick};
use std::path::PathBuf;
use std::time::Duration;

use boltwatch::{DefaultEngineFactory, PipelineConfig, PipelineController, PipelineEvent};

#[derive(Parser, Debug)]
#[command(name = "boltwatchd", version, about = "damaged-bolt inspection daemon")]
struct Args {
    /// Configuration file (TOML). Defaults to BOLTWATCH_CONFIG if set.
    #[arg(short, long, env = "BOLTWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Stop automatically after this many seconds.
    #[arg(long)]
    run_for: Option<u64>,

    /// Seconds between statistics log lines.
    #[arg(long, default_value_t = 5)]
    stats_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = PipelineConfig::load(args.config.as_deref())?;
    log::info!(
        "boltwatchd {}: {} sources, model {}",
        env!("CARGO_PKG_VERSION"),
        config.source_count,
        config.model_path
    );

    let (mut controller, events) = PipelineController::new(config, Box::new(DefaultEngineFactory));
    controller.start()?;

    let (shutdown_tx, shutdown) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("install signal handler")?;

    let deadline = args
        .run_for
        .map(|secs| crossbeam_channel::after(Duration::from_secs(secs)))
        .unwrap_or_else(crossbeam_channel::never);
    let stats_tick = tick(Duration::from_secs(args.stats_interval.max(1)));

    let mut latest_stats = None;
    let mut frames_seen = 0u64;

    loop {
        select! {
            recv(events) -> event => match event {
                Ok(PipelineEvent::FrameReady { .. }) => frames_seen += 1,
                Ok(PipelineEvent::Stats(stats)) => latest_stats = Some(stats),
                // Log events are already on the log output; nothing extra here.
                Ok(PipelineEvent::Log(_)) => {}
                Ok(PipelineEvent::Error(msg)) => {
                    log::error!("pipeline error: {}", msg);
                    break;
                }
                Err(_) => break,
            },
            recv(stats_tick) -> _ => {
                if let Some(stats) = &latest_stats {
                    log::info!(
                        "frames={} detections={} damaged={} current={} fps={:.1}",
                        frames_seen,
                        stats.total_detections,
                        stats.damaged_count,
                        stats.current_damaged,
                        stats.fps_estimate
                    );
                }
            },
            recv(shutdown) -> _ => {
                log::info!("shutdown requested");
                break;
            },
            recv(deadline) -> _ => {
                log::info!("run duration elapsed");
                break;
            },
        }
    }

    controller.stop()?;
    if let Some(stats) = latest_stats {
        let json = serde_json::to_string(&stats).context("serialize final statistics")?;
        log::info!("final statistics: {}", json);
    }
    Ok(())
}
