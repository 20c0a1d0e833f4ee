//! CLI entry point for media-relay
//!
//! Loads configuration, starts the pipeline, and shuts it down on Ctrl-C or
//! SIGTERM.

use clap::Parser;
use media_relay::{Config, Pipeline, PipelineError, PipelineSettings};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// media-relay - torrent intake and media library filing
#[derive(Parser, Debug)]
#[command(name = "media-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root of the intake tree to watch
    #[arg(long)]
    root: Option<PathBuf>,

    /// Drop-off directory watched by the torrent client
    #[arg(long)]
    drop: Option<PathBuf>,

    /// Directory the torrent client moves completed downloads into
    #[arg(long)]
    complete: Option<PathBuf>,

    /// Root of the media library
    #[arg(long)]
    media: Option<PathBuf>,

    /// Move request files already present in the intake tree at startup
    #[arg(long, default_value = "false")]
    sweep_existing: bool,
}

fn load_config(args: &Args) -> Result<Config, PipelineError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // command line beats file and environment
    if let Some(root) = &args.root {
        config.paths.intake_root = Some(root.clone());
    }
    if let Some(drop) = &args.drop {
        config.paths.drop_off = Some(drop.clone());
    }
    if let Some(complete) = &args.complete {
        config.paths.completed = Some(complete.clone());
    }
    if let Some(media) = &args.media {
        config.paths.media_root = Some(media.clone());
    }
    if args.sweep_existing {
        config.intake.sweep_on_startup = true;
    }

    Ok(config)
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "unable to listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let pipeline = match load_config(&args)
        .and_then(|config| PipelineSettings::from_config(&config).map_err(PipelineError::from))
        .and_then(Pipeline::start_with_notify)
    {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "failed to start pipeline");
            return ExitCode::FAILURE;
        }
    };

    info!("media-relay running; press Ctrl-C to stop");
    wait_for_shutdown().await;

    let stats = pipeline.shutdown().await;
    info!(stats = %stats.to_json(), "final pipeline stats");

    ExitCode::SUCCESS
}
