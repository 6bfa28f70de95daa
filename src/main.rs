//! rkcam: camera pipeline host running against the simulated media server

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use rkcam::capability::{Codec, Geometry, SimulatedCapability};
use rkcam::params::{load_ini, save_ini, MemoryParams};
use rkcam::pipeline::{Command, OrchestratorService, PipelineOrchestrator};
use rkcam::playback::{MemoryClip, MemoryOpener, PlaybackSession, PlayerEvent};
use rkcam::pump::{FileSink, StreamKind};
use rkcam::{Config, CONFIG};

#[derive(Debug, Parser)]
#[command(name = "rkcam", version, about = "IP camera media pipeline")]
struct Args {
    /// Device parameter file (INI); written back on exit
    #[arg(long)]
    params: Option<PathBuf>,

    /// Runtime tuning (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory receiving recorded streams and photos
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// Play a synthetic clip registered under this path
    #[arg(long)]
    play: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rkcam={}", args.log_level)));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("rkcam starting");

    let config = Config::load(args.config.as_deref())?;
    CONFIG.store(Arc::new(config.clone()));

    let params = match &args.params {
        Some(path) => Arc::new(load_ini(path)?),
        None => {
            warn!("No parameter file given, running on defaults");
            Arc::new(MemoryParams::new())
        }
    };

    let caps = SimulatedCapability::new().into_shared();
    let mut orchestrator = PipelineOrchestrator::new(caps.clone(), params.clone());
    if let Some(dir) = &args.record_dir {
        let sink = Arc::new(FileSink::new(dir)?);
        orchestrator.add_sink(StreamKind::Main, sink.clone());
        orchestrator.add_sink(StreamKind::Photo, sink);
        info!("Recording into {}", dir.display());
    }

    let service = OrchestratorService::spawn(orchestrator)?;
    let client = service.client();
    client.call_async(Command::Init).await?;

    let mut player = match &args.play {
        Some(path) => {
            let opener = MemoryOpener::new();
            opener.register(
                path.clone(),
                MemoryClip::new()
                    .with_video(Codec::H264, Geometry::new(1280, 720), 30, 10_000)
                    .with_audio(Codec::Aac, 48_000, 2, 20, 10_000),
            );
            let mut session = PlaybackSession::create(caps.clone(), Arc::new(opener), &config.playback);
            session.set_file(path)?;
            session.play()?;
            Some(session)
        }
        None => None,
    };
    let player_events = player.as_ref().map(PlaybackSession::events);

    let mut status_tick = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = status_tick.tick() => {
                let client = client.clone();
                match tokio::task::spawn_blocking(move || client.status()).await? {
                    Ok(report) => info!(
                        "state {:?}, recording {} ({} units)",
                        report.state, report.record.active, report.record.units
                    ),
                    Err(e) => error!("Status query failed: {}", e),
                }
            }
            Some(event) = async {
                match &player_events {
                    Some(rx) => rx.recv_async().await.ok(),
                    None => std::future::pending().await,
                }
            } => {
                info!("Player: {:?}", event);
                if event == PlayerEvent::Eof {
                    if let Some(session) = player.as_mut() {
                        session.play()?;
                    }
                }
            }
        }
    }

    if let Some(mut session) = player.take() {
        if let Err(e) = session.destroy() {
            error!("Playback teardown failed: {}", e);
        }
    }
    service.shutdown()?;

    if let Some(path) = &args.params {
        save_ini(&params, path)?;
        info!("Parameters saved to {}", path.display());
    }

    Ok(())
}
