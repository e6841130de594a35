// Example: Record a synthetic screen and tone through the lifecycle coordinator
//
// 1. Start the coordinator with the software backend
// 2. Start a session, record for a few seconds, stop it
// 3. Wait for the SessionEnded event and validate the container
//
// Usage: cargo run --example synthetic_recording -- --duration 3

use anyhow::{bail, Result};
use clap::Parser;
use screen_recorder::config::Config;
use screen_recorder::pipeline::DisplayMetrics;
use screen_recorder::{
    CaptureGrant, ContainerReader, Coordinator, CoordinatorEvent, SoftwareBackend, StartOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "synthetic_recording")]
#[command(about = "Record a synthetic display and tone")]
struct Args {
    /// Duration to record in seconds
    #[arg(short, long, default_value = "3")]
    duration: u64,

    /// Output container
    #[arg(short, long, default_value = "recordings/synthetic.srec")]
    output: PathBuf,

    /// Native display width
    #[arg(long, default_value = "1920")]
    width: u32,

    /// Native display height
    #[arg(long, default_value = "1080")]
    height: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();

    let mut cfg = Config::default();
    cfg.recording.output_path = args.output.clone();

    let backend = Arc::new(SoftwareBackend::new(
        DisplayMetrics {
            width: args.width,
            height: args.height,
        },
        cfg.audio.clone(),
    ));
    let (coordinator, handle) = Coordinator::new(backend, cfg.recording.clone());
    let coordinator_task = tokio::spawn(coordinator.run());
    let mut events = handle.subscribe();

    match handle.start(CaptureGrant::Granted).await? {
        StartOutcome::Started { session_id } => info!("Session {} started", session_id),
        other => bail!("session did not start: {:?}", other),
    }

    tokio::time::sleep(Duration::from_secs(args.duration)).await;
    handle.stop().await?;

    let stats = loop {
        match events.recv().await? {
            CoordinatorEvent::SessionEnded(stats) => break stats,
            CoordinatorEvent::Status(status) => info!("Status: {:?}", status),
            CoordinatorEvent::PermissionDenied => bail!("permission denied"),
        }
    };
    info!("Session stats: {}", serde_json::to_string_pretty(&stats)?);

    drop(handle);
    coordinator_task.await?;

    let Some(path) = stats.output_path else {
        bail!("no container was written");
    };
    let container = ContainerReader::read_file(&path)?;
    for track in &container.summary.tracks {
        info!(
            "Track {} [{}]: {} samples over {:.2}s",
            track.index,
            track.kind,
            track.samples,
            track.duration_us() as f64 / 1_000_000.0
        );
    }
    info!("Wrote {}", path.display());

    Ok(())
}
