//! screen-recorder - capture the screen and system audio into one container
//!
//! Subcommands:
//! - `screen-recorder record` - Record until Ctrl-C or `--duration` elapses
//! - `screen-recorder serve` - Run the HTTP command surface
//! - `screen-recorder inspect <file>` - Validate and summarize a recording

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use screen_recorder::codec::StreamKind;
use screen_recorder::{
    create_router, AppState, Config, ContainerReader, Coordinator, MediaBackend,
    RecordingSession, SessionConfig, SoftwareBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "screen-recorder")]
#[command(about = "Record the screen and system audio into a single container")]
#[command(version)]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(short, long, default_value = "config/screen-recorder")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a single session
    Record {
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Override the configured output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Serve start/stop/status over HTTP
    Serve,

    /// Validate a recording and print its summary
    Inspect {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("screen_recorder=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record { duration, output } => {
            let mut cfg = Config::load(&cli.config)?;
            if let Some(output) = output {
                cfg.recording.output_path = output;
            }
            record(cfg, duration.map(Duration::from_secs)).await
        }
        Commands::Serve => serve(Config::load(&cli.config)?).await,
        Commands::Inspect { file } => inspect(file),
    }
}

async fn record(cfg: Config, duration: Option<Duration>) -> Result<()> {
    let backend: Arc<dyn MediaBackend> = Arc::new(SoftwareBackend::from_config(&cfg));
    let config = SessionConfig::for_display(&cfg.recording, backend.display_metrics())?;

    info!(
        "Recording {}x{} @ {} fps ({} bps) to {}",
        config.width,
        config.height,
        config.frame_rate,
        config.bit_rate,
        config.output_path.display()
    );

    let mut session = RecordingSession::start(config, backend);
    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, stopping"),
        _ = deadline => info!("Duration elapsed, stopping"),
        _ = session.wait() => {}
    }

    let stats = session.stop_and_wait().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if stats.is_failed() {
        anyhow::bail!(
            "recording failed: {}",
            stats.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn serve(cfg: Config) -> Result<()> {
    let backend: Arc<dyn MediaBackend> = Arc::new(SoftwareBackend::from_config(&cfg));
    let (coordinator, handle) = Coordinator::new(backend, cfg.recording.clone());
    let coordinator_task = tokio::spawn(coordinator.run());

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("{} listening on http://{}", cfg.service.name, addr);

    axum::serve(listener, create_router(AppState::new(handle)))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    // The router owned the last handle; the coordinator now stops any
    // active session and exits
    coordinator_task.await.context("Coordinator task failed")?;
    Ok(())
}

fn inspect(file: PathBuf) -> Result<()> {
    let container = ContainerReader::read_file(&file)
        .with_context(|| format!("Invalid recording: {}", file.display()))?;

    println!("{} (format v{})", file.display(), container.version);
    for track in &container.summary.tracks {
        println!(
            "  track {} [{}]: {} samples, {} bytes, {:.2}s",
            track.index,
            track.kind,
            track.samples,
            track.bytes,
            track.duration_us() as f64 / 1_000_000.0
        );
    }
    for kind in [StreamKind::Video, StreamKind::Audio] {
        if container.track(kind).is_none() {
            warn!("No {} track", kind);
        }
    }
    println!(
        "  timestamps monotonic: {}",
        container.timestamps_non_decreasing()
    );
    println!("  finished at {}", container.summary.finished_at);
    Ok(())
}
