use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use timeline_sync_core::{
    decode, AppConfig, SimulatedEngine, SyncError, TimelineBridge, TracingSink,
};
use tracing_subscriber::EnvFilter;

fn main() -> timeline_sync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play {
            config,
            event,
            frames,
            fps,
        } => run_play(config.as_ref(), event, frames, fps),
        Commands::Decode { input } => run_decode(&input),
    }
}

fn run_play(
    config: Option<&PathBuf>,
    event: Option<String>,
    frames: u32,
    fps: Option<u32>,
) -> timeline_sync_core::Result<()> {
    let mut config = match config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(event) = event {
        config.bridge.event = event;
    }
    if let Some(fps) = fps {
        config.bridge.fps = fps;
    }
    tracing::info!(event = %config.bridge.event, fps = config.bridge.fps, frames, "starting playback");

    let engine = Arc::new(SimulatedEngine::new(config.engine.events.clone())?);
    let mut bridge = TimelineBridge::new(engine.clone());
    if config.bridge.diagnostics {
        bridge = bridge.with_diagnostics(TracingSink);
    }

    bridge.events().on_beat(|beat| {
        tracing::info!(
            bar = beat.bar,
            beat = beat.beat,
            tempo = beat.tempo,
            position = beat.position,
            "beat"
        );
    })?;
    bridge.events().on_marker(|marker| {
        let parameters = marker
            .parameters
            .as_ref()
            .and_then(|parameters| serde_json::to_string(parameters).ok())
            .unwrap_or_default();
        tracing::info!(marker = %marker.name, position = marker.position, %parameters, "marker");
    })?;

    bridge.initialize(&config.bridge.event)?;
    bridge.begin();

    let frame = Duration::from_secs_f64(1.0 / f64::from(config.bridge.fps.max(1)));
    let running = Arc::new(AtomicBool::new(true));
    let audio_thread = {
        let engine = engine.clone();
        let running = running.clone();
        thread::spawn(move || drive_engine(&engine, &running, frame))
    };

    for _ in 0..frames {
        thread::sleep(frame);
        bridge.tick();
    }

    running.store(false, Ordering::SeqCst);
    audio_thread
        .join()
        .map_err(|_| SyncError::msg("audio thread panicked"))??;

    if let Some(info) = bridge.timeline()? {
        tracing::info!(
            length = info.length,
            position = info.position,
            bar = info.bar,
            beat = info.beat,
            last_marker = %info.last_marker,
            "final timeline"
        );
    }
    bridge.shutdown();
    Ok(())
}

/// Advances the simulated engine by wall-clock time until told to stop.
fn drive_engine(
    engine: &SimulatedEngine,
    running: &AtomicBool,
    period: Duration,
) -> timeline_sync_core::Result<()> {
    let mut last = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(period);
        let now = Instant::now();
        let elapsed = i32::try_from(now.duration_since(last).as_millis()).unwrap_or(i32::MAX);
        if elapsed > 0 {
            engine.advance(elapsed)?;
            last = now;
        }
    }
    Ok(())
}

fn run_decode(input: &str) -> timeline_sync_core::Result<()> {
    let params = decode(input)?;
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a music timeline bridge against a simulated audio engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a music event and report beats and markers as they pass.
    Play {
        /// JSON configuration describing the bridge and the authored events.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Event to play, overriding the configuration.
        #[arg(short, long)]
        event: Option<String>,
        /// Number of host frames to run before shutting down.
        #[arg(long, default_value_t = 600)]
        frames: u32,
        /// Host frame rate, overriding the configuration.
        #[arg(long)]
        fps: Option<u32>,
    },
    /// Decode `{name=value}` tokens and print them as JSON.
    Decode {
        /// Encoded parameter string, e.g. `drop{lane=2}{speed=fast}`.
        input: String,
    },
}
