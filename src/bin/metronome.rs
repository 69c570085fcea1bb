//! Metronome command line
//!
//! Plays one or more practice sets on an output device and prints the beat
//! counter as it advances.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use practice_metronome::{
    audio::{list_output_devices, AudioDevice, CpalDevice, StubDevice},
    config::{AppConfig, RunConfig},
    BeatScheduler, RunState,
};

#[derive(Parser, Debug)]
#[command(name = "metronome", version, about = "Practice metronome with warmup and main phases")]
struct Args {
    /// Tempo in beats per minute (1-300)
    #[arg(long)]
    bpm: Option<String>,

    /// Warmup beats before the main phase
    #[arg(long)]
    warmup: Option<String>,

    /// Main phase beats, before the multiplier
    #[arg(long)]
    beats: Option<String>,

    /// Multiplier applied to --beats
    #[arg(long)]
    multiplier: Option<u32>,

    /// Number of sets to play back to back
    #[arg(long, default_value_t = 1)]
    sets: u32,

    /// Run without audio output
    #[arg(long)]
    silent: bool,

    /// Output device name
    #[arg(long)]
    device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print every state change (and device listings) as JSON
    #[arg(long)]
    json: bool,

    /// Configuration file (defaults to the per-user config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let app = match &args.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load()?,
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| app.logging.filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.list_devices {
        let devices = list_output_devices();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&devices)?);
            return Ok(());
        }

        println!("\n=== Available Output Devices ===");
        for device in devices {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}", device.name, default_marker);
            println!("    Sample rates: {:?}", device.sample_rates);
            println!("    Channels: {:?}", device.channels);
        }
        println!();
        return Ok(());
    }

    let defaults = &app.metronome;
    let run_config = RunConfig::from_fields(
        args.bpm.as_deref().unwrap_or(&defaults.bpm.to_string()),
        args.warmup
            .as_deref()
            .unwrap_or(&defaults.warmup_beats.to_string()),
        args.beats.as_deref().unwrap_or(&defaults.beats.to_string()),
        args.multiplier.unwrap_or(defaults.beat_multiplier),
    );

    tracing::info!(
        bpm = run_config.bpm,
        warmup = run_config.warmup_beats,
        main = run_config.main_beats,
        sets = args.sets,
        "Starting metronome"
    );

    if args.silent {
        let scheduler = BeatScheduler::with_device(StubDevice::default()).with_config(run_config);
        play_sets(scheduler, &app, &args).await
    } else {
        let device_name = args.device.clone().or_else(|| app.audio.device.clone());
        let device = CpalDevice::with_device_name(device_name);
        play_sets(BeatScheduler::with_device(device).with_config(run_config), &app, &args).await
    }
}

async fn play_sets<D: AudioDevice>(
    scheduler: BeatScheduler<D>,
    app: &AppConfig,
    args: &Args,
) -> Result<()> {
    let mut scheduler = scheduler.with_lookahead(app.audio.lookahead());
    let run_config = *scheduler.config();

    let mut states = scheduler.subscribe();
    let json = args.json;
    let printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            if json {
                match serde_json::to_string(&state) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Failed to encode state: {}", e),
                }
            } else {
                print_state(&state, &run_config);
            }
        }
    });

    for set in 1..=args.sets {
        scheduler
            .start(run_config)
            .await
            .context("could not start the metronome (try --silent)")?;
        tracing::debug!(set, "Set started");

        let interrupted = tokio::select! {
            _ = scheduler.wait_idle() => false,
            _ = tokio::signal::ctrl_c() => true,
        };
        if interrupted {
            scheduler.stop();
            tracing::info!("Interrupted");
            break;
        }
    }

    let stats = scheduler.stats();
    tracing::info!(
        "Done: {} sets completed, {} stopped, {} ticks, worst lateness {:.2}ms",
        stats.runs_completed,
        stats.runs_stopped,
        stats.ticks_fired,
        stats.max_lateness.as_secs_f64() * 1000.0
    );
    let dropped = scheduler.output().device().dropped_clicks();
    if dropped > 0 {
        tracing::warn!(dropped, "Clicks were dropped by the output device");
    }

    drop(scheduler);
    let _ = printer.await;
    Ok(())
}

fn print_state(state: &RunState, config: &RunConfig) {
    if !state.is_playing {
        println!("Sets played: {}", state.completed_run_count);
        return;
    }
    if state.current_beat_in_phase == 0 {
        return;
    }
    let (label, total) = if state.is_warmup_phase {
        ("Warmup", config.warmup_beats)
    } else {
        ("Main", config.main_beats)
    };
    println!("{} beat {} / {}", label, state.current_beat_in_phase, total);
}
