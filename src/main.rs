//! midiclock - Clock synchronization demo for audio/MIDI playback timing.
//!
//! Runs a simulated audio stream: a rendering thread that writes chunks
//! to an imaginary device and refreshes the time/frame mapping, and a
//! MIDI thread that periodically converts arrival times into target
//! frame positions. Prints the published snapshots and the computed
//! timestamps so the estimation can be observed converging.
//!
//! # Usage
//!
//! ```bash
//! cargo run                        # 2-second simulation with defaults
//! cargo run -- --config cfg.json  # load a StreamConfig from JSON
//! cargo run -- --seconds 5        # run longer
//! ```

mod clock;
mod stream;

use anyhow::{Context, Result};
use clock::now_nanos;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream::{StreamClock, StreamConfig};

/// Command-line options for the demo.
struct CliOptions {
    /// Optional path to a JSON stream configuration.
    config: Option<PathBuf>,
    /// How long to run the simulation, in seconds.
    seconds: u64,
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Supports:
    /// - `--config <path>` or `-c <path>`: Load a StreamConfig from JSON
    /// - `--seconds <n>` or `-s <n>`: Simulation length (default 2)
    /// - `--help` or `-h`: Print help and exit
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut config: Option<PathBuf> = None;
        let mut seconds = 2u64;
        let mut i = 1;

        while i < args.len() {
            match args[i].as_str() {
                "--config" | "-c" => {
                    i += 1;
                    if i >= args.len() {
                        eprintln!("Error: --config requires a path argument");
                        std::process::exit(1);
                    }
                    config = Some(PathBuf::from(&args[i]));
                }
                "--seconds" | "-s" => {
                    i += 1;
                    if i >= args.len() {
                        eprintln!("Error: --seconds requires a number");
                        std::process::exit(1);
                    }
                    seconds = args[i]
                        .parse()
                        .context("--seconds requires a positive integer")?;
                }
                "--help" | "-h" => {
                    eprintln!("midiclock - audio/MIDI clock synchronization demo");
                    eprintln!();
                    eprintln!(
                        "Usage: {} [OPTIONS]",
                        args.first().unwrap_or(&"midiclock".to_string())
                    );
                    eprintln!();
                    eprintln!("Options:");
                    eprintln!("  -c, --config PATH  Load stream configuration from a JSON file");
                    eprintln!("  -s, --seconds N    Simulation length in seconds (default 2)");
                    eprintln!("  -h, --help         Print this help message");
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        Ok(Self { config, seconds })
    }
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    // Initialize logging (optional, for debugging)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match cli.config {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            StreamConfig::from_json(&json).context("Failed to parse config")?
        }
        None => StreamConfig::default(),
    };
    config.validate().context("Invalid stream configuration")?;
    tracing::info!("Stream configuration: {:?}", config);
    if !config.advanced_timing {
        tracing::warn!("no drift tracker wired into the demo; using the internal position model");
    }

    let mut stream_clock = StreamClock::new(&config);
    let timestamper = stream_clock.timestamper();
    let running = Arc::new(AtomicBool::new(true));

    // MIDI thread: stamp a synthetic event every 50 ms.
    let midi_running = Arc::clone(&running);
    let midi_thread = std::thread::spawn(move || {
        while midi_running.load(Ordering::Relaxed) {
            let timestamp = timestamper.estimate_timestamp(None);
            tracing::info!(
                "event -> frame {} (latency {} frames)",
                timestamp,
                timestamper.midi_latency_frames()
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    });

    // Rendering loop: hand one chunk per period to the imaginary device,
    // then refresh the mapping from the measured time. The simulated
    // device keeps one chunk in flight.
    let chunk_frames = stream::latency::frames_from_ms(config.chunk_len_ms, config.sample_rate);
    let chunk_period = Duration::from_millis(config.chunk_len_ms as u64);
    let deadline = std::time::Instant::now() + Duration::from_secs(cli.seconds);

    while std::time::Instant::now() < deadline {
        stream_clock.add_rendered_frames(chunk_frames);
        stream_clock.update_position(now_nanos(), chunk_frames);
        let snapshot = stream_clock.snapshot();
        tracing::debug!(
            "snapshot: frame {} at {} ns, rate {:.1}",
            snapshot.frames,
            snapshot.nanos,
            snapshot.sample_rate
        );
        std::thread::sleep(chunk_period);
    }

    running.store(false, Ordering::Relaxed);
    midi_thread.join().expect("MIDI thread panicked");

    let snapshot = stream_clock.snapshot();
    println!(
        "rendered {} frames; final estimated rate {:.1} Hz (nominal {})",
        stream_clock.frames_rendered(),
        snapshot.sample_rate,
        config.sample_rate
    );
    Ok(())
}
