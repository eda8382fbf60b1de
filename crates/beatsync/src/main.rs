use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use crossbeam_channel::RecvTimeoutError;

use beatsync::audio::{AudioInput, AudioPipeline};
use beatsync::{OnsetFunction, SyncConfig};

const REPORT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "beatsync")]
#[command(about = "Live beat detection and tempo sync from an audio input")]
struct Args {
    /// JSON config file (defaults to the per-user config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input device name (see --list-devices)
    #[arg(short, long)]
    device: Option<String>,

    /// Print available input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Onset detection function, overriding the config file
    #[arg(long, value_enum)]
    onset: Option<OnsetArg>,

    /// Stop after this many seconds (0 runs until killed)
    #[arg(long, default_value = "0")]
    seconds: u64,

    /// Print each beat and the final metrics as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum OnsetArg {
    SpectralFlux,
    PhaseDeviation,
    ComplexDomain,
}

impl From<OnsetArg> for OnsetFunction {
    fn from(arg: OnsetArg) -> Self {
        match arg {
            OnsetArg::SpectralFlux => Self::SpectralFlux,
            OnsetArg::PhaseDeviation => Self::PhaseDeviation,
            OnsetArg::ComplexDomain => Self::ComplexDomain,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
    let args = Args::parse();

    if args.list_devices {
        for name in AudioInput::list_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::load_or_default(),
    };
    if let Some(onset) = args.onset {
        config.onset_function = onset.into();
    }

    let input = AudioInput::open(args.device.as_deref())?;
    let pipeline = AudioPipeline::start(input, config)?;
    log::info!("Listening on {}", pipeline.device_name);

    let sync = pipeline.sync_handle();
    let deadline = (args.seconds > 0).then(|| Instant::now() + Duration::from_secs(args.seconds));
    let mut next_report = Instant::now() + REPORT_INTERVAL;

    loop {
        match pipeline.beats().recv_timeout(Duration::from_millis(50)) {
            Ok(event) if args.json => println!("{}", serde_json::to_string(&event)?),
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Audio thread stopped");
                break;
            }
        }

        let now = Instant::now();
        if now >= next_report {
            let state = sync.snapshot();
            log::info!(
                "{:6.1} BPM  beat {:.2}  bar {:.2}  conf {:.2}{}",
                state.current_tempo,
                state.beat_phase,
                state.measure_phase,
                state.confidence,
                if state.is_stable { "  locked" } else { "" }
            );
            next_report = now + REPORT_INTERVAL;
        }
        if deadline.is_some_and(|d| now >= d) {
            break;
        }
    }

    if let Some(metrics) = pipeline.stop() {
        log::info!(
            "{} beats, accuracy {:.2}, stability {:.2}, {} missed, {} rejected",
            metrics.total_beats,
            metrics.accuracy,
            metrics.stability,
            metrics.missed_beats,
            metrics.false_positives
        );
        if args.json {
            println!("{}", serde_json::to_string(&metrics)?);
        }
    }
    Ok(())
}
