use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use galvo_scan_core::{
    AppConfig, ParkConfig, ScanController, SimClock, SimulatedBackend, StreamingEngine,
};
use tracing_subscriber::EnvFilter;

fn main() -> galvo_scan_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { seconds, ranges } => run_scan(&config, seconds, &ranges),
        Commands::Zero => controller(&config)?.zero(),
        Commands::Park { x, z, piezo } => {
            let defaults = config.park;
            controller(&config)?.park_at(ParkConfig {
                x: x.unwrap_or(defaults.x),
                z: z.unwrap_or(defaults.z),
                piezo: piezo.unwrap_or(defaults.piezo),
            })
        }
        Commands::Config => {
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}

fn run_scan(
    config: &AppConfig,
    seconds: f64,
    ranges: &[RangeOverride],
) -> galvo_scan_core::Result<()> {
    let backend = Arc::new(SimulatedBackend::new().without_traces());
    let controller = ScanController::new(StreamingEngine::new(backend.clone(), config)?);
    for range in ranges {
        controller.set_range(&range.channel_id, range.min, range.max)?;
    }
    for spec in controller.channels().iter() {
        tracing::info!(
            channel = spec.channel_id(),
            label = spec.label(),
            frequency = spec.frequency(),
            range = ?spec.range(),
            "output channel"
        );
    }

    let acquired = Arc::new(AtomicU64::new(0));
    let counter = acquired.clone();
    controller.with_engine(|engine| {
        engine.set_acquisition_sink(Box::new(move |block| {
            counter.fetch_add(block.samples() as u64, Ordering::Relaxed);
        }))
    })?;

    tracing::info!(seconds, "starting scan on simulated device");
    controller.trigger_start()?;
    let clock = SimClock::spawn(
        backend,
        config.stream.samples_per_refresh(),
        config.stream.sample_rate,
    )?;

    let monitor = controller.monitor().clone();
    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    while Instant::now() < deadline && monitor.fault().is_none() {
        thread::sleep(Duration::from_millis(250));
        tracing::debug!(
            refills = monitor.refill_count(),
            acquisitions = monitor.acquisition_count(),
            "scan progress"
        );
    }
    drop(clock);

    let refills = monitor.refill_count();
    let fault = controller.take_fault()?;
    controller.trigger_stop()?;
    tracing::info!(
        refills,
        acquired_samples = acquired.load(Ordering::Relaxed),
        "scan finished"
    );

    match fault {
        Some(fault) => Err(fault),
        None => Ok(()),
    }
}

fn controller(config: &AppConfig) -> galvo_scan_core::Result<ScanController<SimulatedBackend>> {
    let backend = Arc::new(SimulatedBackend::new());
    Ok(ScanController::new(StreamingEngine::new(backend, config)?))
}

fn load_config(path: Option<&Path>) -> galvo_scan_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            AppConfig::load(path)
        }
        None => Ok(AppConfig::default()),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Operator range for one output channel, given as `ID=MIN:MAX`.
#[derive(Debug, Clone)]
struct RangeOverride {
    channel_id: String,
    min: f64,
    max: f64,
}

fn parse_range(value: &str) -> Result<RangeOverride, String> {
    let (channel_id, bounds) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=MIN:MAX, got `{value}`"))?;
    let (min, max) = bounds
        .split_once(':')
        .ok_or_else(|| format!("expected MIN:MAX after `{channel_id}=`"))?;
    let parse = |text: &str| {
        text.trim()
            .parse::<f64>()
            .map_err(|err| format!("invalid voltage `{text}`: {err}"))
    };
    Ok(RangeOverride {
        channel_id: channel_id.trim().to_string(),
        min: parse(min)?,
        max: parse(max)?,
    })
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Galvo scanning microscope waveform streamer", long_about = None)]
struct Cli {
    /// JSON configuration file. Built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream the scan waveforms on the simulated device.
    Run {
        /// How long to stream before stopping.
        #[arg(short, long, default_value_t = 2.0)]
        seconds: f64,
        /// Operator range override, e.g. `ao0=-2:2`. May be repeated.
        #[arg(short, long = "range", value_name = "ID=MIN:MAX", value_parser = parse_range)]
        ranges: Vec<RangeOverride>,
    },
    /// Drive every output to 0 V.
    Zero,
    /// Move the galvos and the piezo to their park position.
    Park {
        #[arg(long)]
        x: Option<f64>,
        #[arg(long)]
        z: Option<f64>,
        #[arg(long)]
        piezo: Option<f64>,
    },
    /// Print the effective configuration as JSON.
    Config,
}
