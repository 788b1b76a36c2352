use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use imucal_core::{CalibrationParameters, ParameterStore, fit_ellipsoid};
use imucal_rust::replay::read_samples;
use imucal_rust::{CalibratedOutput, CalibrationService, ImuCalConfig, JsonFileStore};
use nalgebra::Vector3;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// cargo run -p imucal_rust --bin imucal -- replay capture.csv \
//     --rover achilles --storage-dir /tmp --calibrate --store

#[derive(Parser, Debug)]
#[command(name = "imucal")]
#[command(about = "IMU ellipsoid calibration tools")]
struct Args {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Rover name; overrides `rover` from the configuration.
    #[arg(long, global = true)]
    rover: Option<String>,

    /// Directory holding calibration records; overrides `storage.directory`.
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream a recorded capture through the calibration service
    Replay {
        /// CSV with rows `timestamp,ax,ay,az,mx,my,mz,gx,gy,gz`
        csv_path: PathBuf,

        /// Start a calibration session before the first sample
        #[arg(long)]
        calibrate: bool,

        /// Store the calibration after the last sample
        #[arg(long)]
        store: bool,

        /// Print every output as a JSON line instead of a summary row
        #[arg(long)]
        json: bool,

        /// How long to wait for the service to work through the capture
        #[arg(long, default_value_t = 120)]
        drain_timeout_s: u64,
    },
    /// Fit both sensors over a sample index range of a capture
    Fit {
        csv_path: PathBuf,

        /// Start sample index (0-based)
        #[arg(long, default_value_t = 0)]
        start: usize,

        /// End sample index (0-based, inclusive)
        #[arg(long)]
        end: Option<usize>,
    },
    /// Print the stored calibration record
    Show,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Commands::Replay {
            csv_path,
            calibrate,
            store,
            json,
            drain_timeout_s,
        } => replay(
            &config,
            &csv_path,
            calibrate,
            store,
            json,
            Duration::from_secs(drain_timeout_s),
        ),
        Commands::Fit {
            csv_path,
            start,
            end,
        } => fit(&csv_path, start, end),
        Commands::Show => show(&config),
    }
}

fn load_config(args: &Args) -> Result<ImuCalConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ImuCalConfig::load(path)?
        }
        None => ImuCalConfig::default(),
    };

    if let Some(rover) = &args.rover {
        config.rover = rover.clone();
    }
    if let Some(dir) = &args.storage_dir {
        config.storage.directory = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn replay(
    config: &ImuCalConfig,
    csv_path: &Path,
    calibrate: bool,
    store: bool,
    json: bool,
    drain_timeout: Duration,
) -> Result<()> {
    let samples = read_samples(csv_path)
        .with_context(|| format!("Failed to read capture {}", csv_path.display()))?;
    info!("Loaded {} samples from {}", samples.len(), csv_path.display());

    let mut service = CalibrationService::from_config(config)?;
    service.start();
    let command_timeout = config.command_timeout();

    if calibrate {
        match service.start_calibration(command_timeout)? {
            Some(ack) if ack.success => info!("{}", ack.message),
            Some(ack) => bail!("{}", ack.message),
            None => bail!("Timed out waiting for start-calibration acknowledgement"),
        }
    }

    let total = samples.len();
    for sample in samples {
        service.submit_sample(sample)?;
    }

    if store {
        // Queued behind every sample, so it stores the final fit.
        match service.store_calibration(drain_timeout)? {
            Some(ack) if ack.success => info!("{}", ack.message),
            Some(ack) => bail!("{}", ack.message),
            None => bail!("Timed out waiting for store-calibration acknowledgement"),
        }
    }

    if !service.sync(drain_timeout)? {
        bail!("Service did not finish the capture within {drain_timeout:?}");
    }

    let outputs = service.get_outputs(None)?;
    let diagnostics = service.get_diagnostics(None)?;
    for output in &outputs {
        if json {
            println!("{}", serde_json::to_string(output)?);
        } else {
            print_summary(output);
        }
    }

    let mut skipped = 0;
    while let Some(error) = service.check_error() {
        skipped += 1;
        info!("{error}");
    }
    service.stop();

    println!(
        "\nPublished {} of {total} samples ({skipped} rejected, {} diagnostics records)",
        outputs.len(),
        diagnostics.len()
    );
    if let Some(processor) = service.processor() {
        let calibration = processor.calibration();
        print_parameters("accelerometer", &calibration.accel);
        print_parameters("magnetometer", &calibration.mag);
    }
    Ok(())
}

fn print_summary(output: &CalibratedOutput) {
    let o = &output.imu.orientation;
    println!(
        "{:.4}  roll {:+8.3}°  pitch {:+8.3}°  yaw {:7.3}°  |a| {:.4}  |m| {:.4}",
        output.imu.timestamp_seconds,
        o.roll.to_degrees(),
        o.pitch.to_degrees(),
        o.yaw.to_degrees(),
        output.accel.vector.norm(),
        output.mag.vector.norm(),
    );
}

fn fit(csv_path: &Path, start: usize, end: Option<usize>) -> Result<()> {
    let samples = read_samples(csv_path)
        .with_context(|| format!("Failed to read capture {}", csv_path.display()))?;
    let total = samples.len();
    let end_inclusive = end.unwrap_or_else(|| total.saturating_sub(1));

    if start >= total {
        bail!("start index {start} is out of bounds (total samples: {total})");
    }
    if end_inclusive >= total {
        bail!("end index {end_inclusive} is out of bounds (total samples: {total})");
    }
    if start > end_inclusive {
        bail!("start index {start} must be <= end index {end_inclusive}");
    }

    let range = &samples[start..=end_inclusive];
    let accel: Vec<Vector3<f64>> = range.iter().map(|s| s.accel).collect();
    let mag: Vec<Vector3<f64>> = range.iter().map(|s| s.mag).collect();

    println!("Loaded {total} samples from CSV");
    println!(
        "Using range [{start}..{end_inclusive}] ({} samples)",
        range.len()
    );

    let accel = fit_ellipsoid(&accel).context("Accelerometer fit failed")?;
    let mag = fit_ellipsoid(&mag).context("Magnetometer fit failed")?;
    print_parameters("accelerometer", &accel);
    print_parameters("magnetometer", &mag);
    Ok(())
}

fn print_parameters(label: &str, params: &CalibrationParameters) {
    let (offsets, m) = params.to_arrays();
    println!("\n{label} (T * (raw - b)):");
    println!(
        "  b = [{:.6}, {:.6}, {:.6}]",
        offsets[0], offsets[1], offsets[2]
    );
    println!(
        "  T = [{:.9}, {:.9}, {:.9}; {:.9}, {:.9}, {:.9}; {:.9}, {:.9}, {:.9}]",
        m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7], m[8]
    );
}

fn show(config: &ImuCalConfig) -> Result<()> {
    if config.rover.is_empty() {
        bail!("a rover name is required (--rover or `rover` in the configuration)");
    }
    let store = JsonFileStore::new(&config.storage.directory, &config.rover);

    let Some(record) = store.load_record()? else {
        println!("No IMU calibration file found at {}", store.path().display());
        return Ok(());
    };
    println!("{}", store.path().display());
    println!("{}", serde_json::to_string_pretty(&record)?);

    if let Err(e) = store.load() {
        println!("\nWarning: {e}; the node will start uncalibrated.");
    }
    Ok(())
}
