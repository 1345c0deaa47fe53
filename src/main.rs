//! CLI entry point for beamline flyscans
//!
//! Runs one flyscan against simulated hardware and prints the files it wrote.
//!
//! # Usage
//!
//! ```bash
//! flyscan run --data-root /tmp/fly --points 100 --period 0.02 --collection-time 0.01
//! flyscan run --detector eiger:eiger --detector xsp:vortex --motor x --start 0 --stop 2
//! flyscan config
//! ```

use anyhow::{bail, Context, Result};
use beamline_flyscan::config::{FlyscanConfig, DEFAULT_CONFIG_FILE};
use beamline_flyscan::experiment::{
    AcquisitionModes, AcquisitionPath, FlyscanRequest, RunMetadata, StaticExperimentDirectory,
};
use beamline_flyscan::hardware::mock::SimulatedBeamline;
use beamline_flyscan::hardware::DetectorKind;
use beamline_flyscan::logging;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "flyscan")]
#[command(about = "Synchrotron flyscan orchestration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one flyscan on simulated hardware
    Run(RunArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// Data root of the experiment (defaults to storage.base_path)
    #[arg(long)]
    data_root: Option<PathBuf>,

    #[arg(long, default_value = "default")]
    experiment: String,

    #[arg(long, default_value = "sample")]
    sample: String,

    #[arg(long, default_value = "flyscan")]
    name_base: String,

    #[arg(long, default_value_t = 1)]
    scan_id: u64,

    /// Number of path points (one frame per detector each)
    #[arg(long, default_value_t = 100)]
    points: usize,

    /// Trigger period in seconds
    #[arg(long, default_value_t = 0.02)]
    period: f64,

    /// Detector exposure in seconds
    #[arg(long, default_value_t = 0.01)]
    collection_time: f64,

    /// Detector as `name:kind` (eiger, lambda, vortex, generic); repeatable
    #[arg(long = "detector", default_value = "eiger:eiger")]
    detectors: Vec<String>,

    /// Stepped motor; without it the path is timed only
    #[arg(long)]
    motor: Option<String>,

    #[arg(long, default_value_t = 0.0)]
    start: f64,

    #[arg(long, default_value_t = 1.0)]
    stop: f64,

    #[arg(long)]
    dichro: bool,

    #[arg(long)]
    fix_q: bool,

    /// Override trigger.drain_points_per_packet
    #[arg(long)]
    drain_points: Option<f64>,

    /// Extra run metadata as `key=value`; repeatable
    #[arg(long = "md")]
    metadata: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FlyscanConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run(args) => {
            logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
            run(config, args).await
        }
    }
}

fn parse_detector(spec: &str) -> Result<(String, DetectorKind)> {
    let (name, kind) = spec.split_once(':').unwrap_or((spec, "generic"));
    if name.is_empty() {
        bail!("detector '{spec}' has no name");
    }
    Ok((name.to_string(), kind.parse()?))
}

fn parse_metadata(pairs: &[String]) -> Result<RunMetadata> {
    let mut md = RunMetadata::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("metadata '{pair}' is not key=value");
        };
        let value = serde_json::from_str::<serde_json::Value>(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        md.insert(key, value)?;
    }
    Ok(md)
}

async fn run(config: FlyscanConfig, args: RunArgs) -> Result<()> {
    let detectors = args
        .detectors
        .iter()
        .map(|spec| parse_detector(spec))
        .collect::<Result<Vec<_>>>()?;
    let detector_refs: Vec<(&str, DetectorKind)> =
        detectors.iter().map(|(n, k)| (n.as_str(), *k)).collect();
    let motors: Vec<&str> = args.motor.iter().map(String::as_str).collect();

    let path = match &args.motor {
        Some(motor) => AcquisitionPath::line(motor, args.start, args.stop, args.points),
        None => AcquisitionPath::timed(args.points),
    };

    let data_root = args
        .data_root
        .clone()
        .unwrap_or_else(|| config.storage.base_path.clone());
    let directory = Arc::new(
        StaticExperimentDirectory::new().with_experiment(args.experiment.as_str(), data_root),
    );

    let beamline = SimulatedBeamline::new(&config, &detector_refs, &motors);
    let orchestrator = beamline.orchestrator(config, directory).await?;

    let mut request = FlyscanRequest::new(path, args.period, args.collection_time)
        .experiment(args.experiment)
        .sample(args.sample)
        .name_base(args.name_base)
        .scan_id(args.scan_id)
        .modes(AcquisitionModes {
            dichro: args.dichro,
            fix_q: args.fix_q,
        })
        .metadata(parse_metadata(&args.metadata)?);
    if let Some(points) = args.drain_points {
        request = request.drain_points_per_packet(points);
    }

    let run = orchestrator.run(request);
    tokio::pin!(run);
    let report = tokio::select! {
        report = &mut run => report?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.abort("interrupted");
            run.await?
        }
    };

    info!(run_uid = %report.run_uid, points = report.points, "Run finished");
    println!("run      {}", report.run_uid);
    println!("master   {}", report.files.master_file_path.display());
    println!("position {}", report.files.position_stream_file_path.display());
    for (name, files) in &report.files.detector_file_paths {
        let frames = report.frames.get(name).copied().unwrap_or_default();
        println!("{name:<8} {} ({frames} frames)", files.full_path.display());
    }
    if !report.master.missing.is_empty() {
        println!("missing  {}", report.master.missing.join(", "));
    }
    Ok(())
}
