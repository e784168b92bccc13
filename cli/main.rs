#![deny(unused_variables)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand};
use ndarray::{Ix3, Ix4};
use std::path::{Path, PathBuf};
use std::process;

use voxfit::config::{RunConfig, RunContext};
use voxfit::fit::cascade::{ModelRun, RunOptions, SampleRun};
use voxfit::fit::library;
use voxfit::fit::model::ModelNode;
use voxfit::ndio;
use voxfit::types::{Acquisition, InputData, VolumeMetadata};

#[derive(Parser)]
#[command(
    name = "voxfit",
    about = "Chunked, resumable voxel-wise model fitting and sampling",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fit a model (or cascade) to a volumetric dataset
    Fit(FitArgs),
    /// Draw posterior samples of a model over a volumetric dataset
    Sample(SampleArgs),
}

#[derive(Args)]
struct FitArgs {
    /// Model name, e.g. "ExpDecay" or "ExpDecay (Cascade)"
    model: String,

    /// Directory holding signals.vxa, mask.vxa and (optionally)
    /// acquisition.txt and volume_metadata.toml
    data_dir: PathBuf,

    /// Directory to place the output maps in
    output_dir: PathBuf,

    /// Optional TOML run configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Recompute even when results are already present
    #[arg(long)]
    recalculate: bool,

    /// With --recalculate on a cascade: force only the last link
    #[arg(long)]
    only_recalculate_last: bool,
}

#[derive(Args)]
struct SampleArgs {
    /// Terminal model name, e.g. "ExpDecay"
    model: String,

    /// Directory holding signals.vxa, mask.vxa and (optionally)
    /// acquisition.txt and volume_metadata.toml
    data_dir: PathBuf,

    /// Directory to place the output maps and sample traces in
    output_dir: PathBuf,

    /// Optional TOML run configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Recompute even when results are already present
    #[arg(long)]
    recalculate: bool,

    /// Override the number of retained samples per voxel
    #[arg(long)]
    samples: Option<usize>,

    /// Override the number of burn-in samples
    #[arg(long)]
    burnin: Option<usize>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Fit(args) => run_fit(args),
        Command::Sample(args) => run_sample(args),
    };
    if let Err(message) = outcome {
        eprintln!("error: {message}");
        process::exit(1);
    }
}

fn resolve_model(name: &str) -> Result<ModelNode, String> {
    match library::by_name(name) {
        Some(Ok(node)) => Ok(node),
        Some(Err(e)) => Err(format!("model '{name}' failed to build: {e}")),
        None => Err(format!(
            "unknown model '{name}'; available models: {}",
            library::available_models().join(", ")
        )),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig, String> {
    match path {
        Some(path) => RunConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(RunConfig::default()),
    }
}

/// Loads the on-disk input layout: `signals.vxa` (f64, `[x, y, z, obs]`),
/// `mask.vxa` (u8, `[x, y, z]`), an optional `acquisition.txt` table and an
/// optional `volume_metadata.toml` sidecar.
fn load_input_dir(data_dir: &Path) -> Result<InputData, String> {
    let signals_path = data_dir.join("signals.vxa");
    let signals = ndio::read_f64(&signals_path)
        .map_err(|e| e.to_string())?
        .into_dimensionality::<Ix4>()
        .map_err(|_| format!("'{}' must be a 4-D volume", signals_path.display()))?;

    let mask_path = data_dir.join("mask.vxa");
    let mask = ndio::read_u8(&mask_path)
        .map_err(|e| e.to_string())?
        .mapv(|v| v != 0)
        .into_dimensionality::<Ix3>()
        .map_err(|_| format!("'{}' must be a 3-D mask", mask_path.display()))?;

    let acquisition_path = data_dir.join("acquisition.txt");
    let acquisition = if acquisition_path.exists() {
        let text =
            std::fs::read_to_string(&acquisition_path).map_err(|e| {
                format!("cannot read '{}': {e}", acquisition_path.display())
            })?;
        Acquisition::from_table_text(&text).map_err(|e| e.to_string())?
    } else {
        Acquisition::unstructured(signals.dim().3)
    };

    let metadata_path = data_dir.join("volume_metadata.toml");
    let metadata = if metadata_path.exists() {
        let text = std::fs::read_to_string(&metadata_path)
            .map_err(|e| format!("cannot read '{}': {e}", metadata_path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("cannot parse '{}': {e}", metadata_path.display()))?
    } else {
        VolumeMetadata::default()
    };

    InputData::new(signals, mask, acquisition, metadata).map_err(|e| e.to_string())
}

fn run_fit(args: FitArgs) -> Result<(), String> {
    let node = resolve_model(&args.model)?;
    let config = load_config(args.config.as_ref())?;
    let input = load_input_dir(&args.data_dir)?;
    let ctx = RunContext::for_output(&args.output_dir, &config);

    let options = RunOptions {
        recalculate: args.recalculate,
        only_recalculate_last: args.only_recalculate_last,
    };
    let combined = ModelRun::new(node, &input, &args.output_dir, &ctx, options)
        .run()
        .map_err(|e| e.to_string())?;

    println!(
        "wrote {} output map(s) covering {} voxel(s) under {}",
        combined.roi.len(),
        combined
            .roi
            .values()
            .next()
            .map(|roi| roi.nrows())
            .unwrap_or(0),
        args.output_dir.display()
    );
    Ok(())
}

fn run_sample(args: SampleArgs) -> Result<(), String> {
    let node = resolve_model(&args.model)?;
    let model = match node {
        ModelNode::Terminal(model) => model,
        ModelNode::Cascade(_) => {
            return Err(format!(
                "'{}' is a cascade; sampling runs over terminal models only",
                args.model
            ));
        }
    };

    let mut config = load_config(args.config.as_ref())?;
    if let Some(samples) = args.samples {
        config.sampling.samples = samples;
    }
    if let Some(burnin) = args.burnin {
        config.sampling.burnin = burnin;
    }

    let input = load_input_dir(&args.data_dir)?;
    let ctx = RunContext::for_output(&args.output_dir, &config);

    let combined = SampleRun::new(model, &input, &args.output_dir, &ctx, args.recalculate)
        .run()
        .map_err(|e| e.to_string())?;

    println!(
        "wrote {} output map(s) and sample traces under {}",
        combined.roi.len(),
        args.output_dir.display()
    );
    Ok(())
}
