use clap::Parser;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use voxreg::config::RunConfig;
use voxreg::dispatch::execute;
use voxreg::error::{ErrorKind, PhaseError};
use voxreg::nifti::NiftiCodec;

#[derive(Parser, Debug)]
#[command(name = "voxreg-local")]
#[command(version = option_env!("VOXREG_RELEASE_TAG").unwrap_or(env!("CARGO_PKG_VERSION")))]
#[command(about = "Local-site node for federated voxelwise regression", long_about = None)]
struct Cli {
    /// Read the phase message from this file instead of standard input.
    #[arg(long)]
    message: Option<PathBuf>,
    /// JSON run configuration; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Worker threads for the matrix kernels.
    #[arg(long)]
    threads: Option<usize>,
    /// File name of the numeric report written to the transfer directory.
    #[arg(long = "output-name")]
    output_name: Option<String>,
    /// File name of the group-average volume.
    #[arg(long = "avg-name")]
    avg_name: Option<String>,
}

enum Failure {
    Setup(String),
    Phase(PhaseError),
}

impl Failure {
    fn exit_code(&self) -> i32 {
        match self {
            Failure::Setup(_) => ErrorKind::Environment.exit_code(),
            Failure::Phase(e) => e.exit_code(),
        }
    }
}

impl From<PhaseError> for Failure {
    fn from(e: PhaseError) -> Self {
        Failure::Phase(e)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    if let Err(failure) = run() {
        match &failure {
            Failure::Setup(msg) => log::error!("[voxreg] {msg}"),
            Failure::Phase(e) => log::error!("[voxreg] {:?} failure: {e}", e.kind()),
        }
        std::process::exit(failure.exit_code());
    }
}

fn run() -> Result<(), Failure> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    if let Some(threads) = config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| Failure::Setup(format!("failed to size the worker pool: {e}")))?;
    }

    let raw = match &cli.message {
        Some(path) => fs::read_to_string(path)
            .map_err(|e| Failure::Setup(format!("failed to read '{}': {e}", path.display())))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| Failure::Setup(format!("failed to read stdin: {e}")))?;
            buf
        }
    };
    let message: serde_json::Value = serde_json::from_str(&raw).map_err(|source| {
        Failure::Phase(PhaseError::Schema {
            phase: "envelope",
            source,
        })
    })?;

    let document = execute(&message, &NiftiCodec::new(), &config)?;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, &document)
        .map_err(|e| Failure::Setup(format!("failed to write output: {e}")))?;
    writeln!(stdout).map_err(|e| Failure::Setup(format!("failed to write output: {e}")))?;
    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<RunConfig, Failure> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| {
                Failure::Setup(format!("failed to read config '{}': {e}", path.display()))
            })?;
            serde_json::from_str::<RunConfig>(&text).map_err(|e| {
                Failure::Setup(format!("invalid config '{}': {e}", path.display()))
            })?
        }
        None => RunConfig::default(),
    };
    if cli.threads.is_some() {
        config.threads = cli.threads;
    }
    if let Some(name) = &cli.output_name {
        config.output_name = name.clone();
    }
    if let Some(name) = &cli.avg_name {
        config.avg_name = name.clone();
    }
    config.validate().map_err(Failure::Setup)?;
    Ok(config)
}
