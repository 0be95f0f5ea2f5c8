//! The `driftmon` binary.

#![deny(clippy::unwrap_used)]
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

use atty::Stream;
use clap::{Parser, Subcommand};
use driftmon::config;
use driftmon::ext::error_stack::{DescribeContext, ErrorHelper};
use driftmon::subcommand;
use error_stack::{fmt::ColorMode, Report, Result, ResultExt};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("determine effective configuration")]
    DetermineEffectiveConfig,

    #[error("a fatal error occurred during internal configuration")]
    InternalSetup,

    #[error("a fatal error occurred at runtime")]
    Runtime,
}

#[derive(Debug, Parser)]
#[clap(version)]
struct Opts {
    /// driftmon can run a number of subcommands.
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a starter config file to the data root.
    Init(config::RawArgs),

    /// Run the worker process with the current config.
    Run(config::RawArgs),

    /// Trigger a manual scan of one repository.
    Scan(ScanOpts),
}

#[derive(Debug, Parser)]
struct ScanOpts {
    #[clap(flatten)]
    base: config::RawArgs,

    /// The configured name of the repository to scan.
    repo: String,

    /// Advisory commit sha for the scan record.
    #[arg(long)]
    commit: Option<String>,

    /// Recorded as the actor that asked for the scan.
    #[arg(long, default_value = "cli")]
    actor: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // App-wide setup that doesn't depend on config or subcommand goes here.
    let version = env!("CARGO_PKG_VERSION");
    if atty::is(Stream::Stdout) {
        Report::set_color_mode(ColorMode::Color);
    } else {
        Report::set_color_mode(ColorMode::None);
    }

    let Opts { command } = Opts::parse();
    match command {
        Commands::Init(args) => main_init(args).await,
        Commands::Run(args) => main_run(args).await,
        Commands::Scan(opts) => main_scan(opts).await,
    }
    .describe_lazy(|| format!("driftmon version: {version}"))
}

/// Write a starter config file.
async fn main_init(args: config::RawArgs) -> Result<(), Error> {
    let data_root = args
        .validate_init()
        .await
        .change_context(Error::DetermineEffectiveConfig)?;
    subcommand::init::main(&data_root)
        .await
        .change_context(Error::Runtime)
}

/// Run the worker process with the current config.
async fn main_run(args: config::RawArgs) -> Result<(), Error> {
    let args = args
        .validate()
        .await
        .change_context(Error::DetermineEffectiveConfig)
        .help("try running driftmon with the '--help' argument to see available options and usage suggestions")?;

    let conf = config::load(&args)
        .await
        .change_context(Error::DetermineEffectiveConfig)?;
    debug!("Loaded {conf:?}");

    let _tracing_guard = subcommand::run_tracing_sink(args.data_root())
        .change_context(Error::InternalSetup)?;

    subcommand::run::main(&args, conf)
        .await
        .change_context(Error::Runtime)
}

/// Trigger a manual scan of one repository.
async fn main_scan(opts: ScanOpts) -> Result<(), Error> {
    let ScanOpts {
        base,
        repo,
        commit,
        actor,
    } = opts;
    let args = base
        .validate()
        .await
        .change_context(Error::DetermineEffectiveConfig)
        .help("try running driftmon with the '--help' argument to see available options and usage suggestions")?;

    let conf = config::load(&args)
        .await
        .change_context(Error::DetermineEffectiveConfig)?;

    let _tracing_guard = subcommand::run_tracing_sink(args.data_root())
        .change_context(Error::InternalSetup)?;

    subcommand::scan::main(&args, conf, &repo, commit, &actor)
        .await
        .change_context(Error::Runtime)
}
