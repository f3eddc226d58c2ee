//! loadstorm: load generation and measurement for HTTP(S) and WebSocket
//! endpoints.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

/// Load generation and measurement engine
#[derive(Parser)]
#[command(name = "loadstorm")]
#[command(about = "Generate controlled concurrent load and measure latency", long_about = None)]
#[command(version)]
struct Cli {
    /// Log engine events at info level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test
    ///
    /// Loads the plan from --config (if given), applies flag overrides, runs
    /// the test with a live status line, prints a summary and writes a JSON
    /// report to loadstorm-reports/.
    Run(commands::run::RunArgs),

    /// Generate a starter loadstorm.toml
    Init {
        /// Where to write the file
        #[arg(long, default_value = "loadstorm.toml")]
        output: std::path::PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match cli.command {
        Commands::Run(args) => tokio::runtime::Runtime::new()
            .map_err(anyhow::Error::from)
            .and_then(|runtime| runtime.block_on(commands::run::execute_run(args))),
        Commands::Init { output, force } => {
            commands::init::execute_init(&output, force).map(|()| ExitCode::SUCCESS)
        },
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(commands::EXIT_INVALID)
        },
    }
}

/// Initialize logging to stderr.
///
/// Default level is `warn`, or `info` with `--verbose`; `RUST_LOG` wins.
fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
