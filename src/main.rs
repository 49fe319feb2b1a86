// Main binary that runs the responder
use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use std::io::stderr;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

mod cmd;
mod config;

use cmd::check::CheckArgs;
use cmd::serve::ServeArgs;

#[derive(Parser, Debug)]
#[command(author, version, about = "Relayed DHCP responder for bare metal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the DHCP responder.
    Serve(ServeArgs),
    /// Validates a config file and prints the plugin chain.
    Check(CheckArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // RUST_LOG wins; --verbose only changes the fallback
    let level = if cli.verbose { "debug" } else { "info" };
    let default_directives = format!(
        "metalrelay={level},metalrelay_dhcp={level},metalrelay_store={level}",
        level = level
    );
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    registry()
        .with(filter)
        .with(fmt::layer().with_writer(stderr))
        .init();
    debug!("Logger initialized");

    match cli.command {
        Commands::Serve(args) => cmd::serve::run_serve(args).await,
        Commands::Check(args) => cmd::check::run_check(args).await,
    }
}
