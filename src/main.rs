//! The Flywheel model-run server command line.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing_log::AsTrace;

use flywheel_engine::Config;
use flywheel_engine::spawn_catalog;

/// Arguments shared by commands that load a configuration file.
#[derive(clap::Args)]
struct ConfigArgs {
    /// Path to the server configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the job service until interrupted.
    Serve(ConfigArgs),

    /// Validates a configuration file and prints the effective settings.
    Config(ConfigArgs),
}

/// The top-level command line.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The selected subcommand.
    #[command(subcommand)]
    command: Commands,

    /// Logging verbosity flags.
    #[command(flatten)]
    verbose: Verbosity,
}

/// Runs the job service until a `ctrl-c` arrives, then stops it cleanly.
async fn serve(args: ConfigArgs) -> anyhow::Result<()> {
    let config = Config::read(&args.config)?;
    let shutdown = CancellationToken::new();
    let (catalog, actor) = spawn_catalog(config, shutdown.clone()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");

    // a clean stop closes the model databases; the token covers the case
    // where the actor is already gone
    let _ = catalog.shutdown().await;
    shutdown.cancel();
    actor.await?;

    Ok(())
}

/// Loads, validates, and echoes a configuration file.
fn show_config(args: ConfigArgs) -> anyhow::Result<()> {
    let config = Config::read(&args.config)?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Parses arguments, installs logging, and dispatches the subcommand.
async fn inner() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Config(args) => show_config(args),
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(1);
    }
}
