//! versa CLI - deterministic deployments over SSH.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use versa_core::DeployResult;

#[derive(Parser)]
#[command(name = "versa")]
#[command(about = "Deterministic deployment engine: hash-based change detection, selective builds, atomic symlink activation, instant rollback")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "deploy.yml")]
    config: PathBuf,

    /// Verbose output (debug-level logs)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Append JSON log records to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy to the specified environment
    Deploy {
        /// Environment name from deploy.yml
        environment: String,

        /// Show what would be deployed without touching the remote
        #[arg(long)]
        dry_run: bool,

        /// Allow a missing deploy.lock (first deployment)
        #[arg(long)]
        initial_deploy: bool,

        /// Deploy even when no changes are detected
        #[arg(long)]
        force: bool,

        /// Skip the working tree cleanliness check
        #[arg(long)]
        skip_dirty_check: bool,
    },

    /// Roll back to the previous release
    Rollback {
        /// Environment name from deploy.yml
        environment: String,
    },

    /// Show deployment status
    Status {
        /// Environment name from deploy.yml
        environment: String,
    },

    /// Test the SSH connection to an environment
    SshTest {
        /// Environment name from deploy.yml
        environment: String,
    },

    /// Scaffold a deploy.yml in the current directory
    Init,

    /// Show application version
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli) {
        eprintln!("error: failed to initialise logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        if let Some(hint) = e.remediation() {
            eprintln!("hint: {hint}");
        }
        // The last stderr line is the message plus its stable code.
        eprintln!("error: {e} [{}]", e.code());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> DeployResult<()> {
    match cli.command {
        Commands::Deploy {
            environment,
            dry_run,
            initial_deploy,
            force,
            skip_dirty_check,
        } => {
            let options = versa_deploy::DeployOptions {
                dry_run,
                initial_deploy,
                force,
                skip_dirty_check,
            };
            commands::deploy::run(&cli.config, &environment, options).await
        }
        Commands::Rollback { environment } => {
            commands::rollback::run(&cli.config, &environment).await
        }
        Commands::Status { environment } => commands::status::run(&cli.config, &environment).await,
        Commands::SshTest { environment } => {
            commands::ssh_test::run(&cli.config, &environment).await
        }
        Commands::Init => commands::init::run(),
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time();

    let file_layer = match &cli.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(())
}
