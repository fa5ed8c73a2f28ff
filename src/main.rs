use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbpool::cli::{self, SimulateOptions};
use dbpool::config;

#[derive(Parser)]
#[command(name = "dbpool")]
#[command(version, about = "Self-managing async connection pool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pool against a simulated backend and print its metrics
    Simulate {
        /// Number of concurrent clients
        #[arg(long, default_value = "10")]
        workers: usize,

        /// Run time in seconds
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Probability that a query is rolled back
        #[arg(long, default_value = "0.02")]
        rollback_rate: f64,

        /// Print metrics as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            workers,
            duration,
            rollback_rate,
            json,
        } => {
            let options = SimulateOptions {
                workers,
                duration: Duration::from_secs(duration),
                rollback_rate,
                json,
            };
            cli::cmd_simulate(&config, &options).await?;
        }
        Commands::Config => {
            cli::cmd_config(&config)?;
        }
    }

    Ok(())
}
