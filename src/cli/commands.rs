use anyhow::{Context, Result};
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::pool::ConnectionPool;
use crate::sim::{self, SimulatedBackend};

/// Options for `dbpool simulate`
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub workers: usize,
    pub duration: Duration,
    pub rollback_rate: f64,
    pub json: bool,
}

/// Drive a pool with simulated clients and print the detailed metrics
pub async fn cmd_simulate(config: &Config, options: &SimulateOptions) -> Result<()> {
    let backend = SimulatedBackend::new(config.simulation.clone());
    let pool = ConnectionPool::new(config.name.clone(), backend, config.pool.clone())
        .context("Invalid pool configuration")?;

    println!(
        "Simulating {} workers against pool '{}' for {:.1}s...",
        options.workers,
        pool.name(),
        options.duration.as_secs_f64()
    );

    let outcome = sim::run_load(&pool, options.workers, options.duration, options.rollback_rate).await;
    pool.close().await;
    let (report, metrics) = outcome.context("Simulation failed")?;

    info!(
        queries = report.queries,
        failed_acquisitions = report.failed_acquisitions,
        rollbacks = report.rollbacks,
        "Simulation finished"
    );

    println!(
        "Queries: {} ({:.1}/s), failed acquisitions: {}, rollbacks: {}",
        report.queries,
        report.queries as f64 / options.duration.as_secs_f64().max(f64::EPSILON),
        report.failed_acquisitions,
        report.rollbacks
    );
    println!();

    let rendered = if options.json {
        serde_json::to_string_pretty(&metrics)?
    } else {
        serde_yaml::to_string(&metrics)?
    };
    println!("{}", rendered);
    Ok(())
}

/// Print the effective configuration after file and environment overrides
pub fn cmd_config(config: &Config) -> Result<()> {
    config
        .pool
        .validate()
        .context("Effective configuration is invalid")?;
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}
