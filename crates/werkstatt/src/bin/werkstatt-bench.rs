//! werkstatt-bench — Runs a batch of demo jobs through a worker pool.
//!
//! Builds a pool from `werkstatt.toml`, pushes `--tasks` increment jobs
//! through round-robin dispatch concurrently, then prints per-worker stats
//! as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Default pool (four task-isolated workers)
//! werkstatt-bench
//!
//! # Custom config, more work, slower jobs
//! werkstatt-bench --config config/werkstatt.toml --tasks 500 --delay-ms 25
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use werkstatt::{Computation, Job, WerkstattConfig, WorkerPool};

/// Runs demo jobs through a werkstatt pool and reports worker stats.
#[derive(Parser, Debug)]
#[command(name = "werkstatt-bench", version, about)]
struct Cli {
    /// Path to the werkstatt configuration file (built-in defaults if omitted).
    #[arg(long, env = "WERKSTATT_CONFIG")]
    config: Option<PathBuf>,

    /// Number of jobs to dispatch.
    #[arg(long, default_value_t = 100)]
    tasks: u64,

    /// Simulated work per job, in milliseconds.
    #[arg(long, default_value_t = 10)]
    delay_ms: u64,

    /// Per-job timeout in milliseconds (falls back to the pool default).
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Work {
    value: u64,
    delay_ms: u64,
}

/// Sleeps for `delay_ms`, then returns `value + 1`.
struct Increment;

#[async_trait]
impl Computation for Increment {
    type Input = Work;
    type Output = u64;

    async fn compute(input: &Work) -> anyhow::Result<u64> {
        tokio::time::sleep(Duration::from_millis(input.delay_ms)).await;
        Ok(input.value + 1)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => WerkstattConfig::from_file(path)?,
        None => WerkstattConfig::local(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();

    let pool: WorkerPool<Job<Increment>> = WorkerPool::from_config(&config.pool)?;
    pool.start().await?;
    info!(workers = ?pool.list_tags().await, tasks = cli.tasks, "pool ready");

    let timeout = cli.timeout_ms.map(Duration::from_millis);
    let started = Instant::now();
    let results = join_all((0..cli.tasks).map(|value| {
        let pool = pool.clone();
        let job = Job::<Increment>::new(Work {
            value,
            delay_ms: cli.delay_ms,
        });
        async move {
            match timeout {
                Some(limit) => pool.dispatch_with_timeout(job, limit).await,
                None => pool.dispatch(job).await,
            }
        }
    }))
    .await;

    let mut succeeded = 0u64;
    for result in results {
        match result {
            Ok(_) => succeeded += 1,
            Err(e) => warn!(error = %e, "job failed"),
        }
    }
    info!(
        succeeded,
        failed = cli.tasks - succeeded,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "batch finished"
    );

    println!("{}", serde_json::to_string_pretty(&pool.stats().await)?);
    pool.remove_all().await;
    Ok(())
}
