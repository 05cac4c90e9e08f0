// ballast demo
//
// Pushes a batch of SHA-256 digest tasks through a balancer and reports how
// the load was spread. Every `--fail-every`-th task fails on purpose so the
// failure passthrough is visible in the summary.

use anyhow::{Context, Result};
use ballast_core::{Balancer, BalancerConfig, BalancerStatus};
use clap::Parser;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ballast")]
#[command(about = "Run a batch of digest tasks through a least-loaded worker pool")]
#[command(version)]
struct Cli {
    /// Worker count (defaults to BALLAST_WORKERS, then the CPU count)
    #[arg(long, short)]
    workers: Option<usize>,

    /// Ingress depth per worker (defaults to BALLAST_INGRESS_PER_WORKER)
    #[arg(long)]
    ingress_per_worker: Option<usize>,

    /// Inbound queue depth per worker (defaults to BALLAST_INBOUND_CAPACITY)
    #[arg(long)]
    inbound_capacity: Option<usize>,

    /// Number of tasks to submit
    #[arg(long, short, default_value_t = 64)]
    tasks: usize,

    /// Bytes hashed per task
    #[arg(long, default_value_t = 4096)]
    payload_size: usize,

    /// Fail every k-th task (0 disables)
    #[arg(long, default_value_t = 0)]
    fail_every: usize,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    output: String,
}

impl Cli {
    fn config(&self) -> Result<BalancerConfig> {
        let mut config = BalancerConfig::from_env().context("reading BALLAST_* environment")?;
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(depth) = self.ingress_per_worker {
            config.ingress_per_worker = depth;
        }
        if let Some(depth) = self.inbound_capacity {
            config.inbound_capacity = depth;
        }
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    succeeded: usize,
    failed: usize,
    lost: usize,
    first_digest: Option<String>,
    status: BalancerStatus,
}

fn digest(index: usize, size: usize, fail_every: usize) -> Result<String, String> {
    if fail_every > 0 && (index + 1) % fail_every == 0 {
        return Err(format!("task {index}: rejected input"));
    }
    let payload: Vec<u8> = (0..size).map(|i| ((index + i) % 251) as u8).collect();
    Ok(hex::encode(Sha256::digest(&payload)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ballast_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;
    let balancer = Balancer::<String, String>::with_config(config)?;

    let mut handles = Vec::with_capacity(cli.tasks);
    for index in 0..cli.tasks {
        let (size, fail_every) = (cli.payload_size, cli.fail_every);
        handles.push(balancer.submit(move || digest(index, size, fail_every)).await?);
    }
    tracing::info!(tasks = cli.tasks, "all tasks submitted");

    let mut summary = Summary {
        succeeded: 0,
        failed: 0,
        lost: 0,
        first_digest: None,
        status: BalancerStatus::default(),
    };
    for handle in handles {
        match handle.await {
            Ok(Ok(hash)) => {
                summary.succeeded += 1;
                summary.first_digest.get_or_insert(hash);
            }
            Ok(Err(reason)) => {
                summary.failed += 1;
                tracing::debug!(%reason, "task failed");
            }
            Err(e) => {
                summary.lost += 1;
                tracing::warn!(error = %e, "task outcome lost");
            }
        }
    }
    summary.status = balancer.shutdown().await?;

    match cli.output.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => {
            println!(
                "succeeded={} failed={} lost={}",
                summary.succeeded, summary.failed, summary.lost
            );
            if let Some(hash) = &summary.first_digest {
                println!("first digest: {hash}");
            }
            println!(
                "workers={} dispatched={} completed={}",
                summary.status.workers, summary.status.dispatched, summary.status.completed
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest(3, 64, 0), digest(3, 64, 0));
        assert_ne!(digest(3, 64, 0), digest(4, 64, 0));
        assert_eq!(digest(0, 16, 0).unwrap().len(), 64);
    }

    #[test]
    fn digest_fails_on_schedule() {
        assert!(digest(0, 8, 2).is_ok());
        assert_eq!(digest(1, 8, 2), Err("task 1: rejected input".to_string()));
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from(["ballast", "--workers", "3", "--inbound-capacity", "7"]);
        let config = cli.config().unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.inbound_capacity, 7);
    }
}
