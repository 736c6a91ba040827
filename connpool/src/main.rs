//! connpool probe
//!
//! Opens a pool against one endpoint and drives it through a configurable
//! number of acquire/release cycles, logging the resulting occupancy.

mod logging;
mod probe;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use connpool::{Network, Pool, PoolConfig};
use tracing::info;

use crate::logging::init_logging;
use crate::probe::ProbeOptions;

#[derive(Parser, Debug)]
#[command(
    name = "connpool-probe",
    version,
    about = "Exercise a bounded connection pool against one endpoint"
)]
struct Cli {
    /// Path to a pool config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Transport: tcp, tcp4, tcp6 or unix
    #[arg(long)]
    network: Option<Network>,

    /// Endpoint address, overriding the config file
    #[arg(long)]
    address: Option<String>,

    #[arg(long)]
    max_idle: Option<usize>,

    /// 0 means unlimited
    #[arg(long)]
    max_open: Option<usize>,

    #[arg(long, default_value_t = 100)]
    requests: usize,

    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Give up on an acquisition after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let mut cfg = match (&self.config, &self.address) {
            (Some(path), _) => PoolConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            (None, Some(address)) => PoolConfig::new(Network::default(), address.clone()),
            (None, None) => anyhow::bail!("either --config or --address is required"),
        };

        if let Some(network) = self.network {
            cfg.network = network;
        }
        if let Some(address) = &self.address {
            cfg.address = address.clone();
        }
        if let Some(n) = self.max_idle {
            cfg.max_idle_conns = n;
        }
        if let Some(n) = self.max_open {
            cfg.max_open_conns = n;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);

    let cfg = cli.pool_config()?;
    let pool = Arc::new(Pool::from_config(&cfg));
    info!(
        event = "probe_started",
        network = %cfg.network,
        address = %cfg.address,
        max_idle = pool.max_idle_conns(),
        max_open = pool.max_open_conns(),
        requests = cli.requests,
        concurrency = cli.concurrency,
    );

    let report = probe::run(
        pool,
        ProbeOptions {
            requests: cli.requests,
            concurrency: cli.concurrency,
            timeout: cli.timeout_ms.map(Duration::from_millis),
        },
    )
    .await;

    info!(
        event = "probe_finished",
        succeeded = report.succeeded,
        failed = report.failed,
        elapsed_ms = report.elapsed.as_millis() as u64,
        idle = report.stats.idle,
        max_idle = report.stats.max_idle,
        open = ?report.stats.open,
        max_open = report.stats.max_open,
    );

    if report.failed > 0 {
        anyhow::bail!("{} of {} requests failed", report.failed, cli.requests);
    }
    Ok(())
}
