//! Orchestrator daemon
//!
//! Runs a local process kernel and the service orchestrator on top of it
//! until SIGINT or SIGTERM arrives.

use anyhow::{Context, Result};
use clap::Parser;
use process_kernel::Kernel;
use service_orchestration::{Orchestrator, OrchestratorConfig};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orchestrator-daemon")]
#[command(about = "Supervise the executables under a service root", long_about = None)]
struct Args {
    /// Configuration file (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Kernel root directory, overriding the configuration
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Reconciliation interval in milliseconds, overriding the configuration
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Discover executables in subdirectories of the root
    #[arg(long)]
    recursive: bool,
}

impl Args {
    async fn load_config(&self) -> Result<OrchestratorConfig> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::from_file(path)
                .await
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => OrchestratorConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(ms) = self.interval_ms {
            config.interval = Duration::from_millis(ms);
        }
        if self.recursive {
            config.recursive = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Resolves once the process receives SIGINT or SIGTERM
fn shutdown_signal() -> Result<async_channel::Receiver<i32>> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to register signal handler")?;
    let (tx, rx) = async_channel::bounded(1);
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let _ = tx.send_blocking(sig);
        }
    });
    Ok(rx)
}

async fn run(args: Args) -> Result<()> {
    let config = args.load_config().await?;
    info!("Kernel root: {}", config.root.display());

    let kernel = Arc::new(
        Kernel::new(&config.root)
            .with_context(|| format!("cannot use {} as kernel root", config.root.display()))?,
    );
    let shutdown = shutdown_signal()?;
    let orchestrator = Orchestrator::builder(config, kernel.clone()).start().await?;

    match shutdown.recv().await {
        Ok(sig) => info!("Received signal {sig}, shutting down"),
        Err(_) => warn!("Signal listener exited, shutting down"),
    }

    orchestrator.close().await?;
    kernel.close().await?;
    info!("Shutdown complete");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    smol::block_on(run(args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_on_top_of_defaults() {
        let args = Args::parse_from([
            "orchestrator-daemon",
            "--root",
            "/srv/services",
            "--interval-ms",
            "2500",
            "--recursive",
        ]);
        let config = smol::block_on(args.load_config()).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/services"));
        assert_eq!(config.interval, Duration::from_millis(2500));
        assert!(config.recursive);
        assert_eq!(config.retain_stopped, 64);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let args = Args::parse_from(["orchestrator-daemon", "--interval-ms", "0"]);
        assert!(smol::block_on(args.load_config()).is_err());
    }

    #[test]
    fn test_missing_config_file_is_reported() {
        let args = Args::parse_from(["orchestrator-daemon", "-c", "/nonexistent/orchestrator.yaml"]);
        let err = smol::block_on(args.load_config()).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/orchestrator.yaml"));
    }
}
