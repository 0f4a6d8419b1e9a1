use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tiller_core::config::TillerConfig;
use tiller_server::bootstrap;

#[derive(Parser)]
#[command(
    name = "tiller",
    about = "Cluster automation control plane: sensors observe, operators decide, actions run",
    version
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short = 'c', default_value = "tiller.yaml", env = "TILLER_CONFIG")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = TillerConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    if cli.check {
        println!(
            "configuration OK: {} cluster(s), {} global sensor(s), {} operator(s)",
            config.clusters.len(),
            config.plugins.sensors.len(),
            config.plugins.operators.len()
        );
        return Ok(());
    }

    let manager = bootstrap::build_manager(&config).context("bootstrap failed")?;
    manager.load_audited_actions().await;
    manager.start();
    info!(clusters = manager.cluster_ids().len(), "tiller started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    manager.shutdown();
    manager.checkpoint_all();
    Ok(())
}
