//! ferry - command-line entry point.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use ferry::cli::{Cli, Command};
use ferry::config::FerryConfig;
use ferry::server::Server;
use ferry::transport;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_directive().into()),
        )
        .init();

    let mut config =
        FerryConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    match &cli.command {
        Command::Send { file, .. } => {
            let addr = (config.client.server.as_str(), config.client.port);
            let stats = transport::upload(addr, file, config.sender_config()).await?;
            if let Some(rate) = stats.throughput() {
                tracing::info!(
                    bytes = stats.bytes,
                    mib_per_sec = rate / (1024.0 * 1024.0),
                    "done"
                );
            }
        }
        Command::Serve { .. } => {
            let receiver = config.receiver_config();
            tokio::fs::create_dir_all(&receiver.root)
                .await
                .with_context(|| format!("Failed to create {}", receiver.root.display()))?;

            let addr = (config.server.listen.as_str(), config.server.port);
            let listener = TcpListener::bind(addr).await.with_context(|| {
                format!(
                    "Failed to bind {}:{}",
                    config.server.listen, config.server.port
                )
            })?;
            tracing::info!(dir = %receiver.root.display(), "receiving files");

            Server::upload(receiver)
                .serve(listener, async {
                    tokio::signal::ctrl_c().await.ok();
                    tracing::info!("shutdown signal received");
                })
                .await?;
        }
    }

    Ok(())
}
