use clap::Parser;
use std::error::Error;

mod chord;
mod cli;
mod engine;
mod pastry;

#[cfg(test)]
mod tests;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = cli::Cli::parse();
    match &cli.command {
        cli::Commands::Chord(config) => run_chord(config).await,
        cli::Commands::Pastry(config) => run_pastry(config).await,
    }
}

async fn run_chord(config: &cli::NodeConfig) -> Result<(), Box<dyn Error>> {
    init_tracing(&config.common.log_level);
    let (node, server) = chord::ChordNode::start(config).await?;
    if let Some(addr) = &config.bootstrap {
        let bootstrap = ringleaf_types::NodeInfo::from_addr(addr)?;
        node.join(&bootstrap).await?;
    }
    tokio::signal::ctrl_c().await?;
    tracing::info!(node = %node.info(), "interrupt received, leaving overlay");
    if let Err(e) = node.leave().await {
        tracing::warn!(error = %e, "could not leave cleanly");
    }
    server.shutdown().await;
    Ok(())
}

async fn run_pastry(config: &cli::NodeConfig) -> Result<(), Box<dyn Error>> {
    init_tracing(&config.common.log_level);
    let (node, server) = pastry::PastryNode::start(config).await?;
    if let Some(addr) = &config.bootstrap {
        let bootstrap = ringleaf_types::NodeInfo::from_addr(addr)?;
        node.join(&bootstrap).await?;
    }
    tokio::signal::ctrl_c().await?;
    tracing::info!(node = %node.info(), "interrupt received, leaving overlay");
    if let Err(e) = node.leave().await {
        tracing::warn!(error = %e, "could not leave cleanly");
    }
    server.shutdown().await;
    Ok(())
}

fn init_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
