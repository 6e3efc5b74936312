mod block;
mod cli;
mod client;
mod config;
mod congestion;
mod connection;
mod error;
mod peer;
mod piece;
mod storage;
mod transport;

use anyhow::Result;
use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    cli.run().await?;

    Ok(())
}
