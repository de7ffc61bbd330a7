//! CLI entry point for xio-client.

use clap::Parser;
use cli::CliConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CliConfig::parse();
    let result = config.run()?;
    println!("{}", result);
    Ok(())
}
