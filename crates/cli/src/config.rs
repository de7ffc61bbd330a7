//! Command-line options and process setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use clap::Parser;
use gateway::{Gateway, GatewayConfig, ThreadPoolQueue};
use tracing::info;
use transport::{TcpSubstrate, TransportRuntime};

use crate::commands::{Command, CommandResult};

#[derive(Parser, Debug)]
#[command(name = "xio-client")]
#[command(about = "Blocking RPC client for storage nodes")]
#[command(version)]
pub struct CliConfig {
    /// JSON config file (workers, transport limits)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Fan-out worker threads; overrides the config file
    #[arg(long)]
    pub workers: Option<usize>,

    /// Max inbound scatter/gather entries; overrides the config file
    #[arg(long)]
    pub max_in_iovlen: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    /// Config file values with command-line overrides applied.
    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::from_json_file(path)?,
            None => GatewayConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(n) = self.max_in_iovlen {
            config.transport.max_in_iovlen = n;
        }
        config.validate()?;
        Ok(config)
    }

    /// Initializes the transport on this thread, then runs the command on a
    /// separate one.
    pub fn run(&self) -> anyhow::Result<CommandResult> {
        let config = self.gateway_config()?;

        let mut runtime = TransportRuntime::init(Arc::new(TcpSubstrate::new()), &config.transport)
            .context("transport init failed")?;
        runtime
            .init_main_ctx()
            .context("main context creation failed")?;

        let executor = Arc::new(runtime.executor());
        let queue = ThreadPoolQueue::new("gateway", config.workers)
            .context("failed to start worker pool")?;
        let gateway = Gateway::new(Arc::clone(&executor), queue);
        info!(workers = config.workers, "client ready");

        let result = thread::scope(|s| {
            thread::Builder::new()
                .name("request".to_string())
                .spawn_scoped(s, || self.command.execute(&*executor, &gateway))
                .context("failed to spawn request thread")?
                .join()
                .map_err(|_| anyhow!("request thread panicked"))?
        });

        drop(gateway);
        runtime.shutdown();
        result
    }
}
