//! Gateway configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use transport::TransportConfig;

use crate::error::{GatewayError, Result};

pub const DEFAULT_WORKERS: usize = 8;

/// Worker pool size plus the transport options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Threads in the fan-out worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            transport: TransportConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(GatewayError::Config("workers must be at least 1".to_string()));
        }
        self.transport
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Loads a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
