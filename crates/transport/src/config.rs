//! Transport configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Header slot plus one body entry.
pub const DEFAULT_MAX_IOVLEN: usize = 2;

/// Substrate-wide options applied once at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Max inbound scatter/gather entries, header slot included.
    #[serde(default = "default_iovlen")]
    pub max_in_iovlen: usize,

    /// Max outbound scatter/gather entries, header slot included.
    #[serde(default = "default_iovlen")]
    pub max_out_iovlen: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_in_iovlen: DEFAULT_MAX_IOVLEN,
            max_out_iovlen: DEFAULT_MAX_IOVLEN,
        }
    }
}

fn default_iovlen() -> usize {
    DEFAULT_MAX_IOVLEN
}

impl TransportConfig {
    /// Both directions need room for the header slot and one data entry.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_in_iovlen < 2 || self.max_out_iovlen < 2 {
            return Err(TransportError::InvalidOption(format!(
                "iovlen must be at least 2 (in={}, out={})",
                self.max_in_iovlen, self.max_out_iovlen
            )));
        }
        Ok(())
    }

    /// Loads a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| TransportError::InvalidOption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_in_iovlen, 2);
        assert_eq!(config.max_out_iovlen, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: TransportConfig = serde_json::from_str(r#"{"max_in_iovlen": 4}"#).unwrap();
        assert_eq!(config.max_in_iovlen, 4);
        assert_eq!(config.max_out_iovlen, 2);
    }

    #[test]
    fn test_rejects_header_only() {
        let config = TransportConfig {
            max_in_iovlen: 1,
            max_out_iovlen: 2,
        };
        assert!(config.validate().is_err());
    }
}
