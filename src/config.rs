use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::Network;
use crate::params::ScriptVariant;
use crate::provider::{DEFAULT_MIN_FEE, FeePolicy};

/// Per-deployment swap settings, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    pub network: Network,
    /// Electrum endpoint; `None` uses the network default.
    pub electrum_url: Option<String>,
    /// Confirmations required before a counterpart's funding counts.
    pub confirmations: u32,
    /// Interval between polls of the ledger.
    pub poll_interval_ms: u64,
    /// Satoshi fee floor for spends and funding.
    pub min_fee: u64,
    /// Fee-driven rebroadcasts allowed per spend.
    pub max_fee_retries: u8,
    pub variant: ScriptVariant,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            electrum_url: None,
            confirmations: 0,
            poll_interval_ms: 1_000,
            min_fee: DEFAULT_MIN_FEE,
            max_fee_retries: 1,
            variant: ScriptVariant::default(),
        }
    }
}

impl SwapConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&contents)
    }

    pub fn electrum_url(&self) -> &str {
        self.electrum_url
            .as_deref()
            .unwrap_or_else(|| self.network.default_electrum_url())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            min_fee: self.min_fee,
            max_retries: self.max_fee_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_json_is_default() {
        let config = SwapConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SwapConfig::default());
        assert_eq!(config.electrum_url(), "ssl://blockstream.info:993");
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_overrides() {
        let config = SwapConfig::from_json_str(
            r#"{"network":"regtest","min_fee":500,"variant":"legacy","electrum_url":"tcp://127.0.0.1:60401"}"#,
        )
        .unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.variant, ScriptVariant::Legacy);
        assert_eq!(config.fee_policy().min_fee, 500);
        assert_eq!(config.fee_policy().max_retries, 1);
        assert_eq!(config.electrum_url(), "tcp://127.0.0.1:60401");
    }

    #[test]
    fn bad_input_is_config_error() {
        assert!(matches!(
            SwapConfig::from_json_str(r#"{"network":"signet"}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SwapConfig::from_file("/nonexistent/swap.json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"confirmations":2,"poll_interval_ms":250}}"#).unwrap();
        let config = SwapConfig::from_file(file.path()).unwrap();
        assert_eq!(config.confirmations, 2);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
    }
}
