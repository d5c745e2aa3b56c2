use anyhow::{bail, ensure, Context, Result};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, str::FromStr, time::Duration};

use crate::proof_fetcher::PollPolicy;
use crate::queue::RetryPolicy;

pub const PRIVATE_KEY_ENV: &str = "RELAYER_PRIVATE_KEY";
pub const API_TOKEN_ENV: &str = "POLYMER_API_TOKEN";

// Config structures
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
}

/// One monitored source -> destination route.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RelayPair {
    pub source_chain_id: u64,
    pub source_resolver_address: String,
    pub dest_chain_id: u64,
    pub dest_dapp_address: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProofApiConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ProofApiConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.max_poll_attempts,
            interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Unlimited when absent.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RelayerConfig {
    pub polling_interval_ms: u64,
    pub chains: Vec<ChainConfig>,
    pub relay_pairs: Vec<RelayPair>,
    pub proof_api: ProofApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default = "default_delivery_gas_limit")]
    pub delivery_gas_limit: u64,
}

fn default_max_poll_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_base_delay_ms() -> u64 {
    0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_rpc_timeout_ms() -> u64 {
    30_000
}

fn default_confirmation_timeout_ms() -> u64 {
    120_000
}

fn default_delivery_gas_limit() -> u64 {
    1_000_000
}

impl RelayerConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let string = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {path:?}"))?;
        Self::from_toml_str(&string)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("Failed to deserialize TOML config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.polling_interval_ms > 0,
            "polling_interval_ms must be greater than 0"
        );
        ensure!(
            !self.proof_api.endpoint.trim().is_empty(),
            "proof_api.endpoint must not be empty"
        );
        ensure!(
            self.proof_api.max_poll_attempts > 0,
            "proof_api.max_poll_attempts must be greater than 0"
        );
        ensure!(self.delivery_gas_limit > 0, "delivery_gas_limit must be greater than 0");

        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if !chain_ids.insert(chain.chain_id) {
                bail!("Duplicate chain id {} in config", chain.chain_id);
            }
        }

        for pair in &self.relay_pairs {
            for chain_id in [pair.source_chain_id, pair.dest_chain_id] {
                ensure!(
                    chain_ids.contains(&chain_id),
                    "Relay pair references chain {chain_id} which is not configured"
                );
            }
            ensure!(
                pair.source_chain_id != pair.dest_chain_id,
                "Relay pair source and destination are both chain {}",
                pair.source_chain_id
            );
            ensure!(
                u32::try_from(pair.dest_chain_id).is_ok(),
                "Destination chain id {} does not fit in uint32",
                pair.dest_chain_id
            );
            Address::from_str(&pair.source_resolver_address).with_context(|| {
                format!("Invalid resolver address {}", pair.source_resolver_address)
            })?;
            Address::from_str(&pair.dest_dapp_address)
                .with_context(|| format!("Invalid dapp address {}", pair.dest_dapp_address))?;
        }

        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// The attestation token from the environment wins over the file.
    pub fn resolve_api_token(&self, from_env: Option<String>) -> Result<String> {
        from_env
            .filter(|t| !t.is_empty())
            .or_else(|| self.proof_api.token.clone())
            .with_context(|| {
                format!("Attestation token missing: set {API_TOKEN_ENV} or proof_api.token")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        polling_interval_ms = 10000

        [[chains]]
        name = "Optimism Sepolia"
        chain_id = 11155420
        rpc_url = "https://optimism-sepolia.example.com"

        [[chains]]
        name = "Base Sepolia"
        chain_id = 84532
        rpc_url = "https://base-sepolia.example.com"

        [[relay_pairs]]
        source_chain_id = 11155420
        source_resolver_address = "0x1234567890123456789012345678901234567890"
        dest_chain_id = 84532
        dest_dapp_address = "0x0987654321098765432109876543210987654321"

        [proof_api]
        endpoint = "https://proof.testnet.polymer.zone"
    "#;

    #[test]
    fn parses_with_defaults() {
        let config = RelayerConfig::from_toml_str(CONFIG).unwrap();
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.relay_pairs[0].dest_chain_id, 84532);
        assert_eq!(config.proof_api.max_poll_attempts, 5);
        assert_eq!(config.proof_api.poll_interval_ms, 2_000);
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.retry.policy().base_delay, Duration::ZERO);
        assert_eq!(config.delivery_gas_limit, 1_000_000);
        assert_eq!(config.chain(84532).unwrap().name, "Base Sepolia");
    }

    #[test]
    fn rejects_misplaced_keys() {
        let toml = format!("{CONFIG}\n[retry]\nbase_delay_ms = 0\ndelivery_gas_limit = 750000\n");
        let err = RelayerConfig::from_toml_str(&toml).unwrap_err();
        assert!(format!("{err:#}").contains("unknown field `delivery_gas_limit`"));

        let toml = CONFIG.replace(
            "polling_interval_ms = 10000",
            "polling_interval_ms = 10000\ndelivery_gas_limit = 750000",
        );
        assert_eq!(RelayerConfig::from_toml_str(&toml).unwrap().delivery_gas_limit, 750_000);
    }

    #[test]
    fn rejects_unknown_chain_in_pair() {
        let toml = CONFIG.replace("dest_chain_id = 84532", "dest_chain_id = 1");
        let err = RelayerConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("chain 1 which is not configured"));
    }

    #[test]
    fn rejects_zero_polling_interval() {
        let toml = CONFIG.replace("polling_interval_ms = 10000", "polling_interval_ms = 0");
        assert!(RelayerConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn rejects_bad_resolver_address() {
        let toml = CONFIG.replace("0x1234567890123456789012345678901234567890", "0xnope");
        let err = RelayerConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("Invalid resolver address"));
    }

    #[test]
    fn env_token_overrides_file_token() {
        let mut config = RelayerConfig::from_toml_str(CONFIG).unwrap();
        assert!(config.resolve_api_token(None).is_err());

        config.proof_api.token = Some("file".into());
        assert_eq!(config.resolve_api_token(None).unwrap(), "file");
        assert_eq!(
            config.resolve_api_token(Some("env".into())).unwrap(),
            "env"
        );
        assert_eq!(config.resolve_api_token(Some(String::new())).unwrap(), "file");
    }
}
