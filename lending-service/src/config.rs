use anyhow::{Context, Result};
use bitcoin::Network;
use quas_custody::{CustodianKeySet, LendingPolicy};
use serde::Deserialize;
use std::env;
use std::fs;

/// Environment variable that overrides `custody.master_seed_hex`.
pub const SEED_ENV: &str = "BITCOIN_KEY";

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    pub network: NetworkConfig,
    pub server: ServerConfig,
    pub custody: CustodyConfig,
    #[serde(default)]
    pub chain: ChainConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(rename = "type")]
    pub network_type: String, // "testnet", "signet" or "regtest"
}

impl NetworkConfig {
    pub fn bitcoin_network(&self) -> Result<Network> {
        match self.network_type.as_str() {
            "mainnet" | "bitcoin" => {
                anyhow::bail!("Custody runs on test networks only, got {}", self.network_type)
            }
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => anyhow::bail!("Invalid network type: {}", other),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize)]
pub struct CustodyConfig {
    #[serde(default)]
    pub master_seed_hex: Option<String>,
    #[serde(flatten)]
    pub policy: LendingPolicy,
}

impl std::fmt::Debug for CustodyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustodyConfig")
            .field("master_seed_hex", &self.master_seed_hex.as_ref().map(|_| "<redacted>"))
            .field("policy", &self.policy)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

fn default_base_url() -> String {
    "https://mempool.space/testnet/api".to_string()
}

impl ConfigFile {
    pub fn load(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let mut config = Self::from_toml(&content)?;
        config.override_seed(env::var(SEED_ENV).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// A non-empty seed from the environment replaces the file's.
    pub fn override_seed(&mut self, seed_hex: Option<String>) {
        if let Some(seed) = seed_hex.filter(|s| !s.trim().is_empty()) {
            tracing::info!("Using master seed from {}", SEED_ENV);
            self.custody.master_seed_hex = Some(seed);
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.network.bitcoin_network()?;
        self.custody
            .policy
            .validate()
            .context("Invalid custody policy")?;
        self.key_set()?;

        if !self.chain.base_url.starts_with("http") {
            anyhow::bail!("chain.base_url must be an http(s) URL");
        }
        Ok(())
    }

    pub fn key_set(&self) -> Result<CustodianKeySet> {
        let seed = self.custody.master_seed_hex.as_deref().context(format!(
            "custody.master_seed_hex is not set and {} is empty",
            SEED_ENV
        ))?;
        CustodianKeySet::from_seed_hex(seed).context("Invalid master seed")
    }
}
