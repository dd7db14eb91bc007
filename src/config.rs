use std::fs;
use std::path::{Path, PathBuf};

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::crypto::SignatureScheme;
use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub mempool_limit: usize,
    /// Only affects external block packaging; the engine itself commits
    /// per delivered request.
    #[serde(default = "default_transactions_per_block")]
    pub transactions_per_block: usize,
    /// How many past commits remain checkable; 0 collects each commit as
    /// soon as the next lands, negative disables collection.
    #[serde(default)]
    pub checkable_depth: i64,
    pub consensus: ConsensusConfig,
}

fn default_transactions_per_block() -> usize {
    512
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.key_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            mempool_limit: 8_192,
            transactions_per_block: default_transactions_per_block(),
            checkable_depth: 0,
            consensus: ConsensusConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub chain_id: String,
    /// Name of the signature algorithm requests must carry: `ed25519`,
    /// `ed25519det` or `empty` (accepts everything, for tests).
    pub signature: String,
    #[serde(default)]
    pub allow_unsigned_faucet: bool,
    #[serde(default)]
    pub allow_mint_burn_from_gamete: bool,
    #[serde(default)]
    pub allows_self_charged: bool,
    #[serde(default)]
    pub ignore_gas_price: bool,
    /// Coins charged per unit of gas, unless `ignore_gas_price` is set.
    #[serde(default = "default_gas_price")]
    pub gas_price: String,
    pub initial_supply: String,
    #[serde(default = "default_zero")]
    pub initial_red_supply: String,
    /// Base64-encoded public key of the gamete.
    pub public_key_of_gamete: String,
    #[serde(default = "default_max_gas_per_view")]
    pub max_gas_per_view_transaction: u64,
}

fn default_gas_price() -> String {
    "1".to_string()
}

fn default_zero() -> String {
    "0".to_string()
}

fn default_max_gas_per_view() -> u64 {
    1_000_000
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            chain_id: "banyan-local".to_string(),
            signature: "ed25519".to_string(),
            allow_unsigned_faucet: false,
            allow_mint_burn_from_gamete: false,
            allows_self_charged: false,
            ignore_gas_price: false,
            gas_price: default_gas_price(),
            initial_supply: "1000000000000000".to_string(),
            initial_red_supply: default_zero(),
            public_key_of_gamete: String::new(),
            max_gas_per_view_transaction: default_max_gas_per_view(),
        }
    }
}

impl ConsensusConfig {
    pub fn parse(&self) -> ChainResult<ConsensusParams> {
        let parse_amount = |value: &str, what: &str| -> ChainResult<BigInt> {
            value
                .parse()
                .map_err(|_| ChainError::Config(format!("invalid {what}: {value}")))
        };
        Ok(ConsensusParams {
            chain_id: self.chain_id.clone(),
            signature: SignatureScheme::from_name(&self.signature)?,
            allow_unsigned_faucet: self.allow_unsigned_faucet,
            allow_mint_burn_from_gamete: self.allow_mint_burn_from_gamete,
            allows_self_charged: self.allows_self_charged,
            ignore_gas_price: self.ignore_gas_price,
            gas_price: parse_amount(&self.gas_price, "gas price")?,
            initial_supply: parse_amount(&self.initial_supply, "initial supply")?,
            initial_red_supply: parse_amount(&self.initial_red_supply, "initial red supply")?,
            public_key_of_gamete: self.public_key_of_gamete.clone(),
            max_gas_per_view_transaction: BigInt::from(self.max_gas_per_view_transaction),
        })
    }
}

/// The parsed consensus parameters, shared by admission and execution.
#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub chain_id: String,
    pub signature: SignatureScheme,
    pub allow_unsigned_faucet: bool,
    pub allow_mint_burn_from_gamete: bool,
    pub allows_self_charged: bool,
    pub ignore_gas_price: bool,
    pub gas_price: BigInt,
    pub initial_supply: BigInt,
    pub initial_red_supply: BigInt,
    pub public_key_of_gamete: String,
    pub max_gas_per_view_transaction: BigInt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = NodeConfig::default();
        let encoded = toml::to_string_pretty(&config).unwrap();
        let decoded: NodeConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.consensus.chain_id, config.consensus.chain_id);
        assert_eq!(decoded.checkable_depth, config.checkable_depth);
    }

    #[test]
    fn consensus_parsing_validates_amounts() {
        let mut config = ConsensusConfig::default();
        config.initial_supply = "not a number".to_string();
        assert!(config.parse().is_err());

        let mut config = ConsensusConfig::default();
        config.signature = "empty".to_string();
        let params = config.parse().unwrap();
        assert_eq!(params.signature, SignatureScheme::Empty);
        assert_eq!(params.initial_supply, BigInt::from(1_000_000_000_000_000u64));
    }
}
