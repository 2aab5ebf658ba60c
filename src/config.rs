use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub seed_path: PathBuf,
    pub block_interval_ms: u64,
    pub mempool_limit: usize,
    pub max_block_weight: usize,
    #[serde(default = "default_miner_attempts")]
    pub miner_attempts_per_tick: u64,
    #[serde(default)]
    pub mine_empty_blocks: bool,
    #[serde(default)]
    pub horizon: HorizonConfig,
    pub genesis: GenesisConfig,
}

fn default_miner_attempts() -> u64 {
    200_000
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
        if let Some(parent) = self.seed_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            seed_path: PathBuf::from("./keys/seed.toml"),
            block_interval_ms: 60_000,
            mempool_limit: 8_192,
            max_block_weight: 1 << 20,
            miner_attempts_per_tick: default_miner_attempts(),
            mine_empty_blocks: false,
            horizon: HorizonConfig::default(),
            genesis: GenesisConfig::default(),
        }
    }
}

/// Pruning depths, both measured from the current tip. Zero disables the
/// horizon and storage grows monotonically.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct HorizonConfig {
    #[serde(default)]
    pub branching: u64,
    #[serde(default)]
    pub schwarzschild: u64,
}

/// Chain-defining constants. Two nodes interoperate only when these match;
/// they feed the deterministic genesis block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    pub base_bits: u32,
    pub timestamp: u64,
    #[serde(default = "default_coinbase_maturity")]
    pub coinbase_maturity: u64,
}

fn default_coinbase_maturity() -> u64 {
    crate::consensus::COINBASE_MATURITY
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: "veil-local".to_string(),
            base_bits: 12,
            timestamp: 1_700_000_000,
            coinbase_maturity: default_coinbase_maturity(),
        }
    }
}
