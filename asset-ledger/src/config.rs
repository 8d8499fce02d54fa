//! Configuration for the asset ledger

use crate::permissions::PermissionTable;
use crate::types::{BenefitId, TokenAmount};
use crate::{Error, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Conversion rates
    pub tokenomics: TokenomicsConfig,

    /// Chain collaborator settings
    pub chain: ChainConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Redeemable benefits
    pub benefits: Vec<BenefitConfig>,

    /// Role → permission override (built-in table when absent)
    #[serde(default)]
    pub permissions: Option<PermissionTable>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/asset-ledger"),
            service_name: "asset-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            tokenomics: TokenomicsConfig::default(),
            chain: ChainConfig::default(),
            rocksdb: RocksDBConfig::default(),
            benefits: BenefitConfig::default_catalog(),
            permissions: None,
        }
    }
}

/// Fixed, auditable conversion rates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenomicsConfig {
    /// AT minted per unit of verified deposit value
    pub at_per_value_unit: Decimal,

    /// HT minted per unit of trade profit
    pub ht_per_profit_unit: Decimal,
}

impl Default for TokenomicsConfig {
    fn default() -> Self {
        Self {
            at_per_value_unit: Decimal::ONE,
            ht_per_profit_unit: Decimal::ONE,
        }
    }
}

impl TokenomicsConfig {
    /// AT for a deposit value, floored to whole tokens
    pub fn at_for_value(&self, value: Decimal) -> Result<TokenAmount> {
        Self::convert(value, self.at_per_value_unit)
    }

    /// HT pool for a trade profit, floored to whole tokens
    pub fn ht_for_profit(&self, profit: Decimal) -> Result<TokenAmount> {
        Self::convert(profit, self.ht_per_profit_unit)
    }

    fn convert(amount: Decimal, rate: Decimal) -> Result<TokenAmount> {
        if amount <= Decimal::ZERO {
            return Ok(0);
        }
        amount
            .checked_mul(rate)
            .and_then(|tokens| tokens.floor().to_u64())
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} at rate {} overflows token range", amount, rate))
            })
    }
}

/// Chain collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Upper bound on a single chain call (milliseconds)
    pub call_timeout_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
        }
    }
}

impl ChainConfig {
    /// Call timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Fsync every commit
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 2,
            sync_writes: true,
        }
    }
}

/// Benefit catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenefitConfig {
    /// Benefit id
    pub id: BenefitId,

    /// Human description
    pub description: String,

    /// Minimum HT spent to redeem
    pub min_ht_cost: TokenAmount,
}

impl BenefitConfig {
    /// Built-in catalog
    pub fn default_catalog() -> Vec<Self> {
        [
            ("CHECKUP", "Regular Health Checkup", 10),
            ("MEDICINE", "Medicine Discount (20%)", 5),
            ("INSURANCE", "Health Insurance Coverage", 50),
            ("SPECIALIST", "Specialist Consultation", 25),
            ("DIAGNOSTIC", "Diagnostic Tests Package", 30),
        ]
        .into_iter()
        .map(|(id, description, min_ht_cost)| Self {
            id: BenefitId::new(id),
            description: description.to_string(),
            min_ht_cost,
        })
        .collect()
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("ASSET_LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(timeout) = std::env::var("ASSET_LEDGER_CHAIN_TIMEOUT_MS") {
            config.chain.call_timeout_ms = timeout
                .parse()
                .map_err(|e| Error::Config(format!("ASSET_LEDGER_CHAIN_TIMEOUT_MS: {}", e)))?;
        }

        if let Ok(rate) = std::env::var("ASSET_LEDGER_AT_RATE") {
            config.tokenomics.at_per_value_unit = rate
                .parse()
                .map_err(|e| Error::Config(format!("ASSET_LEDGER_AT_RATE: {}", e)))?;
        }

        if let Ok(rate) = std::env::var("ASSET_LEDGER_HT_RATE") {
            config.tokenomics.ht_per_profit_unit = rate
                .parse()
                .map_err(|e| Error::Config(format!("ASSET_LEDGER_HT_RATE: {}", e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tokenomics.at_per_value_unit <= Decimal::ZERO {
            return Err(Error::Config("at_per_value_unit must be positive".to_string()));
        }
        if self.tokenomics.ht_per_profit_unit <= Decimal::ZERO {
            return Err(Error::Config("ht_per_profit_unit must be positive".to_string()));
        }
        if self.chain.call_timeout_ms == 0 {
            return Err(Error::Config("chain.call_timeout_ms must be non-zero".to_string()));
        }
        if self.benefits.is_empty() {
            return Err(Error::Config("benefit catalog is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for benefit in &self.benefits {
            if !seen.insert(&benefit.id) {
                return Err(Error::Config(format!("duplicate benefit {}", benefit.id)));
            }
            if benefit.min_ht_cost == 0 {
                return Err(Error::Config(format!("benefit {} has zero cost", benefit.id)));
            }
        }

        Ok(())
    }

    /// Look up a catalogued benefit
    pub fn benefit(&self, id: &BenefitId) -> Option<&BenefitConfig> {
        self.benefits.iter().find(|b| &b.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "asset-ledger");
        assert_eq!(config.benefits.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conversions_floor() {
        let rates = TokenomicsConfig {
            at_per_value_unit: dec!(1),
            ht_per_profit_unit: dec!(0.75),
        };
        assert_eq!(rates.at_for_value(dec!(10000)).unwrap(), 10_000);
        assert_eq!(rates.at_for_value(dec!(99.99)).unwrap(), 99);
        assert_eq!(rates.ht_for_profit(dec!(1001)).unwrap(), 750);
        assert_eq!(rates.ht_for_profit(dec!(-500)).unwrap(), 0);
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.tokenomics.ht_per_profit_unit = Decimal::ZERO;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.benefits.push(config.benefits[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let text = toml::to_string(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.tokenomics.at_per_value_unit, Decimal::ONE);
        assert_eq!(parsed.chain.call_timeout_ms, 5_000);
        assert!(parsed.permissions.is_none());
    }
}
