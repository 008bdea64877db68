use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chain::ChainType;

pub const DEFAULT_BATCH_CLAIM_INTERVAL_SECS: u64 = 600;
pub const DEFAULT_EXPIRY_TOLERANCE_MINUTES: u64 = 120;
pub const DEFAULT_MAX_BATCH_CLAIM_CHUNK: usize = 100;
pub const LIQUID_MAX_BATCH_CLAIM_CHUNK: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Symbols whose claims are queued and swept in batches.
    pub deferred_claim_symbols: Vec<String>,
    pub batch_claim_interval_secs: u64,
    /// A queued claim this close to its timeout forces a sweep.
    pub expiry_tolerance_minutes: u64,
    /// Sweep a symbol once its queued on-chain amount reaches this many sats.
    pub sweep_amount_trigger: Option<u64>,
    pub max_batch_claim_chunk: BTreeMap<String, usize>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            deferred_claim_symbols: Vec::new(),
            batch_claim_interval_secs: DEFAULT_BATCH_CLAIM_INTERVAL_SECS,
            expiry_tolerance_minutes: DEFAULT_EXPIRY_TOLERANCE_MINUTES,
            sweep_amount_trigger: None,
            max_batch_claim_chunk: BTreeMap::new(),
        }
    }
}

impl SettlementConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.batch_claim_interval_secs > 0,
            "batch_claim_interval_secs must be at least 1"
        );
        let zero_chunk = self.max_batch_claim_chunk.iter().find(|(_, chunk)| **chunk == 0);
        if let Some((symbol, _)) = zero_chunk {
            anyhow::bail!("max_batch_claim_chunk of {symbol} must be at least 1");
        }
        Ok(())
    }

    pub fn batch_claim_interval(&self) -> Duration {
        Duration::from_secs(self.batch_claim_interval_secs)
    }

    pub fn max_batch_claim_chunk(&self, symbol: &str, chain: ChainType) -> usize {
        if let Some(chunk) = self.max_batch_claim_chunk.get(symbol) {
            return (*chunk).max(1);
        }

        match chain {
            ChainType::Bitcoin => DEFAULT_MAX_BATCH_CLAIM_CHUNK,
            ChainType::Liquid => LIQUID_MAX_BATCH_CLAIM_CHUNK,
        }
    }
}
