pub mod claim;
pub mod rpc;
pub mod transaction;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::SettlementError;
use crate::lightning::LightningClient;
use crate::wallet::Wallet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Bitcoin,
    Liquid,
}

impl ChainType {
    pub fn block_time_minutes(self) -> u64 {
        match self {
            ChainType::Bitcoin => 10,
            ChainType::Liquid => 1,
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainType::Bitcoin => f.write_str("bitcoin"),
            ChainType::Liquid => f.write_str("liquid"),
        }
    }
}

impl FromStr for ChainType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoin" | "btc" => Ok(ChainType::Bitcoin),
            "liquid" | "elements" => Ok(ChainType::Liquid),
            other => anyhow::bail!("unknown chain type: {other}"),
        }
    }
}

#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>>;

    /// Fee estimate in sat/vbyte.
    async fn estimate_fee(&self) -> Result<f64>;

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String>;

    async fn block_height(&self) -> Result<u32>;

    /// Display-hex hash of block 0, needed by the Elements sighash.
    async fn genesis_hash(&self) -> Result<String>;
}

/// Everything the engine needs to settle on one chain.
pub struct Currency {
    pub symbol: String,
    pub chain_type: ChainType,
    pub chain_client: Arc<dyn ChainClient>,
    pub wallet: Arc<dyn Wallet>,
    pub lightning_clients: Vec<Arc<dyn LightningClient>>,
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Currency")
            .field("symbol", &self.symbol)
            .field("chain_type", &self.chain_type)
            .field("lightning_clients", &self.lightning_clients.len())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Currencies {
    by_symbol: HashMap<String, Arc<Currency>>,
}

impl Currencies {
    pub fn new(currencies: impl IntoIterator<Item = Currency>) -> Self {
        Self {
            by_symbol: currencies
                .into_iter()
                .map(|c| (c.symbol.clone(), Arc::new(c)))
                .collect(),
        }
    }

    pub fn get(&self, symbol: &str) -> Result<&Arc<Currency>, SettlementError> {
        self.by_symbol
            .get(symbol)
            .ok_or_else(|| SettlementError::CurrencyNotFound(symbol.to_string()))
    }

    /// Lightning clients of `symbol`, empty for chains without Lightning.
    pub fn lightning_clients(&self, symbol: &str) -> &[Arc<dyn LightningClient>] {
        self.by_symbol
            .get(symbol)
            .map(|c| c.lightning_clients.as_slice())
            .unwrap_or_default()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.by_symbol.keys().map(String::as_str)
    }
}
