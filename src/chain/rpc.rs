use std::sync::Arc;

use anyhow::{Context as _, Result};
use bitcoincore_rpc::{Auth, Client, RpcApi as _};
use serde_json::{Value, json};
use tokio::sync::OnceCell;

use super::{ChainClient, ChainType};

/// Default fee rates (sat/vbyte) when the node has no estimate yet.
const BITCOIN_FALLBACK_FEE: f64 = 2.0;
const LIQUID_FALLBACK_FEE: f64 = 0.1;

/// Confirmation target for `estimatesmartfee`.
const FEE_CONFIRMATION_TARGET: u16 = 2;

/// JSON-RPC client for bitcoind and elementsd.
#[derive(Clone)]
pub struct RpcChainClient {
    client: Arc<Client>,
    chain: ChainType,
    genesis_hash: Arc<OnceCell<String>>,
}

impl RpcChainClient {
    pub fn new(url: &str, user: String, password: String, chain: ChainType) -> Result<Self> {
        let client = Client::new(url, Auth::UserPass(user, password))
            .with_context(|| format!("create {chain} rpc client for {url}"))?;
        Ok(Self {
            client: Arc::new(client),
            chain,
            genesis_hash: Arc::new(OnceCell::new()),
        })
    }

    async fn call<T>(&self, method: &'static str, params: Vec<Value>) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || client.call::<T>(method, &params))
            .await
            .with_context(|| format!("join {method}"))?
            .with_context(|| format!("rpc {method}"))
    }
}

#[async_trait::async_trait]
impl ChainClient for RpcChainClient {
    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>> {
        let tx_hex: String = self
            .call("getrawtransaction", vec![json!(txid)])
            .await?;
        hex::decode(tx_hex).context("decode raw transaction hex")
    }

    async fn estimate_fee(&self) -> Result<f64> {
        let fallback = match self.chain {
            ChainType::Bitcoin => BITCOIN_FALLBACK_FEE,
            ChainType::Liquid => LIQUID_FALLBACK_FEE,
        };

        let estimate: Value = self
            .call("estimatesmartfee", vec![json!(FEE_CONFIRMATION_TARGET)])
            .await?;

        // BTC per kvB to sat per vB
        match estimate.get("feerate").and_then(Value::as_f64) {
            Some(btc_per_kvb) => Ok((btc_per_kvb * 100_000.0).max(fallback)),
            None => {
                tracing::debug!(chain = %self.chain, fallback, "no fee estimate, using fallback");
                Ok(fallback)
            }
        }
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String> {
        self.call("sendrawtransaction", vec![json!(tx_hex)]).await
    }

    async fn block_height(&self) -> Result<u32> {
        let info: Value = self.call("getblockchaininfo", vec![]).await?;
        let blocks = info
            .get("blocks")
            .and_then(Value::as_u64)
            .context("getblockchaininfo without blocks")?;
        u32::try_from(blocks).context("block height out of range")
    }

    async fn genesis_hash(&self) -> Result<String> {
        self.genesis_hash
            .get_or_try_init(|| async { self.call("getblockhash", vec![json!(0)]).await })
            .await
            .cloned()
    }
}
