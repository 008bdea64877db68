//! MuSig2 cooperative signing and deferred batch claiming.

pub mod deferred;
pub mod eligibility;
pub mod musig;
pub mod pending;
pub mod schedule;
pub mod signer;
pub mod triggers;

use anyhow::{Context as _, Result};

use crate::chain::transaction::SwapTransaction;
use crate::chain::{ChainType, Currency};

/// Genesis hash the Elements sighash commits to; `None` on Bitcoin.
pub(crate) async fn sighash_genesis(currency: &Currency) -> Result<Option<String>> {
    match currency.chain_type {
        ChainType::Bitcoin => Ok(None),
        ChainType::Liquid => currency
            .chain_client
            .genesis_hash()
            .await
            .with_context(|| format!("get {} genesis hash", currency.symbol))
            .map(Some),
    }
}

/// Key-path sighash of input `vin`, fetching the spent outputs from the chain.
pub(crate) async fn key_spend_sighash(
    currency: &Currency,
    tx: &SwapTransaction,
    vin: usize,
) -> Result<[u8; 32]> {
    let prevouts = tx
        .previous_outputs(currency.chain_client.as_ref())
        .await
        .context("resolve previous outputs")?;
    let genesis = sighash_genesis(currency).await?;
    tx.key_spend_sighash(vin, &prevouts, genesis.as_deref())
}
