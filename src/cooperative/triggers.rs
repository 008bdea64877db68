use anyhow::{Context as _, Result};

use super::pending::PendingClaims;
use crate::chain::Currency;
use crate::swap::AnySwap;

/// Decides whether deferring `swap` should sweep its symbol right away.
#[async_trait::async_trait]
pub trait SweepTrigger: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(
        &self,
        currency: &Currency,
        swap: &AnySwap,
        pending: &PendingClaims,
    ) -> Result<bool>;
}

/// Fires when the swap's timeout is within `tolerance_minutes` of the chain tip.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryTrigger {
    pub tolerance_minutes: u64,
}

#[async_trait::async_trait]
impl SweepTrigger for ExpiryTrigger {
    fn name(&self) -> &'static str {
        "expiry"
    }

    async fn check(
        &self,
        currency: &Currency,
        swap: &AnySwap,
        _pending: &PendingClaims,
    ) -> Result<bool> {
        let height = currency
            .chain_client
            .block_height()
            .await
            .with_context(|| format!("get {} block height", currency.symbol))?;

        let blocks_left = u64::from(swap.timeout_block_height().saturating_sub(height));
        let minutes_left = blocks_left * currency.chain_type.block_time_minutes();
        Ok(minutes_left <= self.tolerance_minutes)
    }
}

/// Fires once the queued on-chain amount of the symbol reaches `threshold` sats.
#[derive(Debug, Clone, Copy)]
pub struct AmountTrigger {
    pub threshold: u64,
}

#[async_trait::async_trait]
impl SweepTrigger for AmountTrigger {
    fn name(&self) -> &'static str {
        "amount"
    }

    async fn check(
        &self,
        currency: &Currency,
        _swap: &AnySwap,
        pending: &PendingClaims,
    ) -> Result<bool> {
        Ok(pending.pending_amount(&currency.symbol) >= self.threshold)
    }
}
