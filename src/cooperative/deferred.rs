use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use bitcoin::hashes::{Hash as _, sha256};
use tokio::sync::mpsc;

use super::eligibility::{check_claim, check_preimage};
use super::musig::{MusigSession, aggregate_internal_key, parse_partial_signature, parse_pub_nonce};
use super::pending::{CooperativeDetails, PendingClaims, PendingValue, SwapToClaim};
use super::sighash_genesis;
use super::triggers::{AmountTrigger, ExpiryTrigger, SweepTrigger};
use crate::chain::claim::{ClaimDetails, construct_claim_transaction, find_swap_output};
use crate::chain::transaction::{PrevOut, SwapTransaction};
use crate::chain::{Currencies, Currency};
use crate::config::SettlementConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::lightning::PaymentState;
use crate::swap::store::SqliteSwapStore;
use crate::swap::{AnySwap, ChannelCreation, SwapKind, SwapStatus, SwapVersion, parse_hash32};

/// Emitted once per swap whose claim made it on-chain.
#[derive(Debug, Clone)]
pub struct ClaimEvent {
    pub swap: AnySwap,
    pub transaction_id: String,
    /// Share of the claim transaction fee paid by this swap.
    pub fee: u64,
    pub channel_creation: Option<ChannelCreation>,
}

/// What the counterparty needs to co-sign our key-path claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooperativeClaim {
    pub preimage: [u8; 32],
    pub pub_nonce: Vec<u8>,
    pub public_key: Vec<u8>,
    pub transaction_hash: [u8; 32],
}

/// Queues claims of configured symbols and settles them in batches.
///
/// Every sweep and cooperative broadcast runs under one batch claim lock, for
/// all symbols together, so at most one claim transaction is in flight.
pub struct DeferredClaimer {
    config: SettlementConfig,
    currencies: Currencies,
    store: Arc<Mutex<SqliteSwapStore>>,
    pending: PendingClaims,
    batch_claim_lock: Arc<tokio::sync::Mutex<()>>,
    triggers: Vec<Box<dyn SweepTrigger>>,
    events: mpsc::Sender<ClaimEvent>,
}

impl DeferredClaimer {
    pub fn new(
        config: SettlementConfig,
        currencies: Currencies,
        store: Arc<Mutex<SqliteSwapStore>>,
        events: mpsc::Sender<ClaimEvent>,
    ) -> Self {
        let symbols: Vec<String> = config
            .deferred_claim_symbols
            .iter()
            .filter(|symbol| {
                let known = currencies.get(symbol).is_ok();
                if !known {
                    tracing::warn!(symbol = %symbol, "not deferring claims of unknown currency");
                }
                known
            })
            .cloned()
            .collect();

        let mut triggers: Vec<Box<dyn SweepTrigger>> = vec![Box::new(ExpiryTrigger {
            tolerance_minutes: config.expiry_tolerance_minutes,
        })];
        if let Some(threshold) = config.sweep_amount_trigger {
            triggers.push(Box::new(AmountTrigger { threshold }));
        }

        Self {
            pending: PendingClaims::new(symbols),
            config,
            currencies,
            store,
            batch_claim_lock: Arc::new(tokio::sync::Mutex::new(())),
            triggers,
            events,
        }
    }

    pub fn with_triggers(mut self, triggers: Vec<Box<dyn SweepTrigger>>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Lock shared with anything that settles claims outside of sweeps.
    pub fn batch_claim_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.batch_claim_lock.clone()
    }

    pub fn pending(&self) -> &PendingClaims {
        &self.pending
    }

    pub fn pending_sweeps(&self) -> BTreeMap<String, BTreeMap<SwapKind, Vec<String>>> {
        self.pending.pending_sweeps()
    }

    pub fn pending_sweeps_values(&self) -> BTreeMap<String, Vec<PendingValue>> {
        self.pending.pending_values()
    }

    /// Rebuilds the queues from swaps persisted as claim pending and sweeps them.
    pub async fn init(&self) -> SettlementResult<BTreeMap<String, Vec<String>>> {
        let swaps = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .list_claim_pending()?;

        for swap in swaps {
            let swap_id = swap.id().to_string();
            if !self.pending.is_deferred(swap.chain_symbol()) {
                tracing::warn!(
                    swap_id = %swap_id,
                    symbol = swap.chain_symbol(),
                    "claim pending swap on a symbol that does not defer claims"
                );
                continue;
            }

            match self.resolve_preimage(&swap).await {
                Some(preimage) => {
                    tracing::debug!(swap_id = %swap_id, "recovered deferred claim");
                    self.pending.insert(SwapToClaim::new(swap, preimage));
                }
                None => {
                    tracing::warn!(swap_id = %swap_id, "could not resolve preimage, dropping deferred claim");
                }
            }
        }

        Ok(self.sweep().await)
    }

    async fn resolve_preimage(&self, swap: &AnySwap) -> Option<[u8; 32]> {
        let preimage_hash = parse_hash32(swap.preimage_hash()).ok()?;

        let (lightning_symbol, invoice) = match swap {
            AnySwap::Chain(_) => {
                let preimage = hex::decode(swap.preimage()?).ok()?;
                return check_preimage(swap.preimage_hash(), &preimage).ok();
            }
            AnySwap::Submarine(s) => (s.lightning_symbol.as_str(), s.invoice.as_deref()),
        };

        for client in self.currencies.lightning_clients(lightning_symbol) {
            match client.payment_state(&preimage_hash, invoice).await {
                Ok(PaymentState::Succeeded { preimage })
                    if sha256::Hash::hash(&preimage).to_byte_array() == preimage_hash =>
                {
                    return Some(preimage);
                }
                Ok(state) => {
                    tracing::debug!(swap_id = swap.id(), client = client.name(), ?state, "no preimage from lightning client");
                }
                Err(err) => {
                    tracing::debug!(swap_id = swap.id(), client = client.name(), error = %err, "payment lookup failed");
                }
            }
        }
        None
    }

    /// Queues the claim of `swap` if its symbol batches claims.
    ///
    /// Returns false, and changes nothing, when the claim should be done
    /// right away instead. A preimage not matching the swap is rejected.
    pub async fn defer_claim(&self, swap: AnySwap, preimage: &[u8]) -> SettlementResult<bool> {
        let swap_id = swap.id().to_string();
        let symbol = swap.chain_symbol().to_string();

        if !self.pending.is_deferred(&symbol) {
            tracing::debug!(swap_id = %swap_id, symbol = %symbol, "not deferring claim: symbol does not batch");
            return Ok(false);
        }
        if swap.version() != SwapVersion::Taproot {
            tracing::debug!(swap_id = %swap_id, symbol = %symbol, "not deferring claim: swap is not Taproot");
            return Ok(false);
        }
        let preimage = check_preimage(swap.preimage_hash(), preimage)?;

        {
            let mut store = self.store.lock().expect("store mutex poisoned");
            let status = store
                .get_swap(&swap_id)?
                .ok_or_else(|| SettlementError::SwapNotFound(swap_id.clone()))?
                .status();
            if status == SwapStatus::TransactionClaimed || status.is_failed() {
                tracing::warn!(swap_id = %swap_id, %status, "not deferring claim of settled swap");
                return Err(SettlementError::NotEligibleForCooperativeClaim);
            }
            store.set_claim_pending(&swap_id, &hex::encode(preimage))?;
        }

        let mut swap = swap;
        swap.set_status(SwapStatus::TransactionClaimPending);
        self.pending.insert(SwapToClaim::new(swap.clone(), preimage));
        tracing::info!(swap_id = %swap_id, symbol = %symbol, "deferred claim");

        if self.should_sweep(&symbol, &swap).await? {
            tracing::info!(swap_id = %swap_id, symbol = %symbol, "sweeping deferred claims right away");
            self.sweep_symbol(&symbol).await?;
        }

        Ok(true)
    }

    async fn should_sweep(&self, symbol: &str, swap: &AnySwap) -> SettlementResult<bool> {
        let currency = self.currencies.get(symbol)?;
        for trigger in &self.triggers {
            match trigger.check(currency, swap, &self.pending).await {
                Ok(true) => {
                    tracing::debug!(swap_id = swap.id(), trigger = trigger.name(), "sweep triggered");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(trigger = trigger.name(), error = %err, "sweep trigger check failed");
                }
            }
        }
        Ok(false)
    }

    /// Sweeps every deferring symbol. A failing symbol is logged and stays
    /// queued; the others are still swept.
    pub async fn sweep(&self) -> BTreeMap<String, Vec<String>> {
        let mut claimed = BTreeMap::new();
        for symbol in self.pending.symbols() {
            match self.sweep_symbol(&symbol).await {
                Ok(ids) if ids.is_empty() => {}
                Ok(ids) => {
                    claimed.insert(symbol, ids);
                }
                Err(err) => {
                    tracing::error!(symbol = %symbol, error = %err, "sweep failed");
                }
            }
        }
        claimed
    }

    /// Claims everything queued for `symbol` and returns the claimed swap ids.
    ///
    /// Chunks that fail are put back into the queue. The error of the last
    /// failed chunk is returned only if no chunk made it on-chain.
    pub async fn sweep_symbol(&self, symbol: &str) -> SettlementResult<Vec<String>> {
        let currency = self.currencies.get(symbol)?.clone();
        let _batch_guard = self.batch_claim_lock.lock().await;

        let mut remaining = self.pending.drain(symbol);
        if remaining.is_empty() {
            tracing::trace!(symbol = %symbol, "nothing to sweep");
            return Ok(Vec::new());
        }

        let chunk_size = self
            .config
            .max_batch_claim_chunk(symbol, currency.chain_type);
        tracing::info!(symbol = %symbol, count = remaining.len(), chunk_size, "sweeping deferred claims");

        let mut claimed = Vec::new();
        let mut last_err = None;

        while !remaining.is_empty() {
            let rest = remaining.split_off(chunk_size.min(remaining.len()));
            let chunk = std::mem::replace(&mut remaining, rest);

            match self.broadcast_batch(&currency, &chunk).await {
                Ok((transaction_id, fee)) => {
                    let share = fee.div_ceil(chunk.len() as u64);
                    tracing::info!(
                        symbol = %symbol,
                        txid = %transaction_id,
                        fee,
                        swaps = chunk.len(),
                        "broadcast batch claim"
                    );
                    for entry in chunk {
                        claimed.push(entry.swap.id().to_string());
                        self.settle(entry.swap, &transaction_id, share).await;
                    }
                }
                Err(err) => {
                    tracing::error!(symbol = %symbol, swaps = chunk.len(), error = %err, "batch claim failed");
                    self.pending.reinsert(chunk);
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(err) if claimed.is_empty() => Err(err),
            _ => Ok(claimed),
        }
    }

    async fn broadcast_batch(
        &self,
        currency: &Currency,
        chunk: &[SwapToClaim],
    ) -> SettlementResult<(String, u64)> {
        let mut details = Vec::with_capacity(chunk.len());
        for entry in chunk {
            details.push(self.claim_details(currency, entry, false).await?);
        }

        let tx = build_claim(currency, &details, "deferred claim sweep").await?;
        let fee = claim_fee(&details, &tx)?;

        currency
            .chain_client
            .send_raw_transaction(&tx.to_hex())
            .await
            .with_context(|| format!("broadcast {} claim", currency.symbol))?;

        Ok((tx.txid(), fee))
    }

    async fn claim_details(
        &self,
        currency: &Currency,
        entry: &SwapToClaim,
        cooperative: bool,
    ) -> anyhow::Result<ClaimDetails> {
        let swap_id = entry.swap.id();
        let leg = entry.swap.claim_leg();
        let tree = leg.swap_tree()?;
        let keys = currency.wallet.derive_keys(leg.key_index)?;
        let internal_key = aggregate_internal_key(keys.public_key(), leg.their_public_key()?)?;

        let lockup_id = leg.lockup_transaction_id()?;
        let raw = currency
            .chain_client
            .get_raw_transaction(lockup_id)
            .await
            .with_context(|| format!("fetch lockup of {swap_id}"))?;
        let lockup = SwapTransaction::parse(currency.chain_type, &raw)
            .with_context(|| format!("parse lockup of {swap_id}"))?;
        let (vout, prevout) = find_swap_output(&lockup, &tree, internal_key)
            .with_context(|| format!("find lockup output of {swap_id}"))?;

        Ok(ClaimDetails {
            txid: lockup.txid(),
            vout,
            prevout,
            tree,
            internal_key,
            keys,
            preimage: entry.preimage,
            cooperative,
        })
    }

    async fn settle(&self, mut swap: AnySwap, transaction_id: &str, fee: u64) {
        let swap_id = swap.id().to_string();
        let persisted = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .set_claimed(&swap_id, fee);
        if let Err(err) = persisted {
            tracing::error!(swap_id = %swap_id, txid = transaction_id, error = %err, "persist claim failed");
        }

        swap.set_status(SwapStatus::TransactionClaimed);
        swap.set_miner_fee(fee);
        let channel_creation = swap.channel_creation().cloned();

        let event = ClaimEvent {
            swap,
            transaction_id: transaction_id.to_string(),
            fee,
            channel_creation,
        };
        if self.events.send(event).await.is_err() {
            tracing::debug!(swap_id = %swap_id, "claim event receiver dropped");
        }
    }

    fn queued_swap(&self, swap_id: &str) -> SettlementResult<(String, SwapKind)> {
        let record = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_swap(swap_id)?
            .ok_or_else(|| SettlementError::SwapNotFound(swap_id.to_string()))?;
        let swap = record
            .into_claimable()
            .ok_or(SettlementError::NotEligibleForCooperativeClaim)?;
        Ok((swap.chain_symbol().to_string(), swap.kind()))
    }

    /// Prepares a key-path claim of a queued swap for the counterparty to co-sign.
    ///
    /// The sweep address and transaction are built on the first request and
    /// reused afterwards; every request gets a new nonce.
    pub async fn get_cooperative_details(
        &self,
        swap_id: &str,
    ) -> SettlementResult<CooperativeClaim> {
        let (symbol, kind) = self.queued_swap(swap_id)?;
        let entry = self
            .pending
            .get(&symbol, kind, swap_id)
            .ok_or(SettlementError::NotEligibleForCooperativeClaim)?;
        if entry.swap.batch_only() {
            return Err(SettlementError::NotEligibleForCooperativeClaim);
        }
        check_claim(
            entry.swap.version(),
            entry.swap.status(),
            &[SwapStatus::TransactionClaimPending],
        )?;

        let currency = self.currencies.get(&symbol)?.clone();
        let leg = entry.swap.claim_leg();
        let keys = currency.wallet.derive_keys(leg.key_index)?;
        let mut musig = MusigSession::new(keys, leg.their_public_key()?)?;
        musig.tweak(&leg.swap_tree()?)?;

        let (sweep_address, transaction) = match &entry.cooperative {
            Some(existing) => (existing.sweep_address.clone(), existing.transaction.clone()),
            None => {
                let details = self.claim_details(&currency, &entry, true).await?;
                let sweep_address = currency
                    .wallet
                    .new_address("cooperative claim sweep")
                    .await?;
                let transaction =
                    build_claim_to(&currency, &[details], &sweep_address).await?;
                (sweep_address, transaction)
            }
        };

        let stored = self
            .pending
            .set_cooperative(
                &symbol,
                kind,
                swap_id,
                CooperativeDetails {
                    musig,
                    sweep_address,
                    transaction,
                },
            )
            .ok_or(SettlementError::NotEligibleForCooperativeClaim)?;

        let prevouts = stored
            .transaction
            .previous_outputs(currency.chain_client.as_ref())
            .await?;
        let genesis = sighash_genesis(&currency).await?;
        let transaction_hash = stored
            .transaction
            .key_spend_sighash(0, &prevouts, genesis.as_deref())?;

        tracing::debug!(swap_id = %swap_id, sweep_address = %stored.sweep_address, "created cooperative claim details");
        Ok(CooperativeClaim {
            preimage: entry.preimage,
            pub_nonce: stored.musig.public_nonce().serialize().to_vec(),
            public_key: stored.musig.our_public_key().serialize().to_vec(),
            transaction_hash,
        })
    }

    /// Completes a cooperative claim with the counterparty's partial signature
    /// and broadcasts it. Returns the claim transaction id.
    pub async fn broadcast_cooperative(
        &self,
        swap_id: &str,
        their_nonce: &[u8],
        their_partial_signature: &[u8],
    ) -> SettlementResult<String> {
        let their_nonce = parse_pub_nonce(their_nonce)?;
        let their_signature = parse_partial_signature(their_partial_signature)?;
        let (symbol, kind) = self.queued_swap(swap_id)?;
        let currency = self.currencies.get(&symbol)?.clone();

        let _batch_guard = self.batch_claim_lock.lock().await;

        let details = self
            .pending
            .get(&symbol, kind, swap_id)
            .and_then(|entry| entry.cooperative)
            .ok_or(SettlementError::NotEligibleForCooperativeClaimBroadcast)?;
        if details.musig.nonce_used() {
            return Err(SettlementError::NotEligibleForCooperativeClaimBroadcast);
        }

        let prevouts = details
            .transaction
            .previous_outputs(currency.chain_client.as_ref())
            .await?;
        let genesis = sighash_genesis(&currency).await?;
        let sighash = details
            .transaction
            .key_spend_sighash(0, &prevouts, genesis.as_deref())?;

        let mut musig = details.musig.clone();
        musig.aggregate_nonces(their_nonce)?;
        musig.initialize_session(sighash)?;
        if !musig.verify_partial(their_signature) {
            tracing::warn!(swap_id = %swap_id, "invalid partial signature for cooperative claim");
            return Err(SettlementError::InvalidPartialSignature);
        }

        let ours = musig.sign_partial();
        self.pending
            .discard_nonce(&symbol, kind, swap_id, musig.public_nonce());
        let signature = musig.aggregate_partials(ours?, their_signature)?;

        let mut transaction = details.transaction;
        transaction.set_key_spend_signature(0, &signature.serialize())?;
        let fee = transaction_fee(&prevouts, &transaction)?;

        currency
            .chain_client
            .send_raw_transaction(&transaction.to_hex())
            .await
            .with_context(|| format!("broadcast cooperative claim of {swap_id}"))?;

        let transaction_id = transaction.txid();
        tracing::info!(swap_id = %swap_id, txid = %transaction_id, fee, "broadcast cooperative claim");

        if let Some(entry) = self.pending.remove(&symbol, kind, swap_id) {
            self.settle(entry.swap, &transaction_id, fee).await;
        }
        Ok(transaction_id)
    }
}

async fn build_claim(
    currency: &Currency,
    details: &[ClaimDetails],
    label: &str,
) -> anyhow::Result<SwapTransaction> {
    let destination = currency.wallet.new_address(label).await?;
    build_claim_to(currency, details, &destination).await
}

async fn build_claim_to(
    currency: &Currency,
    details: &[ClaimDetails],
    destination: &str,
) -> anyhow::Result<SwapTransaction> {
    let fee_rate = currency
        .chain_client
        .estimate_fee()
        .await
        .with_context(|| format!("estimate {} fee", currency.symbol))?;
    let genesis = sighash_genesis(currency).await?;
    construct_claim_transaction(details, destination, fee_rate, genesis.as_deref())
}

fn claim_fee(details: &[ClaimDetails], tx: &SwapTransaction) -> anyhow::Result<u64> {
    let prevouts: Vec<PrevOut> = details.iter().map(|d| d.prevout.clone()).collect();
    transaction_fee(&prevouts, tx)
}

/// Inputs minus the destination output, the first output of a claim.
fn transaction_fee(prevouts: &[PrevOut], tx: &SwapTransaction) -> anyhow::Result<u64> {
    let inputs = prevouts
        .iter()
        .map(|p| p.explicit_value().context("confidential claim input"))
        .sum::<anyhow::Result<u64>>()?;
    let output = tx
        .output(0)
        .and_then(|o| o.explicit_value())
        .context("claim transaction without explicit output")?;
    inputs
        .checked_sub(output)
        .context("claim output exceeds its inputs")
}
