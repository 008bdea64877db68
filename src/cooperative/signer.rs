use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use bitcoin::secp256k1::PublicKey;

use super::eligibility::{
    CHAIN_CLAIM_STATUSES, REVERSE_CLAIM_STATUSES, check_claim, check_preimage,
    chain_swap_refund_rejection, submarine_refund_rejection,
};
use super::key_spend_sighash;
use super::musig::{MusigSession, parse_pub_nonce};
use crate::chain::Currencies;
use crate::chain::transaction::SwapTransaction;
use crate::error::{SettlementError, SettlementResult};
use crate::swap::store::SqliteSwapStore;
use crate::swap::tree::SwapTree;
use crate::swap::{SwapStatus, parse_public_key};

/// Our half of a MuSig2 signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSignature {
    pub pub_nonce: Vec<u8>,
    pub partial_signature: Vec<u8>,
}

/// Transaction input a counterparty wants us to co-sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToSign {
    pub pub_nonce: Vec<u8>,
    pub transaction: Vec<u8>,
    pub index: u32,
}

/// Partial signatures for counterparty spends of swap outputs: cooperative
/// refunds of submarine and chain swaps, and cooperative claims of reverse
/// swaps and of the sending leg of chain swaps.
pub struct MusigSigner {
    currencies: Currencies,
    store: Arc<Mutex<SqliteSwapStore>>,
    allowed_refunds: Mutex<HashSet<String>>,
    claim_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MusigSigner {
    /// `claim_lock` must be the lock the batch claimer sweeps under.
    pub fn new(
        currencies: Currencies,
        store: Arc<Mutex<SqliteSwapStore>>,
        claim_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            currencies,
            store,
            allowed_refunds: Mutex::new(HashSet::new()),
            claim_lock,
        }
    }

    /// Lets the next refunds of `swap_id` skip the eligibility checks.
    pub fn allow_refund(&self, swap_id: &str) -> SettlementResult<()> {
        let exists = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_swap(swap_id)?
            .is_some();
        if !exists {
            return Err(SettlementError::SwapNotFound(swap_id.to_string()));
        }

        tracing::info!(swap_id = %swap_id, "allowing cooperative refund");
        self.allowed_refunds
            .lock()
            .expect("allowed refunds mutex poisoned")
            .insert(swap_id.to_string());
        Ok(())
    }

    fn is_refund_allowed(&self, swap_id: &str) -> bool {
        self.allowed_refunds
            .lock()
            .expect("allowed refunds mutex poisoned")
            .contains(swap_id)
    }

    pub async fn sign_swap_refund(
        &self,
        swap_id: &str,
        their_nonce: &[u8],
        raw_transaction: &[u8],
        vin: u32,
    ) -> SettlementResult<PartialSignature> {
        let swap = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_submarine_swap(swap_id)?
            .ok_or_else(|| SettlementError::SwapNotFound(swap_id.to_string()))?;

        let lightning_clients = self.currencies.lightning_clients(&swap.lightning_symbol);
        if let Some(reason) = submarine_refund_rejection(&swap, lightning_clients).await {
            if !self.is_refund_allowed(swap_id) {
                tracing::debug!(swap_id = %swap_id, %reason, "rejected cooperative refund");
                return Err(SettlementError::NotEligibleForCooperativeRefund(reason));
            }
            tracing::info!(swap_id = %swap_id, %reason, "signing refund of explicitly allowed swap");
        }

        let tree = swap_tree(swap.swap_tree.as_deref())?;
        let their_public_key = counterparty_key(swap.refund_public_key.as_deref())?;

        tracing::info!(swap_id = %swap_id, "creating partial signature for refund");
        self.create_partial_signature(
            &swap.chain_symbol,
            &tree,
            swap.key_index,
            their_public_key,
            their_nonce,
            raw_transaction,
            vin,
        )
        .await
    }

    pub async fn sign_chain_swap_refund(
        &self,
        swap_id: &str,
        their_nonce: &[u8],
        raw_transaction: &[u8],
        vin: u32,
    ) -> SettlementResult<PartialSignature> {
        let swap = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_chain_swap(swap_id)?
            .ok_or_else(|| SettlementError::SwapNotFound(swap_id.to_string()))?;

        if let Some(reason) = chain_swap_refund_rejection(&swap) {
            if !self.is_refund_allowed(swap_id) {
                tracing::debug!(swap_id = %swap_id, %reason, "rejected cooperative chain swap refund");
                return Err(SettlementError::NotEligibleForCooperativeRefund(reason));
            }
            tracing::info!(swap_id = %swap_id, %reason, "signing refund of explicitly allowed swap");
        }

        let leg = &swap.receiving;
        let tree = swap_tree(leg.swap_tree.as_deref())?;
        let their_public_key = counterparty_key(leg.their_public_key.as_deref())?;

        tracing::info!(swap_id = %swap_id, "creating partial signature for chain swap refund");
        self.create_partial_signature(
            &leg.symbol,
            &tree,
            leg.key_index,
            their_public_key,
            their_nonce,
            raw_transaction,
            vin,
        )
        .await
    }

    /// Settles the hold invoice of a reverse swap and optionally co-signs the
    /// user's claim of our lockup.
    pub async fn sign_reverse_swap_claim(
        &self,
        swap_id: &str,
        preimage: &[u8],
        to_sign: Option<ToSign>,
    ) -> SettlementResult<Option<PartialSignature>> {
        let swap = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_reverse_swap(swap_id)?
            .ok_or_else(|| SettlementError::SwapNotFound(swap_id.to_string()))?;

        check_claim(swap.version, swap.status, &REVERSE_CLAIM_STATUSES)?;
        let preimage = check_preimage(&swap.preimage_hash, preimage)?;

        self.store
            .lock()
            .expect("store mutex poisoned")
            .set_preimage(swap_id, &hex::encode(preimage))?;

        {
            let _claim_guard = self.claim_lock.lock().await;

            let status = self
                .store
                .lock()
                .expect("store mutex poisoned")
                .get_reverse_swap(swap_id)?
                .map(|s| s.status)
                .ok_or_else(|| SettlementError::SwapNotFound(swap_id.to_string()))?;

            if status != SwapStatus::InvoiceSettled {
                self.settle_hold_invoice(&swap.lightning_symbol, &preimage)
                    .await
                    .with_context(|| format!("settle hold invoice of {swap_id}"))?;
                self.store
                    .lock()
                    .expect("store mutex poisoned")
                    .update_status(swap_id, SwapStatus::InvoiceSettled)?;
                tracing::info!(swap_id = %swap_id, "settled hold invoice");
            }
        }

        let Some(to_sign) = to_sign else {
            return Ok(None);
        };

        let tree = swap_tree(swap.swap_tree.as_deref())?;
        let their_public_key = counterparty_key(swap.claim_public_key.as_deref())?;

        tracing::info!(swap_id = %swap_id, "creating partial signature for reverse swap claim");
        self.create_partial_signature(
            &swap.chain_symbol,
            &tree,
            swap.key_index,
            their_public_key,
            &to_sign.pub_nonce,
            &to_sign.transaction,
            to_sign.index,
        )
        .await
        .map(Some)
    }

    /// Co-signs the user's claim of the leg we locked in a chain swap.
    ///
    /// The preimage is checked and stored first, so our claim of the
    /// receiving leg can go ahead even when no transaction is supplied.
    pub async fn sign_chain_swap_claim(
        &self,
        swap_id: &str,
        preimage: &[u8],
        to_sign: Option<ToSign>,
    ) -> SettlementResult<Option<PartialSignature>> {
        let swap = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_chain_swap(swap_id)?
            .ok_or_else(|| SettlementError::SwapNotFound(swap_id.to_string()))?;

        check_claim(swap.version, swap.status, &CHAIN_CLAIM_STATUSES)?;
        let preimage = check_preimage(&swap.preimage_hash, preimage).inspect_err(|_| {
            tracing::warn!(
                swap_id = %swap_id,
                "not co-signing chain swap claim: preimage is incorrect"
            );
        })?;

        if swap.preimage.is_none() {
            self.store
                .lock()
                .expect("store mutex poisoned")
                .set_preimage(swap_id, &hex::encode(preimage))?;
        }

        let Some(to_sign) = to_sign else {
            return Ok(None);
        };

        let leg = &swap.sending;
        let tree = swap_tree(leg.swap_tree.as_deref())?;
        let their_public_key = counterparty_key(leg.their_public_key.as_deref())?;

        tracing::info!(swap_id = %swap_id, "creating partial signature for chain swap claim");
        self.create_partial_signature(
            &leg.symbol,
            &tree,
            leg.key_index,
            their_public_key,
            &to_sign.pub_nonce,
            &to_sign.transaction,
            to_sign.index,
        )
        .await
        .map(Some)
    }

    async fn settle_hold_invoice(&self, symbol: &str, preimage: &[u8; 32]) -> anyhow::Result<()> {
        let clients = self.currencies.lightning_clients(symbol);
        let mut last_err = None;

        for client in clients {
            match client.settle_hold_invoice(preimage).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(client = client.name(), error = %err, "settle hold invoice failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no lightning client for {symbol}")))
    }

    /// Signs input `vin` of `raw_transaction` with the key at `key_index`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_partial_signature(
        &self,
        symbol: &str,
        tree: &SwapTree,
        key_index: u32,
        their_public_key: PublicKey,
        their_nonce: &[u8],
        raw_transaction: &[u8],
        vin: u32,
    ) -> SettlementResult<PartialSignature> {
        let currency = self.currencies.get(symbol)?;

        let tx = SwapTransaction::parse(currency.chain_type, raw_transaction)
            .map_err(|e| SettlementError::InvalidTransaction(format!("{e:#}")))?;
        let inputs = tx.input_count();
        if vin as usize >= inputs {
            return Err(SettlementError::InvalidVin { vin, inputs });
        }
        let their_nonce = parse_pub_nonce(their_nonce)?;

        let keys = currency.wallet.derive_keys(key_index)?;
        let mut session = MusigSession::new(keys, their_public_key)?;
        session.tweak(tree)?;
        session.aggregate_nonces(their_nonce)?;

        let sighash = key_spend_sighash(currency, &tx, vin as usize).await?;
        session.initialize_session(sighash)?;
        let signature = session.sign_partial()?;

        Ok(PartialSignature {
            pub_nonce: session.public_nonce().serialize().to_vec(),
            partial_signature: signature.serialize().to_vec(),
        })
    }
}

fn swap_tree(json: Option<&str>) -> anyhow::Result<SwapTree> {
    SwapTree::from_json(json.context("swap has no swap tree")?)
}

fn counterparty_key(hex_key: Option<&str>) -> anyhow::Result<PublicKey> {
    parse_public_key(hex_key.context("swap has no counterparty public key")?)
}
