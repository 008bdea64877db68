use std::collections::BTreeMap;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{Keypair, Message, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid};
use coop_settlement::chain::{ChainType, Currencies, Currency};
use coop_settlement::config::SettlementConfig;
use coop_settlement::cooperative::deferred::{ClaimEvent, DeferredClaimer};
use coop_settlement::cooperative::musig::aggregate_internal_key;
use coop_settlement::cooperative::signer::MusigSigner;
use coop_settlement::lightning::LightningClient;
use coop_settlement::swap::store::SqliteSwapStore;
use coop_settlement::swap::tree::SwapTree;
use coop_settlement::swap::{
    ChainSwap, ChainSwapData, ReverseSwap, SubmarineSwap, SwapRecord, SwapStatus,
    SwapVersion,
};
use coop_settlement::wallet::Wallet as _;
use coop_settlement::wallet::bip32::Bip32Wallet;
use musig2::{AggNonce, KeyAggContext, PartialSignature, PubNonce, SecNonce};
use tokio::sync::mpsc;

use super::fakes::{FakeChainClient, FakeLightningClient, Scripted};

pub const SYMBOL: &str = "BTC";
pub const START_HEIGHT: u32 = 100;
pub const FEE_RATE: f64 = 3.0;
pub const LOCKUP_AMOUNT: u64 = 100_000;

/// Operator-side wiring over fakes: a BTC currency with one Lightning client,
/// plus optional extra Bitcoin-type symbols with their own chains.
pub struct Harness {
    pub chain: Arc<FakeChainClient>,
    pub chains: BTreeMap<String, Arc<FakeChainClient>>,
    pub wallet: Arc<Bip32Wallet>,
    pub lightning: Arc<FakeLightningClient>,
    pub store: Arc<Mutex<SqliteSwapStore>>,
    pub claimer: Arc<DeferredClaimer>,
    pub signer: Arc<MusigSigner>,
    pub events: mpsc::Receiver<ClaimEvent>,
}

impl Harness {
    pub fn new(config: SettlementConfig) -> Result<Self> {
        Self::with_symbols(config, &[])
    }

    /// Like [`Harness::new`], with one more Bitcoin-type currency per symbol.
    pub fn with_symbols(config: SettlementConfig, extra_symbols: &[&str]) -> Result<Self> {
        let chain = Arc::new(FakeChainClient::new(START_HEIGHT, FEE_RATE));
        let wallet = Arc::new(
            Bip32Wallet::from_seed(&[7u8; 32], Network::Regtest).context("create wallet")?,
        );
        let lightning = Arc::new(FakeLightningClient::new(
            "lnd-1",
            Scripted::State(coop_settlement::lightning::PaymentState::NotFound),
        ));

        let mut chains = BTreeMap::from([(SYMBOL.to_string(), chain.clone())]);
        let mut currencies = vec![Currency {
            symbol: SYMBOL.to_string(),
            chain_type: ChainType::Bitcoin,
            chain_client: chain.clone(),
            wallet: wallet.clone(),
            lightning_clients: vec![lightning.clone() as Arc<dyn LightningClient>],
        }];
        for symbol in extra_symbols {
            let extra = Arc::new(FakeChainClient::new(START_HEIGHT, FEE_RATE));
            chains.insert(symbol.to_string(), extra.clone());
            currencies.push(Currency {
                symbol: symbol.to_string(),
                chain_type: ChainType::Bitcoin,
                chain_client: extra,
                wallet: wallet.clone(),
                lightning_clients: Vec::new(),
            });
        }
        let currencies = Currencies::new(currencies);

        let store = Arc::new(Mutex::new(
            SqliteSwapStore::open_in_memory().context("open store")?,
        ));
        let (events_tx, events) = mpsc::channel(64);
        let claimer = Arc::new(DeferredClaimer::new(
            config,
            currencies.clone(),
            store.clone(),
            events_tx,
        ));
        let signer = Arc::new(MusigSigner::new(
            currencies,
            store.clone(),
            claimer.batch_claim_lock(),
        ));

        Ok(Self {
            chain,
            chains,
            wallet,
            lightning,
            store,
            claimer,
            signer,
            events,
        })
    }

    pub fn deferring() -> Result<Self> {
        Self::new(SettlementConfig {
            deferred_claim_symbols: vec![SYMBOL.to_string()],
            ..SettlementConfig::default()
        })
    }

    pub fn insert(&self, record: SwapRecord) -> Result<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .insert_swap(&record)
    }

    pub fn stored(&self, swap_id: &str) -> Result<SwapRecord> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .get_swap(swap_id)?
            .with_context(|| format!("swap {swap_id} missing"))
    }

    pub fn drain_events(&mut self) -> Vec<ClaimEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending_ids_of(SYMBOL)
    }

    pub fn pending_ids_of(&self, symbol: &str) -> Vec<String> {
        self.claimer
            .pending_sweeps()
            .get(symbol)
            .map(|by_kind| by_kind.values().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

/// A swap output locked to the operator (claim) and a user (refund).
pub struct Lockup {
    pub id: String,
    pub preimage: [u8; 32],
    pub preimage_hash: [u8; 32],
    pub user_keys: Keypair,
    pub operator_key: PublicKey,
    pub tree: SwapTree,
    pub internal_key: XOnlyPublicKey,
    pub transaction: Transaction,
}

impl Lockup {
    /// Creates the lockup for `key_index` and makes it known to the BTC chain.
    pub fn fund(
        harness: &Harness,
        id: &str,
        key_index: u32,
        amount: u64,
        timeout_block_height: u32,
    ) -> Result<Self> {
        Self::fund_on(harness, SYMBOL, id, key_index, amount, timeout_block_height)
    }

    pub fn fund_on(
        harness: &Harness,
        symbol: &str,
        id: &str,
        key_index: u32,
        amount: u64,
        timeout_block_height: u32,
    ) -> Result<Self> {
        let chain = harness
            .chains
            .get(symbol)
            .with_context(|| format!("no chain for {symbol}"))?;
        let secp = Secp256k1::new();
        let preimage = sha256::Hash::hash(format!("preimage-{id}").as_bytes()).to_byte_array();
        let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();

        let user_secret = SecretKey::from_slice(
            &sha256::Hash::hash(format!("user-{id}").as_bytes()).to_byte_array(),
        )?;
        let user_keys = Keypair::from_secret_key(&secp, &user_secret);
        let operator_keys = harness.wallet.derive_keys(key_index)?;

        let tree = SwapTree::new(
            ChainType::Bitcoin,
            &preimage_hash,
            &operator_keys.x_only_public_key().0,
            &user_keys.x_only_public_key().0,
            timeout_block_height,
        );
        let internal_key =
            aggregate_internal_key(operator_keys.public_key(), user_keys.public_key())?;
        let script_pubkey = ScriptBuf::from_bytes(tree.script_pubkey(internal_key)?);

        let funding_txid = Txid::from_byte_array(
            sha256::Hash::hash(format!("funding-{id}").as_bytes()).to_byte_array(),
        );
        let transaction = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(funding_txid, 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(amount),
                script_pubkey,
            }],
        };
        chain.add_transaction(&transaction);

        Ok(Self {
            id: id.to_string(),
            preimage,
            preimage_hash,
            user_keys,
            operator_key: operator_keys.public_key(),
            tree,
            internal_key,
            transaction,
        })
    }

    pub fn txid(&self) -> String {
        self.transaction.compute_txid().to_string()
    }

    pub fn output_key(&self) -> Result<XOnlyPublicKey> {
        self.tree.output_key(self.internal_key)
    }

    pub fn submarine_swap(&self, key_index: u32, status: SwapStatus) -> Result<SubmarineSwap> {
        Ok(SubmarineSwap {
            id: self.id.clone(),
            chain_symbol: SYMBOL.to_string(),
            lightning_symbol: SYMBOL.to_string(),
            status,
            version: SwapVersion::Taproot,
            preimage_hash: hex::encode(self.preimage_hash),
            invoice: None,
            key_index,
            swap_tree: Some(self.tree.to_json()?),
            refund_public_key: Some(self.user_keys.public_key().to_string()),
            lockup_transaction_id: Some(self.txid()),
            onchain_amount: Some(self.transaction.output[0].value.to_sat()),
            timeout_block_height: self.tree.timeout_block_height()?,
            preimage: None,
            miner_fee: None,
            batch_only: false,
            channel_creation: None,
        })
    }

    pub fn chain_swap(&self, key_index: u32, status: SwapStatus) -> Result<ChainSwap> {
        let timeout_block_height = self.tree.timeout_block_height()?;
        Ok(ChainSwap {
            id: self.id.clone(),
            status,
            version: SwapVersion::Taproot,
            preimage_hash: hex::encode(self.preimage_hash),
            preimage: Some(hex::encode(self.preimage)),
            batch_only: false,
            sending: ChainSwapData {
                symbol: "L-BTC".to_string(),
                key_index: key_index + 1000,
                swap_tree: None,
                their_public_key: None,
                lockup_transaction_id: None,
                amount: None,
                timeout_block_height: timeout_block_height + 100,
                miner_fee: None,
            },
            receiving: ChainSwapData {
                symbol: SYMBOL.to_string(),
                key_index,
                swap_tree: Some(self.tree.to_json()?),
                their_public_key: Some(self.user_keys.public_key().to_string()),
                lockup_transaction_id: Some(self.txid()),
                amount: Some(self.transaction.output[0].value.to_sat()),
                timeout_block_height,
                miner_fee: None,
            },
        })
    }

    /// Chain swap whose sending leg is this lockup: the operator locked, the
    /// user claims with the preimage.
    pub fn chain_swap_sending(&self, key_index: u32, status: SwapStatus) -> Result<ChainSwap> {
        let timeout_block_height = self.tree.timeout_block_height()?;
        Ok(ChainSwap {
            id: self.id.clone(),
            status,
            version: SwapVersion::Taproot,
            preimage_hash: hex::encode(self.preimage_hash),
            preimage: None,
            batch_only: false,
            sending: ChainSwapData {
                symbol: SYMBOL.to_string(),
                key_index,
                swap_tree: Some(self.tree.to_json()?),
                their_public_key: Some(self.user_keys.public_key().to_string()),
                lockup_transaction_id: Some(self.txid()),
                amount: Some(self.transaction.output[0].value.to_sat()),
                timeout_block_height,
                miner_fee: None,
            },
            receiving: ChainSwapData {
                symbol: "L-BTC".to_string(),
                key_index: key_index + 1000,
                swap_tree: None,
                their_public_key: None,
                lockup_transaction_id: None,
                amount: None,
                timeout_block_height: timeout_block_height + 100,
                miner_fee: None,
            },
        })
    }

    /// Reverse swap: the operator locked, the user claims with the preimage.
    pub fn reverse_swap(&self, key_index: u32, status: SwapStatus) -> Result<ReverseSwap> {
        Ok(ReverseSwap {
            id: self.id.clone(),
            chain_symbol: SYMBOL.to_string(),
            lightning_symbol: SYMBOL.to_string(),
            status,
            version: SwapVersion::Taproot,
            preimage_hash: hex::encode(self.preimage_hash),
            invoice: format!("lnbcrt-{}", self.id),
            key_index,
            swap_tree: Some(self.tree.to_json()?),
            claim_public_key: Some(self.user_keys.public_key().to_string()),
            lockup_transaction_id: Some(self.txid()),
            onchain_amount: self.transaction.output[0].value.to_sat(),
            timeout_block_height: self.tree.timeout_block_height()?,
            preimage: None,
        })
    }

    /// Spend of the lockup output to `destination`, unsigned.
    pub fn spend(&self, destination: &str, fee: u64) -> Result<Transaction> {
        let destination = bitcoin::Address::from_str(destination)?.assume_checked();
        Ok(Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(self.transaction.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(self.transaction.output[0].value.to_sat() - fee),
                script_pubkey: destination.script_pubkey(),
            }],
        })
    }

    /// BIP341 key spend sighash of input 0 of `tx` spending this lockup.
    pub fn key_spend_sighash(&self, tx: &Transaction) -> Result<[u8; 32]> {
        let prevouts = vec![self.transaction.output[0].clone()];
        let sighash = SighashCache::new(tx).taproot_key_spend_signature_hash(
            0,
            &Prevouts::All(&prevouts),
            TapSighashType::Default,
        )?;
        Ok(sighash.to_byte_array())
    }

    /// The user's side of the MuSig2 round with `operator_key`.
    pub fn user_session(&self, operator_key: PublicKey, seed: u8) -> Result<UserSession> {
        let tweak = SecretKey::from_slice(&self.tree.tap_tweak(self.internal_key)?)?;
        let key_agg = KeyAggContext::new([operator_key, self.user_keys.public_key()])?
            .with_tweak(tweak, true)?;
        let sec_nonce = SecNonce::build_with_seckey([seed; 32], self.user_keys.secret_key())
            .build();
        Ok(UserSession {
            key_agg,
            pub_nonce: sec_nonce.public_nonce(),
            sec_nonce,
            secret_key: self.user_keys.secret_key(),
        })
    }
}

pub struct UserSession {
    pub key_agg: KeyAggContext,
    pub sec_nonce: SecNonce,
    pub pub_nonce: PubNonce,
    pub secret_key: SecretKey,
}

impl UserSession {
    pub fn sign(self, operator_nonce: &PubNonce, message: [u8; 32]) -> Result<PartialSignature> {
        let agg_nonce = AggNonce::sum([operator_nonce.clone(), self.pub_nonce.clone()]);
        Ok(musig2::sign_partial(
            &self.key_agg,
            self.secret_key,
            self.sec_nonce,
            &agg_nonce,
            message,
        )?)
    }
}

pub fn operator_address(harness: &Harness) -> Result<String> {
    Ok(harness.wallet.address_at(999)?.to_string())
}

pub fn verify_key_spend(
    tx: &Transaction,
    output_key: XOnlyPublicKey,
    sighash: [u8; 32],
) -> Result<()> {
    let witness = tx.input[0].witness.nth(0).context("missing key spend witness")?;
    let signature = bitcoin::secp256k1::schnorr::Signature::from_slice(witness)?;
    Secp256k1::verification_only().verify_schnorr(
        &signature,
        &Message::from_digest(sighash),
        &output_key,
    )?;
    Ok(())
}
