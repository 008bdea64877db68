use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use coop_settlement::chain::ChainClient;
use coop_settlement::lightning::{LightningClient, PaymentState};

/// In-memory chain: serves stored transactions and records broadcasts.
pub struct FakeChainClient {
    transactions: Mutex<HashMap<String, Vec<u8>>>,
    broadcasts: Mutex<Vec<bitcoin::Transaction>>,
    reject_broadcasts: AtomicBool,
    height: AtomicU32,
    fee_rate: Mutex<f64>,
}

impl FakeChainClient {
    pub fn new(height: u32, fee_rate: f64) -> Self {
        Self {
            transactions: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            reject_broadcasts: AtomicBool::new(false),
            height: AtomicU32::new(height),
            fee_rate: Mutex::new(fee_rate),
        }
    }

    pub fn add_transaction(&self, tx: &bitcoin::Transaction) {
        self.transactions
            .lock()
            .expect("transactions mutex poisoned")
            .insert(
                tx.compute_txid().to_string(),
                bitcoin::consensus::serialize(tx),
            );
    }

    pub fn reject_broadcasts(&self, reject: bool) {
        self.reject_broadcasts.store(reject, Ordering::SeqCst);
    }

    pub fn broadcasts(&self) -> Vec<bitcoin::Transaction> {
        self.broadcasts
            .lock()
            .expect("broadcasts mutex poisoned")
            .clone()
    }
}

#[async_trait::async_trait]
impl ChainClient for FakeChainClient {
    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>> {
        self.transactions
            .lock()
            .expect("transactions mutex poisoned")
            .get(txid)
            .cloned()
            .with_context(|| format!("No such mempool or blockchain transaction: {txid}"))
    }

    async fn estimate_fee(&self) -> Result<f64> {
        Ok(*self.fee_rate.lock().expect("fee mutex poisoned"))
    }

    async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String> {
        // Leaves room for concurrent callers to interleave.
        tokio::time::sleep(Duration::from_millis(10)).await;

        if self.reject_broadcasts.load(Ordering::SeqCst) {
            anyhow::bail!("bad-txns-inputs-missingorspent");
        }

        let raw = hex::decode(tx_hex).context("decode tx hex")?;
        let tx: bitcoin::Transaction =
            bitcoin::consensus::deserialize(&raw).context("decode tx")?;
        let txid = tx.compute_txid().to_string();

        self.add_transaction(&tx);
        self.broadcasts
            .lock()
            .expect("broadcasts mutex poisoned")
            .push(tx);
        Ok(txid)
    }

    async fn block_height(&self) -> Result<u32> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn genesis_hash(&self) -> Result<String> {
        Ok(bitcoin::constants::genesis_block(bitcoin::Network::Regtest)
            .block_hash()
            .to_string())
    }
}

/// What a [`FakeLightningClient`] answers to payment lookups.
#[derive(Debug, Clone, Copy)]
pub enum Scripted {
    State(PaymentState),
    Error,
}

pub struct FakeLightningClient {
    name: String,
    answer: Mutex<Scripted>,
    settled: AtomicUsize,
}

impl FakeLightningClient {
    pub fn new(name: &str, answer: Scripted) -> Self {
        Self {
            name: name.to_string(),
            answer: Mutex::new(answer),
            settled: AtomicUsize::new(0),
        }
    }

    pub fn set_answer(&self, answer: Scripted) {
        *self.answer.lock().expect("answer mutex poisoned") = answer;
    }

    pub fn settled_invoices(&self) -> usize {
        self.settled.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LightningClient for FakeLightningClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn payment_state(
        &self,
        _preimage_hash: &[u8; 32],
        _invoice: Option<&str>,
    ) -> Result<PaymentState> {
        match *self.answer.lock().expect("answer mutex poisoned") {
            Scripted::State(state) => Ok(state),
            Scripted::Error => anyhow::bail!("{}: connection refused", self.name),
        }
    }

    async fn settle_hold_invoice(&self, _preimage: &[u8; 32]) -> Result<()> {
        self.settled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
