use std::collections::HashMap;
use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::hashes::Hash as _;
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use lwk_wollet::elements;

use super::{ChainClient, ChainType};

/// A transaction on either supported chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapTransaction {
    Bitcoin(bitcoin::Transaction),
    Liquid(elements::Transaction),
}

/// Output spent by an input of a [`SwapTransaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrevOut {
    Bitcoin(bitcoin::TxOut),
    Liquid(elements::TxOut),
}

impl PrevOut {
    pub fn script_pubkey(&self) -> &[u8] {
        match self {
            PrevOut::Bitcoin(out) => out.script_pubkey.as_bytes(),
            PrevOut::Liquid(out) => out.script_pubkey.as_bytes(),
        }
    }

    /// Amount in sats, `None` for confidential outputs.
    pub fn explicit_value(&self) -> Option<u64> {
        match self {
            PrevOut::Bitcoin(out) => Some(out.value.to_sat()),
            PrevOut::Liquid(out) => out.value.explicit(),
        }
    }
}

impl SwapTransaction {
    pub fn parse(chain: ChainType, raw: &[u8]) -> Result<Self> {
        match chain {
            ChainType::Bitcoin => Ok(Self::Bitcoin(
                bitcoin::consensus::deserialize(raw).context("decode bitcoin transaction")?,
            )),
            ChainType::Liquid => Ok(Self::Liquid(
                elements::encode::deserialize(raw).context("decode elements transaction")?,
            )),
        }
    }

    pub fn chain_type(&self) -> ChainType {
        match self {
            SwapTransaction::Bitcoin(_) => ChainType::Bitcoin,
            SwapTransaction::Liquid(_) => ChainType::Liquid,
        }
    }

    pub fn txid(&self) -> String {
        match self {
            SwapTransaction::Bitcoin(tx) => tx.compute_txid().to_string(),
            SwapTransaction::Liquid(tx) => tx.txid().to_string(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            SwapTransaction::Bitcoin(tx) => bitcoin::consensus::serialize(tx),
            SwapTransaction::Liquid(tx) => elements::encode::serialize(tx),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }

    pub fn input_count(&self) -> usize {
        match self {
            SwapTransaction::Bitcoin(tx) => tx.input.len(),
            SwapTransaction::Liquid(tx) => tx.input.len(),
        }
    }

    /// `(txid, vout)` of every input, in input order.
    pub fn outpoints(&self) -> Vec<(String, u32)> {
        match self {
            SwapTransaction::Bitcoin(tx) => tx
                .input
                .iter()
                .map(|i| (i.previous_output.txid.to_string(), i.previous_output.vout))
                .collect(),
            SwapTransaction::Liquid(tx) => tx
                .input
                .iter()
                .map(|i| (i.previous_output.txid.to_string(), i.previous_output.vout))
                .collect(),
        }
    }

    pub fn output(&self, vout: u32) -> Option<PrevOut> {
        let vout = vout as usize;
        match self {
            SwapTransaction::Bitcoin(tx) => tx.output.get(vout).cloned().map(PrevOut::Bitcoin),
            SwapTransaction::Liquid(tx) => tx.output.get(vout).cloned().map(PrevOut::Liquid),
        }
    }

    /// Index and copy of the first output paying to `script_pubkey`.
    pub fn find_output(&self, script_pubkey: &[u8]) -> Option<(u32, PrevOut)> {
        let position = match self {
            SwapTransaction::Bitcoin(tx) => tx
                .output
                .iter()
                .position(|o| o.script_pubkey.as_bytes() == script_pubkey),
            SwapTransaction::Liquid(tx) => tx
                .output
                .iter()
                .position(|o| o.script_pubkey.as_bytes() == script_pubkey),
        }?;
        let vout = u32::try_from(position).ok()?;
        self.output(vout).map(|out| (vout, out))
    }

    /// Resolves the outputs spent by every input through `client`.
    pub async fn previous_outputs(&self, client: &dyn ChainClient) -> Result<Vec<PrevOut>> {
        let chain = self.chain_type();
        let mut fetched: HashMap<String, SwapTransaction> = HashMap::new();
        let mut prevouts = Vec::with_capacity(self.input_count());

        for (txid, vout) in self.outpoints() {
            if !fetched.contains_key(&txid) {
                let raw = client
                    .get_raw_transaction(&txid)
                    .await
                    .with_context(|| format!("fetch previous transaction {txid}"))?;
                let tx = SwapTransaction::parse(chain, &raw)
                    .with_context(|| format!("parse previous transaction {txid}"))?;
                fetched.insert(txid.clone(), tx);
            }

            let output = fetched
                .get(&txid)
                .and_then(|tx| tx.output(vout))
                .with_context(|| format!("previous output {txid}:{vout} not found"))?;
            prevouts.push(output);
        }

        Ok(prevouts)
    }

    /// BIP341 (or Elements) key-path sighash of input `vin`, SIGHASH_DEFAULT.
    pub fn key_spend_sighash(
        &self,
        vin: usize,
        prevouts: &[PrevOut],
        genesis_hash: Option<&str>,
    ) -> Result<[u8; 32]> {
        match self {
            SwapTransaction::Bitcoin(tx) => {
                let prevouts = bitcoin_prevouts(prevouts)?;
                let sighash = SighashCache::new(tx)
                    .taproot_key_spend_signature_hash(
                        vin,
                        &Prevouts::All(&prevouts),
                        TapSighashType::Default,
                    )
                    .context("compute taproot key spend sighash")?;
                Ok(sighash.to_byte_array())
            }
            SwapTransaction::Liquid(tx) => {
                let prevouts = liquid_prevouts(prevouts)?;
                let genesis_hash = genesis_hash.context("liquid sighash needs a genesis hash")?;
                let genesis_hash = elements::BlockHash::from_str(genesis_hash)
                    .context("parse genesis hash")?;
                let sighash = elements::sighash::SighashCache::new(tx)
                    .taproot_key_spend_signature_hash(
                        vin,
                        &elements::sighash::Prevouts::All(&prevouts),
                        elements::SchnorrSighashType::Default,
                        genesis_hash,
                    )
                    .map_err(|e| anyhow::anyhow!("compute elements key spend sighash: {e:?}"))?;
                Ok(sighash.to_byte_array())
            }
        }
    }

    /// Replaces the witness of `vin` with a single key-path signature.
    pub fn set_key_spend_signature(&mut self, vin: usize, signature: &[u8; 64]) -> Result<()> {
        match self {
            SwapTransaction::Bitcoin(tx) => {
                let input = tx.input.get_mut(vin).context("input index out of range")?;
                input.witness = bitcoin::Witness::from_slice(&[signature.to_vec()]);
            }
            SwapTransaction::Liquid(tx) => {
                let input = tx.input.get_mut(vin).context("input index out of range")?;
                input.witness.script_witness = vec![signature.to_vec()];
            }
        }
        Ok(())
    }
}

pub(crate) fn bitcoin_prevouts(prevouts: &[PrevOut]) -> Result<Vec<bitcoin::TxOut>> {
    prevouts
        .iter()
        .map(|p| match p {
            PrevOut::Bitcoin(out) => Ok(out.clone()),
            PrevOut::Liquid(_) => anyhow::bail!("liquid output spent by bitcoin transaction"),
        })
        .collect()
}

pub(crate) fn liquid_prevouts(prevouts: &[PrevOut]) -> Result<Vec<elements::TxOut>> {
    prevouts
        .iter()
        .map(|p| match p {
            PrevOut::Liquid(out) => Ok(out.clone()),
            PrevOut::Bitcoin(_) => anyhow::bail!("bitcoin output spent by liquid transaction"),
        })
        .collect()
}
