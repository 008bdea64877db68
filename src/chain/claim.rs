use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use lwk_wollet::elements;

use super::transaction::{PrevOut, SwapTransaction, bitcoin_prevouts, liquid_prevouts};
use crate::swap::tree::SwapTree;

/// Outputs below this many sats are not relayed.
pub const DUST_LIMIT_SATS: u64 = 330;

/// Stand-in for a key-path signature while sizing a transaction.
const KEY_SPEND_PLACEHOLDER: [u8; 64] = [0u8; 64];

/// One swap output to be spent by a claim transaction.
#[derive(Debug, Clone)]
pub struct ClaimDetails {
    pub txid: String,
    pub vout: u32,
    pub prevout: PrevOut,
    pub tree: SwapTree,
    pub internal_key: XOnlyPublicKey,
    pub keys: Keypair,
    pub preimage: [u8; 32],
    /// Key-path input; its witness is filled in after MuSig2 signing.
    pub cooperative: bool,
}

/// Locates the output of `lockup` locked to `tree` under `internal_key`.
pub fn find_swap_output(
    lockup: &SwapTransaction,
    tree: &SwapTree,
    internal_key: XOnlyPublicKey,
) -> Result<(u32, PrevOut)> {
    let script_pubkey = tree
        .script_pubkey(internal_key)
        .context("derive swap script pubkey")?;
    lockup
        .find_output(&script_pubkey)
        .with_context(|| format!("swap output not found in {}", lockup.txid()))
}

/// Builds one transaction spending every `details` input to `destination`.
///
/// The fee is `ceil(vsize * fee_rate)` and is taken from the single
/// destination output. Script-path inputs are signed here; cooperative inputs
/// carry a placeholder that [`SwapTransaction::set_key_spend_signature`]
/// replaces.
pub fn construct_claim_transaction(
    details: &[ClaimDetails],
    destination: &str,
    fee_rate: f64,
    genesis_hash: Option<&str>,
) -> Result<SwapTransaction> {
    anyhow::ensure!(!details.is_empty(), "no claim details");
    anyhow::ensure!(
        fee_rate.is_finite() && fee_rate >= 0.0,
        "invalid fee rate: {fee_rate}"
    );

    match &details[0].prevout {
        PrevOut::Bitcoin(_) => {
            construct_bitcoin(details, destination, fee_rate).map(SwapTransaction::Bitcoin)
        }
        PrevOut::Liquid(_) => {
            let genesis_hash = genesis_hash.context("liquid claims need a genesis hash")?;
            construct_liquid(details, destination, fee_rate, genesis_hash)
                .map(SwapTransaction::Liquid)
        }
    }
}

/// Saturates at `u64::MAX` for absurd rates.
fn fee_for_vsize(vsize: usize, fee_rate: f64) -> u64 {
    (vsize as f64 * fee_rate).ceil() as u64
}

/// Value left for the claim output once `fee` is paid.
fn claim_output_value(total: u64, fee: u64) -> Result<u64> {
    let required = fee
        .checked_add(DUST_LIMIT_SATS)
        .with_context(|| format!("fee overflows: {fee}"))?;
    anyhow::ensure!(
        total >= required,
        "claim output below dust: inputs={total} fee={fee}"
    );
    Ok(total - fee)
}

fn construct_bitcoin(
    details: &[ClaimDetails],
    destination: &str,
    fee_rate: f64,
) -> Result<bitcoin::Transaction> {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

    let destination = bitcoin::Address::from_str(destination)
        .context("parse destination address")?
        .assume_checked();

    let prevouts = bitcoin_prevouts(
        &details
            .iter()
            .map(|d| d.prevout.clone())
            .collect::<Vec<_>>(),
    )?;
    let total: u64 = prevouts.iter().map(|o| o.value.to_sat()).sum();

    let mut input = Vec::with_capacity(details.len());
    for d in details {
        input.push(TxIn {
            previous_output: OutPoint {
                txid: Txid::from_str(&d.txid).context("parse lockup txid")?,
                vout: d.vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        });
    }

    let mut tx = bitcoin::Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output: vec![TxOut {
            value: Amount::from_sat(total),
            script_pubkey: destination.script_pubkey(),
        }],
    };

    let mut script_paths = Vec::with_capacity(details.len());
    for (i, d) in details.iter().enumerate() {
        if d.cooperative {
            tx.input[i].witness = Witness::from_slice(&[KEY_SPEND_PLACEHOLDER.to_vec()]);
            script_paths.push(None);
            continue;
        }

        let claim_script = d.tree.claim_script()?;
        let control_block = d
            .tree
            .bitcoin_spend_info(d.internal_key)?
            .control_block(&(claim_script.clone(), LeafVersion::TapScript))
            .context("create control block")?
            .serialize();

        tx.input[i].witness = Witness::from_slice(&[
            KEY_SPEND_PLACEHOLDER.to_vec(),
            d.preimage.to_vec(),
            claim_script.to_bytes(),
            control_block.clone(),
        ]);
        script_paths.push(Some((claim_script, control_block)));
    }

    let fee = fee_for_vsize(tx.vsize(), fee_rate);
    tx.output[0].value = Amount::from_sat(claim_output_value(total, fee)?);

    let secp = Secp256k1::new();
    let mut signatures = Vec::with_capacity(details.len());
    {
        let mut cache = SighashCache::new(&tx);
        for (i, (d, path)) in details.iter().zip(&script_paths).enumerate() {
            let Some((claim_script, _)) = path else {
                signatures.push(None);
                continue;
            };

            let leaf_hash = TapLeafHash::from_script(claim_script, LeafVersion::TapScript);
            let sighash = cache
                .taproot_script_spend_signature_hash(
                    i,
                    &Prevouts::All(&prevouts),
                    leaf_hash,
                    TapSighashType::Default,
                )
                .context("compute script spend sighash")?;
            let msg = Message::from_digest(sighash.to_byte_array());
            signatures.push(Some(secp.sign_schnorr(&msg, &d.keys)));
        }
    }

    for (i, ((d, path), sig)) in details
        .iter()
        .zip(script_paths)
        .zip(signatures)
        .enumerate()
    {
        if let (Some((claim_script, control_block)), Some(sig)) = (path, sig) {
            tx.input[i].witness = Witness::from_slice(&[
                sig.serialize().to_vec(),
                d.preimage.to_vec(),
                claim_script.to_bytes(),
                control_block,
            ]);
        }
    }

    Ok(tx)
}

fn construct_liquid(
    details: &[ClaimDetails],
    destination: &str,
    fee_rate: f64,
    genesis_hash: &str,
) -> Result<elements::Transaction> {
    use elements::confidential::{Asset, Nonce, Value};
    use elements::{
        LockTime, OutPoint, Script, Sequence, TxIn, TxInWitness, TxOut, TxOutWitness, Txid,
    };

    let destination =
        elements::Address::from_str(destination).context("parse destination address")?;
    let genesis_hash =
        elements::BlockHash::from_str(genesis_hash).context("parse genesis hash")?;

    let prevouts = liquid_prevouts(
        &details
            .iter()
            .map(|d| d.prevout.clone())
            .collect::<Vec<_>>(),
    )?;

    let mut total: u64 = 0;
    let mut asset = None;
    for out in &prevouts {
        let (Some(value), Some(out_asset)) = (out.value.explicit(), out.asset.explicit()) else {
            anyhow::bail!("confidential lockup outputs are not supported");
        };
        anyhow::ensure!(
            asset.is_none_or(|a| a == out_asset),
            "lockup outputs use different assets"
        );
        asset = Some(out_asset);
        total = total
            .checked_add(value)
            .context("lockup amounts overflow")?;
    }
    let asset = asset.context("no lockup asset")?;

    let mut input = Vec::with_capacity(details.len());
    for d in details {
        input.push(TxIn {
            previous_output: OutPoint {
                txid: Txid::from_str(&d.txid).context("parse lockup txid")?,
                vout: d.vout,
            },
            is_pegin: false,
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            asset_issuance: Default::default(),
            witness: TxInWitness::default(),
        });
    }

    let mut tx = elements::Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input,
        output: vec![
            TxOut {
                asset: Asset::Explicit(asset),
                value: Value::Explicit(total),
                nonce: Nonce::Null,
                script_pubkey: destination.script_pubkey(),
                witness: TxOutWitness::default(),
            },
            TxOut::new_fee(0, asset),
        ],
    };

    let mut script_paths = Vec::with_capacity(details.len());
    for (i, d) in details.iter().enumerate() {
        if d.cooperative {
            tx.input[i].witness.script_witness = vec![KEY_SPEND_PLACEHOLDER.to_vec()];
            script_paths.push(None);
            continue;
        }

        let claim_script = Script::from(d.tree.claim_script()?.into_bytes());
        let control_block = d
            .tree
            .liquid_spend_info(d.internal_key)?
            .control_block(&(
                claim_script.clone(),
                elements::taproot::LeafVersion::default(),
            ))
            .context("create control block")?
            .serialize();

        tx.input[i].witness.script_witness = vec![
            KEY_SPEND_PLACEHOLDER.to_vec(),
            d.preimage.to_vec(),
            claim_script.to_bytes(),
            control_block.clone(),
        ];
        script_paths.push(Some((claim_script, control_block)));
    }

    let vsize = tx.weight().div_ceil(4);
    let fee = fee_for_vsize(vsize, fee_rate);
    tx.output[0].value = Value::Explicit(claim_output_value(total, fee)?);
    tx.output[1] = TxOut::new_fee(fee, asset);

    let secp = elements::secp256k1_zkp::Secp256k1::new();
    let mut signatures = Vec::with_capacity(details.len());
    {
        let mut cache = elements::sighash::SighashCache::new(&tx);
        for (i, (d, path)) in details.iter().zip(&script_paths).enumerate() {
            let Some((claim_script, _)) = path else {
                signatures.push(None);
                continue;
            };

            let leaf_hash = elements::taproot::TapLeafHash::from_script(
                claim_script,
                elements::taproot::LeafVersion::default(),
            );
            let sighash = cache
                .taproot_script_spend_signature_hash(
                    i,
                    &elements::sighash::Prevouts::All(&prevouts),
                    leaf_hash,
                    elements::SchnorrSighashType::Default,
                    genesis_hash,
                )
                .map_err(|e| anyhow::anyhow!("compute script spend sighash: {e:?}"))?;
            let msg = elements::secp256k1_zkp::Message::from_digest_slice(sighash.as_byte_array())
                .context("create sighash message")?;
            let keys = elements::secp256k1_zkp::Keypair::from_seckey_slice(
                &secp,
                &d.keys.secret_bytes(),
            )
            .context("convert claim keys")?;
            signatures.push(Some(secp.sign_schnorr(&msg, &keys)));
        }
    }

    for (i, ((d, path), sig)) in details
        .iter()
        .zip(script_paths)
        .zip(signatures)
        .enumerate()
    {
        if let (Some((claim_script, control_block)), Some(sig)) = (path, sig) {
            tx.input[i].witness.script_witness = vec![
                sig.serialize().to_vec(),
                d.preimage.to_vec(),
                claim_script.to_bytes(),
                control_block,
            ];
        }
    }

    Ok(tx)
}
