use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, ripemd160};
use bitcoin::opcodes;
use bitcoin::script::{Builder, Instruction};
use bitcoin::secp256k1::{Secp256k1, XOnlyPublicKey};
use bitcoin::taproot::{LeafVersion, TaprootBuilder, TaprootSpendInfo};
use bitcoin::ScriptBuf;
use lwk_wollet::elements;
use serde::{Deserialize, Serialize};

use crate::chain::ChainType;

pub const BITCOIN_LEAF_VERSION: u8 = 0xc0;
pub const LIQUID_LEAF_VERSION: u8 = 0xc4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLeaf {
    pub version: u8,
    /// Hex encoded leaf script.
    pub output: String,
}

impl TreeLeaf {
    fn script(&self) -> Result<ScriptBuf> {
        let bytes = hex::decode(&self.output).context("decode leaf script hex")?;
        Ok(ScriptBuf::from_bytes(bytes))
    }
}

/// Two-leaf taproot tree locking a swap output.
///
/// The claim leaf pays the claimer against the preimage; the refund leaf pays
/// the refunder after `timeout_block_height`. Both leaves sit at depth one and
/// the internal key is the MuSig2 aggregate of both parties, so a cooperative
/// spend never reveals either leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapTree {
    pub claim_leaf: TreeLeaf,
    pub refund_leaf: TreeLeaf,
}

impl SwapTree {
    pub fn new(
        chain: ChainType,
        preimage_hash: &[u8; 32],
        claim_key: &XOnlyPublicKey,
        refund_key: &XOnlyPublicKey,
        timeout_block_height: u32,
    ) -> Self {
        let version = match chain {
            ChainType::Bitcoin => BITCOIN_LEAF_VERSION,
            ChainType::Liquid => LIQUID_LEAF_VERSION,
        };

        let claim_script = Builder::new()
            .push_opcode(opcodes::all::OP_SIZE)
            .push_int(32)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_HASH160)
            .push_slice(ripemd160::Hash::hash(preimage_hash).to_byte_array())
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_x_only_key(claim_key)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .into_script();

        let refund_script = Builder::new()
            .push_x_only_key(refund_key)
            .push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
            .push_int(timeout_block_height as i64)
            .push_opcode(opcodes::all::OP_CLTV)
            .into_script();

        Self {
            claim_leaf: TreeLeaf {
                version,
                output: hex::encode(claim_script.as_bytes()),
            },
            refund_leaf: TreeLeaf {
                version,
                output: hex::encode(refund_script.as_bytes()),
            },
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("parse swap tree json")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("encode swap tree json")
    }

    pub fn chain_type(&self) -> Result<ChainType> {
        anyhow::ensure!(
            self.claim_leaf.version == self.refund_leaf.version,
            "swap tree leaves use different versions"
        );
        match self.claim_leaf.version {
            BITCOIN_LEAF_VERSION => Ok(ChainType::Bitcoin),
            LIQUID_LEAF_VERSION => Ok(ChainType::Liquid),
            other => anyhow::bail!("unknown leaf version: {other:#x}"),
        }
    }

    pub fn claim_script(&self) -> Result<ScriptBuf> {
        self.claim_leaf.script().context("claim leaf")
    }

    pub fn refund_script(&self) -> Result<ScriptBuf> {
        self.refund_leaf.script().context("refund leaf")
    }

    pub fn preimage_hash160(&self) -> Result<[u8; 20]> {
        Ok(parse_claim_leaf(&self.claim_script()?)?.0)
    }

    pub fn claim_public_key(&self) -> Result<XOnlyPublicKey> {
        Ok(parse_claim_leaf(&self.claim_script()?)?.1)
    }

    pub fn refund_public_key(&self) -> Result<XOnlyPublicKey> {
        Ok(parse_refund_leaf(&self.refund_script()?)?.0)
    }

    pub fn timeout_block_height(&self) -> Result<u32> {
        Ok(parse_refund_leaf(&self.refund_script()?)?.1)
    }

    pub fn bitcoin_spend_info(&self, internal_key: XOnlyPublicKey) -> Result<TaprootSpendInfo> {
        let secp = Secp256k1::verification_only();
        TaprootBuilder::new()
            .add_leaf_with_ver(1, self.claim_script()?, LeafVersion::TapScript)
            .context("add claim leaf")?
            .add_leaf_with_ver(1, self.refund_script()?, LeafVersion::TapScript)
            .context("add refund leaf")?
            .finalize(&secp, internal_key)
            .map_err(|_| anyhow::anyhow!("finalize taproot tree"))
    }

    pub fn liquid_spend_info(
        &self,
        internal_key: XOnlyPublicKey,
    ) -> Result<elements::taproot::TaprootSpendInfo> {
        let secp = elements::secp256k1_zkp::Secp256k1::verification_only();
        let internal_key =
            elements::secp256k1_zkp::XOnlyPublicKey::from_slice(&internal_key.serialize())
                .context("convert internal key")?;

        let claim_script = elements::Script::from(self.claim_script()?.into_bytes());
        let refund_script = elements::Script::from(self.refund_script()?.into_bytes());

        elements::taproot::TaprootBuilder::new()
            .add_leaf_with_ver(1, claim_script, elements::taproot::LeafVersion::default())
            .map_err(|e| anyhow::anyhow!("add claim leaf: {e:?}"))?
            .add_leaf_with_ver(1, refund_script, elements::taproot::LeafVersion::default())
            .map_err(|e| anyhow::anyhow!("add refund leaf: {e:?}"))?
            .finalize(&secp, internal_key)
            .map_err(|_| anyhow::anyhow!("finalize liquid taproot tree"))
    }

    /// Taproot tweak committing `internal_key` to this tree.
    pub fn tap_tweak(&self, internal_key: XOnlyPublicKey) -> Result<[u8; 32]> {
        match self.chain_type()? {
            ChainType::Bitcoin => Ok(self
                .bitcoin_spend_info(internal_key)?
                .tap_tweak()
                .to_byte_array()),
            ChainType::Liquid => Ok(self
                .liquid_spend_info(internal_key)?
                .tap_tweak()
                .to_byte_array()),
        }
    }

    pub fn output_key(&self, internal_key: XOnlyPublicKey) -> Result<XOnlyPublicKey> {
        match self.chain_type()? {
            ChainType::Bitcoin => Ok(self.bitcoin_spend_info(internal_key)?.output_key().to_inner()),
            ChainType::Liquid => {
                let output_key = self.liquid_spend_info(internal_key)?.output_key().into_inner();
                XOnlyPublicKey::from_slice(&output_key.serialize()).context("convert output key")
            }
        }
    }

    /// Segwit v1 script pubkey; identical bytes on both chains.
    pub fn script_pubkey(&self, internal_key: XOnlyPublicKey) -> Result<Vec<u8>> {
        let output_key = self.output_key(internal_key)?;
        let mut spk = Vec::with_capacity(34);
        spk.push(opcodes::all::OP_PUSHNUM_1.to_u8());
        spk.push(32);
        spk.extend_from_slice(&output_key.serialize());
        Ok(spk)
    }
}

fn parse_claim_leaf(script: &ScriptBuf) -> Result<([u8; 20], XOnlyPublicKey)> {
    let mut iter = script.instructions_minimal();

    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_SIZE)?;
    let size = parse_script_num(next_instruction(&mut iter)?)?;
    anyhow::ensure!(size == 32, "unexpected preimage size check: {size}");
    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUALVERIFY)?;

    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_HASH160)?;
    let hash160 = expect_push::<20>(next_instruction(&mut iter)?)?;
    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_EQUALVERIFY)?;

    let claim_key = expect_push::<32>(next_instruction(&mut iter)?)?;
    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIG)?;

    anyhow::ensure!(
        iter.next().is_none(),
        "unexpected trailing instructions in claim leaf"
    );

    let claim_key = XOnlyPublicKey::from_slice(&claim_key).context("parse claim key")?;
    Ok((hash160, claim_key))
}

fn parse_refund_leaf(script: &ScriptBuf) -> Result<(XOnlyPublicKey, u32)> {
    let mut iter = script.instructions_minimal();

    let refund_key = expect_push::<32>(next_instruction(&mut iter)?)?;
    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CHECKSIGVERIFY)?;

    let timeout = parse_script_num(next_instruction(&mut iter)?)?;
    anyhow::ensure!(
        timeout >= 0 && timeout <= u32::MAX as i64,
        "timeout_block_height out of range: {timeout}"
    );
    expect_op(next_instruction(&mut iter)?, opcodes::all::OP_CLTV)?;

    anyhow::ensure!(
        iter.next().is_none(),
        "unexpected trailing instructions in refund leaf"
    );

    let refund_key = XOnlyPublicKey::from_slice(&refund_key).context("parse refund key")?;
    Ok((refund_key, timeout as u32))
}

fn next_instruction<'a>(
    iter: &mut impl Iterator<Item = std::result::Result<Instruction<'a>, bitcoin::script::Error>>,
) -> Result<Instruction<'a>> {
    iter.next()
        .transpose()
        .map_err(|e| anyhow::anyhow!("decode leaf instruction: {e:?}"))?
        .context("unexpected end of leaf script")
}

fn expect_op(actual: Instruction<'_>, expected: opcodes::Opcode) -> Result<()> {
    match actual {
        Instruction::Op(op) if op == expected => Ok(()),
        other => anyhow::bail!("unexpected instruction: expected {expected:?}, got {other:?}"),
    }
}

fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N]> {
    match actual {
        Instruction::PushBytes(bytes) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes.as_bytes());
            Ok(out)
        }
        other => anyhow::bail!("unexpected instruction: expected push {N} bytes, got {other:?}"),
    }
}

fn parse_script_num(actual: Instruction<'_>) -> Result<i64> {
    match actual {
        Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes()),
        Instruction::Op(op) => {
            let code = op.to_u8();
            let one = opcodes::all::OP_PUSHNUM_1.to_u8();
            let sixteen = opcodes::all::OP_PUSHNUM_16.to_u8();
            if (one..=sixteen).contains(&code) {
                return Ok((code - one + 1) as i64);
            }

            anyhow::bail!("unexpected opcode where script number expected: {op:?}");
        }
    }
}

fn decode_script_num(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 5 {
        anyhow::bail!("script number too large: {} bytes", bytes.len());
    }

    let mut magnitude = bytes.to_vec();
    let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }

    let mut value: i64 = 0;
    for (i, b) in magnitude.iter().enumerate() {
        value |= (*b as i64) << (8 * i);
    }

    Ok(if negative { -value } else { value })
}
