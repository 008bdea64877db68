pub mod store;
pub mod tree;

use std::fmt;
use std::str::FromStr;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use self::tree::SwapTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    SwapCreated,
    SwapExpired,
    InvoiceSet,
    InvoicePending,
    InvoicePaid,
    InvoiceSettled,
    InvoiceFailedToPay,
    TransactionMempool,
    TransactionConfirmed,
    TransactionLockupFailed,
    TransactionServerMempool,
    TransactionServerConfirmed,
    TransactionClaimPending,
    TransactionClaimed,
    TransactionRefunded,
}

impl SwapStatus {
    pub const ALL: [SwapStatus; 15] = [
        SwapStatus::SwapCreated,
        SwapStatus::SwapExpired,
        SwapStatus::InvoiceSet,
        SwapStatus::InvoicePending,
        SwapStatus::InvoicePaid,
        SwapStatus::InvoiceSettled,
        SwapStatus::InvoiceFailedToPay,
        SwapStatus::TransactionMempool,
        SwapStatus::TransactionConfirmed,
        SwapStatus::TransactionLockupFailed,
        SwapStatus::TransactionServerMempool,
        SwapStatus::TransactionServerConfirmed,
        SwapStatus::TransactionClaimPending,
        SwapStatus::TransactionClaimed,
        SwapStatus::TransactionRefunded,
    ];

    /// Terminal failure states after which the user may get their coins back.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            SwapStatus::SwapExpired
                | SwapStatus::TransactionLockupFailed
                | SwapStatus::InvoiceFailedToPay
                | SwapStatus::TransactionRefunded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SwapStatus::SwapCreated => "swap.created",
            SwapStatus::SwapExpired => "swap.expired",
            SwapStatus::InvoiceSet => "invoice.set",
            SwapStatus::InvoicePending => "invoice.pending",
            SwapStatus::InvoicePaid => "invoice.paid",
            SwapStatus::InvoiceSettled => "invoice.settled",
            SwapStatus::InvoiceFailedToPay => "invoice.failedToPay",
            SwapStatus::TransactionMempool => "transaction.mempool",
            SwapStatus::TransactionConfirmed => "transaction.confirmed",
            SwapStatus::TransactionLockupFailed => "transaction.lockupFailed",
            SwapStatus::TransactionServerMempool => "transaction.server.mempool",
            SwapStatus::TransactionServerConfirmed => "transaction.server.confirmed",
            SwapStatus::TransactionClaimPending => "transaction.claim.pending",
            SwapStatus::TransactionClaimed => "transaction.claimed",
            SwapStatus::TransactionRefunded => "transaction.refunded",
        }
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        SwapStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .with_context(|| format!("unknown swap status: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapVersion {
    Legacy,
    Taproot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapKind {
    Submarine,
    Reverse,
    Chain,
}

impl SwapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapKind::Submarine => "submarine",
            SwapKind::Reverse => "reverse",
            SwapKind::Chain => "chain",
        }
    }
}

impl FromStr for SwapKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submarine" => Ok(SwapKind::Submarine),
            "reverse" => Ok(SwapKind::Reverse),
            "chain" => Ok(SwapKind::Chain),
            other => anyhow::bail!("unknown swap kind: {other}"),
        }
    }
}

/// Set on submarine swaps that pay into a channel opened for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCreation {
    pub private: bool,
    pub inbound_liquidity: u32,
    pub funding_transaction_id: Option<String>,
}

/// User locks on-chain, we pay their invoice and claim the lockup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmarineSwap {
    pub id: String,
    pub chain_symbol: String,
    pub lightning_symbol: String,
    pub status: SwapStatus,
    pub version: SwapVersion,
    pub preimage_hash: String,
    pub invoice: Option<String>,
    pub key_index: u32,
    pub swap_tree: Option<String>,
    pub refund_public_key: Option<String>,
    pub lockup_transaction_id: Option<String>,
    pub onchain_amount: Option<u64>,
    pub timeout_block_height: u32,
    pub preimage: Option<String>,
    pub miner_fee: Option<u64>,
    pub batch_only: bool,
    pub channel_creation: Option<ChannelCreation>,
}

/// We lock on-chain against the user's hold invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseSwap {
    pub id: String,
    pub chain_symbol: String,
    pub lightning_symbol: String,
    pub status: SwapStatus,
    pub version: SwapVersion,
    pub preimage_hash: String,
    pub invoice: String,
    pub key_index: u32,
    pub swap_tree: Option<String>,
    pub claim_public_key: Option<String>,
    pub lockup_transaction_id: Option<String>,
    pub onchain_amount: u64,
    pub timeout_block_height: u32,
    pub preimage: Option<String>,
}

/// One leg of a chain swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSwapData {
    pub symbol: String,
    pub key_index: u32,
    pub swap_tree: Option<String>,
    pub their_public_key: Option<String>,
    pub lockup_transaction_id: Option<String>,
    pub amount: Option<u64>,
    pub timeout_block_height: u32,
    pub miner_fee: Option<u64>,
}

/// On-chain to on-chain swap; we claim the user's lockup on the receiving leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSwap {
    pub id: String,
    pub status: SwapStatus,
    pub version: SwapVersion,
    pub preimage_hash: String,
    pub preimage: Option<String>,
    pub batch_only: bool,
    pub sending: ChainSwapData,
    pub receiving: ChainSwapData,
}

/// Persisted form of every swap kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SwapRecord {
    Submarine(SubmarineSwap),
    Reverse(ReverseSwap),
    Chain(ChainSwap),
}

impl SwapRecord {
    pub fn id(&self) -> &str {
        match self {
            SwapRecord::Submarine(s) => &s.id,
            SwapRecord::Reverse(s) => &s.id,
            SwapRecord::Chain(s) => &s.id,
        }
    }

    pub fn kind(&self) -> SwapKind {
        match self {
            SwapRecord::Submarine(_) => SwapKind::Submarine,
            SwapRecord::Reverse(_) => SwapKind::Reverse,
            SwapRecord::Chain(_) => SwapKind::Chain,
        }
    }

    pub fn status(&self) -> SwapStatus {
        match self {
            SwapRecord::Submarine(s) => s.status,
            SwapRecord::Reverse(s) => s.status,
            SwapRecord::Chain(s) => s.status,
        }
    }

    pub fn set_status(&mut self, status: SwapStatus) {
        match self {
            SwapRecord::Submarine(s) => s.status = status,
            SwapRecord::Reverse(s) => s.status = status,
            SwapRecord::Chain(s) => s.status = status,
        }
    }

    /// Symbol of the chain the operator settles on.
    pub fn chain_symbol(&self) -> &str {
        match self {
            SwapRecord::Submarine(s) => &s.chain_symbol,
            SwapRecord::Reverse(s) => &s.chain_symbol,
            SwapRecord::Chain(s) => &s.receiving.symbol,
        }
    }

    pub fn into_claimable(self) -> Option<AnySwap> {
        match self {
            SwapRecord::Submarine(s) => Some(AnySwap::Submarine(s)),
            SwapRecord::Chain(s) => Some(AnySwap::Chain(s)),
            SwapRecord::Reverse(_) => None,
        }
    }
}

/// Swap kinds the operator claims on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnySwap {
    Submarine(SubmarineSwap),
    Chain(ChainSwap),
}

/// Borrowed view of the lockup the operator claims.
#[derive(Debug, Clone, Copy)]
pub struct ClaimLeg<'a> {
    pub symbol: &'a str,
    pub key_index: u32,
    pub swap_tree: Option<&'a str>,
    pub their_public_key: Option<&'a str>,
    pub lockup_transaction_id: Option<&'a str>,
    pub onchain_amount: Option<u64>,
    pub timeout_block_height: u32,
}

impl ClaimLeg<'_> {
    pub fn swap_tree(&self) -> Result<SwapTree> {
        let tree = self.swap_tree.context("swap has no swap tree")?;
        SwapTree::from_json(tree)
    }

    pub fn their_public_key(&self) -> Result<PublicKey> {
        let key = self
            .their_public_key
            .context("swap has no counterparty public key")?;
        parse_public_key(key)
    }

    pub fn lockup_transaction_id(&self) -> Result<&str> {
        self.lockup_transaction_id
            .context("swap has no lockup transaction")
    }
}

impl AnySwap {
    pub fn id(&self) -> &str {
        match self {
            AnySwap::Submarine(s) => &s.id,
            AnySwap::Chain(s) => &s.id,
        }
    }

    pub fn kind(&self) -> SwapKind {
        match self {
            AnySwap::Submarine(_) => SwapKind::Submarine,
            AnySwap::Chain(_) => SwapKind::Chain,
        }
    }

    pub fn status(&self) -> SwapStatus {
        match self {
            AnySwap::Submarine(s) => s.status,
            AnySwap::Chain(s) => s.status,
        }
    }

    pub fn version(&self) -> SwapVersion {
        match self {
            AnySwap::Submarine(s) => s.version,
            AnySwap::Chain(s) => s.version,
        }
    }

    pub fn preimage_hash(&self) -> &str {
        match self {
            AnySwap::Submarine(s) => &s.preimage_hash,
            AnySwap::Chain(s) => &s.preimage_hash,
        }
    }

    pub fn preimage(&self) -> Option<&str> {
        match self {
            AnySwap::Submarine(s) => s.preimage.as_deref(),
            AnySwap::Chain(s) => s.preimage.as_deref(),
        }
    }

    pub fn batch_only(&self) -> bool {
        match self {
            AnySwap::Submarine(s) => s.batch_only,
            AnySwap::Chain(s) => s.batch_only,
        }
    }

    pub fn channel_creation(&self) -> Option<&ChannelCreation> {
        match self {
            AnySwap::Submarine(s) => s.channel_creation.as_ref(),
            AnySwap::Chain(_) => None,
        }
    }

    pub fn claim_leg(&self) -> ClaimLeg<'_> {
        match self {
            AnySwap::Submarine(s) => ClaimLeg {
                symbol: &s.chain_symbol,
                key_index: s.key_index,
                swap_tree: s.swap_tree.as_deref(),
                their_public_key: s.refund_public_key.as_deref(),
                lockup_transaction_id: s.lockup_transaction_id.as_deref(),
                onchain_amount: s.onchain_amount,
                timeout_block_height: s.timeout_block_height,
            },
            AnySwap::Chain(s) => ClaimLeg {
                symbol: &s.receiving.symbol,
                key_index: s.receiving.key_index,
                swap_tree: s.receiving.swap_tree.as_deref(),
                their_public_key: s.receiving.their_public_key.as_deref(),
                lockup_transaction_id: s.receiving.lockup_transaction_id.as_deref(),
                onchain_amount: s.receiving.amount,
                timeout_block_height: s.receiving.timeout_block_height,
            },
        }
    }

    pub fn chain_symbol(&self) -> &str {
        self.claim_leg().symbol
    }

    pub fn timeout_block_height(&self) -> u32 {
        self.claim_leg().timeout_block_height
    }

    pub fn set_status(&mut self, status: SwapStatus) {
        match self {
            AnySwap::Submarine(s) => s.status = status,
            AnySwap::Chain(s) => s.status = status,
        }
    }

    pub fn set_miner_fee(&mut self, fee: u64) {
        match self {
            AnySwap::Submarine(s) => s.miner_fee = Some(fee),
            AnySwap::Chain(s) => s.receiving.miner_fee = Some(fee),
        }
    }

    pub fn miner_fee(&self) -> Option<u64> {
        match self {
            AnySwap::Submarine(s) => s.miner_fee,
            AnySwap::Chain(s) => s.receiving.miner_fee,
        }
    }
}

pub fn parse_public_key(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str).context("decode public key hex")?;
    PublicKey::from_slice(&bytes).context("parse public key")
}

pub fn parse_hash32(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).context("decode hash hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("hash must be 32 bytes"))
}
