use std::fmt;
use std::sync::Arc;

use bitcoin::hashes::{Hash as _, sha256};

use crate::error::SettlementError;
use crate::lightning::LightningClient;
use crate::swap::{ChainSwap, SubmarineSwap, SwapStatus, SwapVersion, parse_hash32};

/// Statuses in which a reverse swap claim may be co-signed.
pub const REVERSE_CLAIM_STATUSES: [SwapStatus; 3] = [
    SwapStatus::TransactionMempool,
    SwapStatus::TransactionConfirmed,
    SwapStatus::InvoiceSettled,
];

/// Statuses in which the user's claim of a chain swap's sending leg may be
/// co-signed. The server lockup must exist; our own claim of the receiving
/// leg may already be queued or done.
pub const CHAIN_CLAIM_STATUSES: [SwapStatus; 4] = [
    SwapStatus::TransactionServerMempool,
    SwapStatus::TransactionServerConfirmed,
    SwapStatus::TransactionClaimPending,
    SwapStatus::TransactionClaimed,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundRejectionReason {
    VersionNotTaproot,
    StatusNotEligible,
    LightningPaymentPending,
}

impl fmt::Display for RefundRejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefundRejectionReason::VersionNotTaproot => "swap version is not Taproot",
            RefundRejectionReason::StatusNotEligible => "status not eligible",
            RefundRejectionReason::LightningPaymentPending => {
                "lightning payment still in progress, try again in a couple minutes"
            }
        })
    }
}

/// Returns the preimage as a fixed array if it hashes to `preimage_hash_hex`.
pub fn check_preimage(preimage_hash_hex: &str, preimage: &[u8]) -> Result<[u8; 32], SettlementError> {
    let preimage: [u8; 32] = preimage
        .try_into()
        .map_err(|_| SettlementError::IncorrectPreimage)?;
    let expected = parse_hash32(preimage_hash_hex).map_err(|_| SettlementError::IncorrectPreimage)?;

    if sha256::Hash::hash(&preimage).to_byte_array() != expected {
        return Err(SettlementError::IncorrectPreimage);
    }
    Ok(preimage)
}

/// Claims may only be co-signed for Taproot swaps in one of `allowed`.
pub fn check_claim(
    version: SwapVersion,
    status: SwapStatus,
    allowed: &[SwapStatus],
) -> Result<(), SettlementError> {
    if version != SwapVersion::Taproot || !allowed.contains(&status) {
        return Err(SettlementError::NotEligibleForCooperativeClaim);
    }
    Ok(())
}

/// True unless every client positively reports the payment as failed or unknown.
///
/// A lookup error counts as ambiguous.
pub async fn has_pending_lightning_payment(
    clients: &[Arc<dyn LightningClient>],
    preimage_hash: &[u8; 32],
    invoice: Option<&str>,
) -> bool {
    for client in clients {
        match client.payment_state(preimage_hash, invoice).await {
            Ok(state) if state.may_succeed() => {
                tracing::debug!(
                    client = client.name(),
                    ?state,
                    "lightning payment may still succeed"
                );
                return true;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    client = client.name(),
                    error = %err,
                    "lightning payment lookup failed"
                );
                return true;
            }
        }
    }
    false
}

pub async fn submarine_refund_rejection(
    swap: &SubmarineSwap,
    lightning_clients: &[Arc<dyn LightningClient>],
) -> Option<RefundRejectionReason> {
    if swap.version != SwapVersion::Taproot {
        return Some(RefundRejectionReason::VersionNotTaproot);
    }
    if !swap.status.is_failed() {
        return Some(RefundRejectionReason::StatusNotEligible);
    }

    let Ok(preimage_hash) = parse_hash32(&swap.preimage_hash) else {
        return Some(RefundRejectionReason::LightningPaymentPending);
    };
    if has_pending_lightning_payment(lightning_clients, &preimage_hash, swap.invoice.as_deref())
        .await
    {
        return Some(RefundRejectionReason::LightningPaymentPending);
    }

    None
}

pub fn chain_swap_refund_rejection(swap: &ChainSwap) -> Option<RefundRejectionReason> {
    if swap.version != SwapVersion::Taproot {
        return Some(RefundRejectionReason::VersionNotTaproot);
    }
    if !swap.status.is_failed() {
        return Some(RefundRejectionReason::StatusNotEligible);
    }
    None
}
