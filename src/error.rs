use crate::cooperative::eligibility::RefundRejectionReason;

pub type SettlementResult<T> = std::result::Result<T, SettlementError>;

/// Errors surfaced by the settlement engine.
///
/// Validation and eligibility failures are final for the given input; only
/// [`SettlementError::Infrastructure`] is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("could not find swap with id: {0}")]
    SwapNotFound(String),

    #[error("input index {vin} out of range for transaction with {inputs} inputs")]
    InvalidVin { vin: u32, inputs: usize },

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid public nonce")]
    InvalidNonce,

    #[error("invalid partial signature encoding")]
    InvalidPartialSignatureEncoding,

    #[error("could not find currency: {0}")]
    CurrencyNotFound(String),

    #[error("swap not eligible for a cooperative refund: {0}")]
    NotEligibleForCooperativeRefund(RefundRejectionReason),

    #[error("swap not eligible for a cooperative claim")]
    NotEligibleForCooperativeClaim,

    #[error("swap not eligible for a cooperative claim broadcast")]
    NotEligibleForCooperativeClaimBroadcast,

    #[error("incorrect preimage")]
    IncorrectPreimage,

    #[error("invalid partial signature")]
    InvalidPartialSignature,

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl SettlementError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidVin { .. }
                | Self::InvalidTransaction(_)
                | Self::InvalidNonce
                | Self::InvalidPartialSignatureEncoding
                | Self::CurrencyNotFound(_)
        )
    }
}
