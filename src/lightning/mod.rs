pub mod invoice;
pub mod ldk;

use anyhow::Result;

/// Outcome of our outgoing payment for a swap, as seen by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Pending,
    Succeeded { preimage: [u8; 32] },
    Failed,
    NotFound,
}

impl PaymentState {
    /// Anything but a definitive failure (or no attempt at all) may still pay out.
    pub fn may_succeed(&self) -> bool {
        matches!(self, PaymentState::Pending | PaymentState::Succeeded { .. })
    }
}

#[async_trait::async_trait]
pub trait LightningClient: Send + Sync {
    fn name(&self) -> &str;

    /// Looks up the payment for `preimage_hash`, falling back to `invoice`.
    async fn payment_state(
        &self,
        preimage_hash: &[u8; 32],
        invoice: Option<&str>,
    ) -> Result<PaymentState>;

    /// Settles the hold invoice locked to `sha256(preimage)`.
    async fn settle_hold_invoice(&self, preimage: &[u8; 32]) -> Result<()>;
}
