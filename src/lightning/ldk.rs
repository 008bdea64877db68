use anyhow::{Context as _, Result};
use ldk_server_client::client::LdkServerClient;
use ldk_server_protos::api::ListPaymentsRequest;
use ldk_server_protos::types::{PaymentDirection, PaymentStatus, payment_kind};

use super::invoice::payment_hash_from_bolt11;
use super::{LightningClient, PaymentState};

#[derive(Clone)]
pub struct LdkLightningClient {
    name: String,
    client: LdkServerClient,
}

impl LdkLightningClient {
    pub fn new(name: impl Into<String>, rest_service_address: String) -> Self {
        Self {
            name: name.into(),
            client: LdkServerClient::new(rest_service_address),
        }
    }
}

#[async_trait::async_trait]
impl LightningClient for LdkLightningClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn payment_state(
        &self,
        preimage_hash: &[u8; 32],
        invoice: Option<&str>,
    ) -> Result<PaymentState> {
        if let Some(invoice) = invoice {
            let invoice_hash = payment_hash_from_bolt11(invoice).context("decode swap invoice")?;
            anyhow::ensure!(
                &invoice_hash == preimage_hash,
                "invoice payment hash does not match swap preimage hash"
            );
        }

        let hash_hex = hex::encode(preimage_hash);
        let payments = self
            .client
            .list_payments(ListPaymentsRequest { page_token: None })
            .await
            .context("ListPayments")?
            .payments;

        let Some(payment) = payments.into_iter().find(|p| {
            p.direction == PaymentDirection::Outbound as i32
                && matches!(
                    p.kind.as_ref().and_then(|k| k.kind.as_ref()),
                    Some(payment_kind::Kind::Bolt11(b)) if b.hash == hash_hex
                )
        }) else {
            return Ok(PaymentState::NotFound);
        };

        match PaymentStatus::try_from(payment.status) {
            Ok(PaymentStatus::Pending) => Ok(PaymentState::Pending),
            Ok(PaymentStatus::Failed) => Ok(PaymentState::Failed),
            Ok(PaymentStatus::Succeeded) => {
                let preimage_hex = payment
                    .kind
                    .and_then(|k| k.kind)
                    .and_then(|k| match k {
                        payment_kind::Kind::Bolt11(b) => b.preimage,
                        _ => None,
                    })
                    .context("missing payment preimage")?;

                let bytes = hex::decode(preimage_hex).context("decode preimage hex")?;
                let preimage: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("preimage must be 32 bytes"))?;
                Ok(PaymentState::Succeeded { preimage })
            }
            Err(_) => anyhow::bail!("unknown payment status: {}", payment.status),
        }
    }

    async fn settle_hold_invoice(&self, _preimage: &[u8; 32]) -> Result<()> {
        anyhow::bail!("{}: ldk-server does not support hold invoices", self.name)
    }
}
