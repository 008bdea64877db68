use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use coop_settlement::proto::v1::settlement_service_client::SettlementServiceClient;
use coop_settlement::proto::v1::{
    AllowRefundRequest, BroadcastCooperativeRequest, GetCooperativeDetailsRequest,
    PartialSignature, PendingSweepsRequest, SignChainSwapClaimRequest, SignRefundRequest,
    SignReverseSwapClaimRequest, SweepRequest, SwapIds, ToSign,
};
use serde_json::{Value, json};

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "SETTLEMENT_GRPC_URL", default_value = "http://127.0.0.1:50061")]
    grpc_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    PendingSweeps,
    Sweep {
        /// Sweep only this symbol.
        #[arg(long)]
        symbol: Option<String>,
    },
    GetCooperativeDetails {
        #[arg(long)]
        swap_id: String,
    },
    BroadcastCooperative {
        #[arg(long)]
        swap_id: String,

        /// Hex encoded public nonce.
        #[arg(long)]
        pub_nonce: String,

        /// Hex encoded partial signature.
        #[arg(long)]
        partial_signature: String,
    },
    SignRefund {
        #[arg(long)]
        swap_id: String,

        #[arg(long)]
        pub_nonce: String,

        /// Hex encoded refund transaction.
        #[arg(long)]
        transaction: String,

        #[arg(long, default_value_t = 0)]
        index: u32,

        /// Refund of a chain swap instead of a submarine swap.
        #[arg(long)]
        chain: bool,
    },
    SignReverseSwapClaim {
        #[command(flatten)]
        claim: ClaimArgs,
    },
    /// Co-sign the user's claim of the leg we locked in a chain swap.
    SignChainSwapClaim {
        #[command(flatten)]
        claim: ClaimArgs,
    },
    AllowRefund {
        #[arg(long)]
        swap_id: String,
    },
}

#[derive(Debug, clap::Args)]
struct ClaimArgs {
    #[arg(long)]
    swap_id: String,

    #[arg(long)]
    preimage: String,

    #[arg(long, requires = "transaction")]
    pub_nonce: Option<String>,

    #[arg(long, requires = "pub_nonce")]
    transaction: Option<String>,

    #[arg(long, default_value_t = 0)]
    index: u32,
}

impl ClaimArgs {
    fn to_sign(&self) -> Result<Option<ToSign>> {
        Ok(match (&self.pub_nonce, &self.transaction) {
            (Some(pub_nonce), Some(transaction)) => Some(ToSign {
                pub_nonce: decode_hex("pub_nonce", pub_nonce)?,
                transaction: decode_hex("transaction", transaction)?,
                index: self.index,
            }),
            _ => None,
        })
    }
}

fn signature_json(sig: Option<PartialSignature>) -> Value {
    json!({
      "signature": sig.map(|sig| json!({
        "pub_nonce": hex::encode(sig.pub_nonce),
        "partial_signature": hex::encode(sig.partial_signature),
      })),
    })
}

fn decode_hex(name: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).with_context(|| format!("decode {name} hex"))
}

fn ids_json(map: std::collections::HashMap<String, SwapIds>) -> Value {
    let mut symbols: Vec<_> = map.into_iter().collect();
    symbols.sort_by(|a, b| a.0.cmp(&b.0));
    Value::Object(
        symbols
            .into_iter()
            .map(|(symbol, ids)| (symbol, json!(ids.swap_ids)))
            .collect(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    coop_settlement::logging::init().ok();
    let args = Args::parse();

    let mut client = SettlementServiceClient::connect(args.grpc_url)
        .await
        .context("connect gRPC")?;

    let out = match args.command {
        Command::PendingSweeps => {
            let resp = client
                .pending_sweeps(PendingSweepsRequest {})
                .await
                .context("PendingSweeps")?
                .into_inner();

            json!({
              "submarine": ids_json(resp.submarine),
              "chain": ids_json(resp.chain),
            })
        }
        Command::Sweep { symbol } => {
            let resp = client
                .sweep(SweepRequest { symbol })
                .await
                .context("Sweep")?
                .into_inner();

            json!({ "claimed": ids_json(resp.claimed) })
        }
        Command::GetCooperativeDetails { swap_id } => {
            let details = client
                .get_cooperative_details(GetCooperativeDetailsRequest { swap_id })
                .await
                .context("GetCooperativeDetails")?
                .into_inner();

            json!({
              "preimage": hex::encode(details.preimage),
              "pub_nonce": hex::encode(details.pub_nonce),
              "public_key": hex::encode(details.public_key),
              "transaction_hash": hex::encode(details.transaction_hash),
            })
        }
        Command::BroadcastCooperative {
            swap_id,
            pub_nonce,
            partial_signature,
        } => {
            let resp = client
                .broadcast_cooperative(BroadcastCooperativeRequest {
                    swap_id,
                    pub_nonce: decode_hex("pub_nonce", &pub_nonce)?,
                    partial_signature: decode_hex("partial_signature", &partial_signature)?,
                })
                .await
                .context("BroadcastCooperative")?
                .into_inner();

            json!({ "transaction_id": resp.transaction_id })
        }
        Command::SignRefund {
            swap_id,
            pub_nonce,
            transaction,
            index,
            chain,
        } => {
            let req = SignRefundRequest {
                swap_id,
                pub_nonce: decode_hex("pub_nonce", &pub_nonce)?,
                transaction: decode_hex("transaction", &transaction)?,
                index,
            };
            let sig = if chain {
                client
                    .sign_chain_swap_refund(req)
                    .await
                    .context("SignChainSwapRefund")?
            } else {
                client.sign_refund(req).await.context("SignRefund")?
            }
            .into_inner();

            json!({
              "pub_nonce": hex::encode(sig.pub_nonce),
              "partial_signature": hex::encode(sig.partial_signature),
            })
        }
        Command::SignReverseSwapClaim { claim } => {
            let resp = client
                .sign_reverse_swap_claim(SignReverseSwapClaimRequest {
                    to_sign: claim.to_sign()?,
                    preimage: decode_hex("preimage", &claim.preimage)?,
                    swap_id: claim.swap_id,
                })
                .await
                .context("SignReverseSwapClaim")?
                .into_inner();

            signature_json(resp.signature)
        }
        Command::SignChainSwapClaim { claim } => {
            let resp = client
                .sign_chain_swap_claim(SignChainSwapClaimRequest {
                    to_sign: claim.to_sign()?,
                    preimage: decode_hex("preimage", &claim.preimage)?,
                    swap_id: claim.swap_id,
                })
                .await
                .context("SignChainSwapClaim")?
                .into_inner();

            signature_json(resp.signature)
        }
        Command::AllowRefund { swap_id } => {
            client
                .allow_refund(AllowRefundRequest {
                    swap_id: swap_id.clone(),
                })
                .await
                .context("AllowRefund")?;

            json!({ "swap_id": swap_id, "allowed": true })
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
