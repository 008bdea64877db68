use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::cooperative::deferred::DeferredClaimer;
use crate::cooperative::signer::{self, MusigSigner, ToSign};
use crate::error::SettlementError;
use crate::proto::v1 as pb;
use crate::swap::SwapKind;

/// gRPC surface of the settlement engine.
#[derive(Clone)]
pub struct SettlementServiceImpl {
    claimer: Arc<DeferredClaimer>,
    signer: Arc<MusigSigner>,
}

impl SettlementServiceImpl {
    pub fn new(claimer: Arc<DeferredClaimer>, signer: Arc<MusigSigner>) -> Self {
        Self { claimer, signer }
    }
}

fn status_from_error(err: SettlementError) -> Status {
    match &err {
        SettlementError::SwapNotFound(_) => Status::not_found(err.to_string()),
        SettlementError::Infrastructure(e) => Status::internal(format!("{e:#}")),
        e if e.is_validation() => Status::invalid_argument(err.to_string()),
        _ => Status::failed_precondition(err.to_string()),
    }
}

fn require_swap_id(swap_id: &str) -> Result<(), Status> {
    if swap_id.trim().is_empty() {
        return Err(Status::invalid_argument("swap_id is required"));
    }
    Ok(())
}

fn swap_ids(ids: Vec<String>) -> pb::SwapIds {
    pb::SwapIds { swap_ids: ids }
}

fn partial_signature_to_proto(sig: signer::PartialSignature) -> pb::PartialSignature {
    pb::PartialSignature {
        pub_nonce: sig.pub_nonce,
        partial_signature: sig.partial_signature,
    }
}

fn to_sign_from_proto(to_sign: pb::ToSign) -> ToSign {
    ToSign {
        pub_nonce: to_sign.pub_nonce,
        transaction: to_sign.transaction,
        index: to_sign.index,
    }
}

fn claimed_to_proto(claimed: BTreeMap<String, Vec<String>>) -> HashMap<String, pb::SwapIds> {
    claimed
        .into_iter()
        .map(|(symbol, ids)| (symbol, swap_ids(ids)))
        .collect()
}

#[tonic::async_trait]
impl pb::settlement_service_server::SettlementService for SettlementServiceImpl {
    async fn pending_sweeps(
        &self,
        _request: Request<pb::PendingSweepsRequest>,
    ) -> Result<Response<pb::PendingSweepsResponse>, Status> {
        let mut resp = pb::PendingSweepsResponse::default();
        for (symbol, by_kind) in self.claimer.pending_sweeps() {
            for (kind, ids) in by_kind {
                let target = match kind {
                    SwapKind::Submarine => &mut resp.submarine,
                    SwapKind::Chain => &mut resp.chain,
                    SwapKind::Reverse => continue,
                };
                target.insert(symbol.clone(), swap_ids(ids));
            }
        }
        Ok(Response::new(resp))
    }

    async fn sweep(
        &self,
        request: Request<pb::SweepRequest>,
    ) -> Result<Response<pb::SweepResponse>, Status> {
        let req = request.into_inner();

        let claimed = match req.symbol {
            Some(symbol) => {
                let ids = self
                    .claimer
                    .sweep_symbol(&symbol)
                    .await
                    .map_err(status_from_error)?;
                BTreeMap::from([(symbol, ids)])
            }
            None => self.claimer.sweep().await,
        };

        Ok(Response::new(pb::SweepResponse {
            claimed: claimed_to_proto(claimed),
        }))
    }

    async fn get_cooperative_details(
        &self,
        request: Request<pb::GetCooperativeDetailsRequest>,
    ) -> Result<Response<pb::CooperativeDetails>, Status> {
        let req = request.into_inner();
        require_swap_id(&req.swap_id)?;

        let details = self
            .claimer
            .get_cooperative_details(&req.swap_id)
            .await
            .map_err(status_from_error)?;

        Ok(Response::new(pb::CooperativeDetails {
            preimage: details.preimage.to_vec(),
            pub_nonce: details.pub_nonce,
            public_key: details.public_key,
            transaction_hash: details.transaction_hash.to_vec(),
        }))
    }

    async fn broadcast_cooperative(
        &self,
        request: Request<pb::BroadcastCooperativeRequest>,
    ) -> Result<Response<pb::BroadcastCooperativeResponse>, Status> {
        let req = request.into_inner();
        require_swap_id(&req.swap_id)?;

        let transaction_id = self
            .claimer
            .broadcast_cooperative(&req.swap_id, &req.pub_nonce, &req.partial_signature)
            .await
            .map_err(status_from_error)?;

        Ok(Response::new(pb::BroadcastCooperativeResponse { transaction_id }))
    }

    async fn sign_refund(
        &self,
        request: Request<pb::SignRefundRequest>,
    ) -> Result<Response<pb::PartialSignature>, Status> {
        let req = request.into_inner();
        require_swap_id(&req.swap_id)?;

        let sig = self
            .signer
            .sign_swap_refund(&req.swap_id, &req.pub_nonce, &req.transaction, req.index)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(partial_signature_to_proto(sig)))
    }

    async fn sign_chain_swap_refund(
        &self,
        request: Request<pb::SignRefundRequest>,
    ) -> Result<Response<pb::PartialSignature>, Status> {
        let req = request.into_inner();
        require_swap_id(&req.swap_id)?;

        let sig = self
            .signer
            .sign_chain_swap_refund(&req.swap_id, &req.pub_nonce, &req.transaction, req.index)
            .await
            .map_err(status_from_error)?;
        Ok(Response::new(partial_signature_to_proto(sig)))
    }

    async fn sign_reverse_swap_claim(
        &self,
        request: Request<pb::SignReverseSwapClaimRequest>,
    ) -> Result<Response<pb::SignReverseSwapClaimResponse>, Status> {
        let req = request.into_inner();
        require_swap_id(&req.swap_id)?;

        let to_sign = req.to_sign.map(to_sign_from_proto);
        let signature = self
            .signer
            .sign_reverse_swap_claim(&req.swap_id, &req.preimage, to_sign)
            .await
            .map_err(status_from_error)?;

        Ok(Response::new(pb::SignReverseSwapClaimResponse {
            signature: signature.map(partial_signature_to_proto),
        }))
    }

    async fn sign_chain_swap_claim(
        &self,
        request: Request<pb::SignChainSwapClaimRequest>,
    ) -> Result<Response<pb::SignChainSwapClaimResponse>, Status> {
        let req = request.into_inner();
        require_swap_id(&req.swap_id)?;

        let to_sign = req.to_sign.map(to_sign_from_proto);
        let signature = self
            .signer
            .sign_chain_swap_claim(&req.swap_id, &req.preimage, to_sign)
            .await
            .map_err(status_from_error)?;

        Ok(Response::new(pb::SignChainSwapClaimResponse {
            signature: signature.map(partial_signature_to_proto),
        }))
    }

    async fn allow_refund(
        &self,
        request: Request<pb::AllowRefundRequest>,
    ) -> Result<Response<pb::AllowRefundResponse>, Status> {
        let req = request.into_inner();
        require_swap_id(&req.swap_id)?;

        self.signer
            .allow_refund(&req.swap_id)
            .map_err(status_from_error)?;
        Ok(Response::new(pb::AllowRefundResponse {}))
    }
}
