mod support;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::schnorr;
use coop_settlement::config::SettlementConfig;
use coop_settlement::cooperative::eligibility::RefundRejectionReason;
use coop_settlement::cooperative::signer::ToSign;
use coop_settlement::error::SettlementError;
use coop_settlement::lightning::PaymentState;
use coop_settlement::swap::{SwapRecord, SwapStatus, SwapVersion};
use musig2::{AggNonce, PartialSignature, PubNonce};

use support::fakes::Scripted;
use support::fixtures::{Harness, LOCKUP_AMOUNT, Lockup, operator_address, verify_key_spend};

const TIMEOUT: u32 = 500;

fn harness() -> Result<Harness> {
    Harness::new(SettlementConfig::default())
}

fn failed_submarine(h: &Harness, id: &str) -> Result<Lockup> {
    let lockup = Lockup::fund(h, id, 1, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Submarine(
        lockup.submarine_swap(1, SwapStatus::InvoiceFailedToPay)?,
    ))?;
    Ok(lockup)
}

fn raw(tx: &bitcoin::Transaction) -> Vec<u8> {
    bitcoin::consensus::serialize(tx)
}

#[tokio::test]
async fn refund_partial_signature_completes_key_spend() -> Result<()> {
    let _ = coop_settlement::logging::init();
    let h = harness()?;
    let lockup = failed_submarine(&h, "swap-refund")?;

    let mut refund = lockup.spend(&operator_address(&h)?, 500)?;
    let sighash = lockup.key_spend_sighash(&refund)?;
    let user = lockup.user_session(lockup.operator_key, 9)?;

    let ours = h
        .signer
        .sign_swap_refund(
            "swap-refund",
            &user.pub_nonce.serialize(),
            &raw(&refund),
            0,
        )
        .await
        .context("sign refund")?;

    let operator_nonce = PubNonce::from_bytes(&ours.pub_nonce).map_err(anyhow::Error::msg)?;
    let operator_signature = PartialSignature::from_slice(&ours.partial_signature)?;
    let agg_nonce = AggNonce::sum([operator_nonce.clone(), user.pub_nonce.clone()]);
    musig2::verify_partial(
        &user.key_agg,
        operator_signature,
        &agg_nonce,
        lockup.operator_key,
        &operator_nonce,
        sighash,
    )
    .context("operator partial signature must verify")?;

    let key_agg = user.key_agg.clone();
    let user_signature = user.sign(&operator_nonce, sighash)?;
    let signature: schnorr::Signature = musig2::aggregate_partial_signatures(
        &key_agg,
        &agg_nonce,
        [operator_signature, user_signature],
        sighash,
    )?;
    refund.input[0].witness = bitcoin::Witness::from_slice(&[signature.serialize().to_vec()]);
    verify_key_spend(&refund, lockup.output_key()?, sighash)?;

    // Every request signs with a new nonce.
    let user = lockup.user_session(lockup.operator_key, 10)?;
    let again = h
        .signer
        .sign_swap_refund("swap-refund", &user.pub_nonce.serialize(), &raw(&refund), 0)
        .await?;
    assert_ne!(again.pub_nonce, ours.pub_nonce);
    Ok(())
}

#[tokio::test]
async fn refund_rejected_while_swap_is_not_failed() -> Result<()> {
    let h = harness()?;
    let lockup = Lockup::fund(&h, "swap-live", 1, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Submarine(
        lockup.submarine_swap(1, SwapStatus::TransactionConfirmed)?,
    ))?;

    let refund = lockup.spend(&operator_address(&h)?, 500)?;
    let user = lockup.user_session(lockup.operator_key, 1)?;
    let err = h
        .signer
        .sign_swap_refund("swap-live", &user.pub_nonce.serialize(), &raw(&refund), 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SettlementError::NotEligibleForCooperativeRefund(RefundRejectionReason::StatusNotEligible)
    ));

    h.signer.allow_refund("swap-live")?;
    h.signer
        .sign_swap_refund("swap-live", &user.pub_nonce.serialize(), &raw(&refund), 0)
        .await
        .context("explicitly allowed refund")?;
    Ok(())
}

#[tokio::test]
async fn refund_rejected_for_legacy_swaps() -> Result<()> {
    let h = harness()?;
    let lockup = Lockup::fund(&h, "swap-legacy", 1, LOCKUP_AMOUNT, TIMEOUT)?;
    let mut swap = lockup.submarine_swap(1, SwapStatus::SwapExpired)?;
    swap.version = SwapVersion::Legacy;
    h.insert(SwapRecord::Submarine(swap))?;

    let refund = lockup.spend(&operator_address(&h)?, 500)?;
    let user = lockup.user_session(lockup.operator_key, 1)?;
    let err = h
        .signer
        .sign_swap_refund("swap-legacy", &user.pub_nonce.serialize(), &raw(&refund), 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SettlementError::NotEligibleForCooperativeRefund(RefundRejectionReason::VersionNotTaproot)
    ));
    Ok(())
}

#[tokio::test]
async fn refund_waits_for_lightning_payment_outcome() -> Result<()> {
    let h = harness()?;
    let lockup = failed_submarine(&h, "swap-ln")?;
    let refund = lockup.spend(&operator_address(&h)?, 500)?;
    let nonce = lockup.user_session(lockup.operator_key, 1)?.pub_nonce.serialize();

    for answer in [
        Scripted::State(PaymentState::Pending),
        Scripted::State(PaymentState::Succeeded { preimage: lockup.preimage }),
        Scripted::Error,
    ] {
        h.lightning.set_answer(answer);
        let err = h
            .signer
            .sign_swap_refund("swap-ln", &nonce, &raw(&refund), 0)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                SettlementError::NotEligibleForCooperativeRefund(
                    RefundRejectionReason::LightningPaymentPending
                )
            ),
            "{answer:?}: {err}"
        );
    }

    h.lightning.set_answer(Scripted::State(PaymentState::Failed));
    h.signer
        .sign_swap_refund("swap-ln", &nonce, &raw(&refund), 0)
        .await
        .context("refund after failed payment")?;
    Ok(())
}

#[tokio::test]
async fn refund_input_validation() -> Result<()> {
    let h = harness()?;
    let lockup = failed_submarine(&h, "swap-input")?;
    let refund = lockup.spend(&operator_address(&h)?, 500)?;
    let nonce = lockup.user_session(lockup.operator_key, 1)?.pub_nonce.serialize();

    let err = h
        .signer
        .sign_swap_refund("swap-input", &nonce, &raw(&refund), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidVin { vin: 1, inputs: 1 }));
    assert!(err.is_validation());

    let err = h
        .signer
        .sign_swap_refund("swap-input", &nonce[..33], &raw(&refund), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidNonce));

    let err = h
        .signer
        .sign_swap_refund("swap-input", &nonce, &[0xde, 0xad], 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidTransaction(_)));

    let err = h
        .signer
        .sign_swap_refund("missing", &nonce, &raw(&refund), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::SwapNotFound(_)));

    let err = h.signer.allow_refund("missing").unwrap_err();
    assert!(matches!(err, SettlementError::SwapNotFound(_)));
    Ok(())
}

#[tokio::test]
async fn chain_swap_refund_ignores_lightning() -> Result<()> {
    let h = harness()?;
    h.lightning.set_answer(Scripted::State(PaymentState::Pending));

    let lockup = Lockup::fund(&h, "swap-chain", 2, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Chain(
        lockup.chain_swap(2, SwapStatus::TransactionLockupFailed)?,
    ))?;

    let refund = lockup.spend(&operator_address(&h)?, 500)?;
    let sighash = lockup.key_spend_sighash(&refund)?;
    let user = lockup.user_session(lockup.operator_key, 3)?;
    let ours = h
        .signer
        .sign_chain_swap_refund("swap-chain", &user.pub_nonce.serialize(), &raw(&refund), 0)
        .await
        .context("sign chain swap refund")?;

    let operator_nonce = PubNonce::from_bytes(&ours.pub_nonce).map_err(anyhow::Error::msg)?;
    let agg_nonce = AggNonce::sum([operator_nonce.clone(), user.pub_nonce.clone()]);
    musig2::verify_partial(
        &user.key_agg,
        PartialSignature::from_slice(&ours.partial_signature)?,
        &agg_nonce,
        lockup.operator_key,
        &operator_nonce,
        sighash,
    )
    .context("operator partial signature must verify")?;

    // A submarine lookup does not find chain swaps.
    let err = h
        .signer
        .sign_swap_refund("swap-chain", &user.pub_nonce.serialize(), &raw(&refund), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::SwapNotFound(_)));
    Ok(())
}

#[tokio::test]
async fn chain_swap_refund_rejected_before_failure() -> Result<()> {
    let h = harness()?;
    let lockup = Lockup::fund(&h, "swap-chain", 2, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Chain(
        lockup.chain_swap(2, SwapStatus::TransactionServerMempool)?,
    ))?;

    let refund = lockup.spend(&operator_address(&h)?, 500)?;
    let nonce = lockup.user_session(lockup.operator_key, 1)?.pub_nonce.serialize();
    let err = h
        .signer
        .sign_chain_swap_refund("swap-chain", &nonce, &raw(&refund), 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SettlementError::NotEligibleForCooperativeRefund(RefundRejectionReason::StatusNotEligible)
    ));
    Ok(())
}

#[tokio::test]
async fn reverse_claim_settles_invoice_once() -> Result<()> {
    let h = harness()?;
    let lockup = Lockup::fund(&h, "swap-reverse", 4, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Reverse(
        lockup.reverse_swap(4, SwapStatus::TransactionMempool)?,
    ))?;

    let signature = h
        .signer
        .sign_reverse_swap_claim("swap-reverse", &lockup.preimage, None)
        .await
        .context("settle without signing")?;
    assert!(signature.is_none());
    assert_eq!(h.lightning.settled_invoices(), 1);

    let SwapRecord::Reverse(stored) = h.stored("swap-reverse")? else {
        anyhow::bail!("expected a reverse swap");
    };
    assert_eq!(stored.status, SwapStatus::InvoiceSettled);
    assert_eq!(stored.preimage, Some(hex::encode(lockup.preimage)));

    let claim = lockup.spend(&operator_address(&h)?, 400)?;
    let sighash = lockup.key_spend_sighash(&claim)?;
    let user = lockup.user_session(lockup.operator_key, 5)?;
    let signature = h
        .signer
        .sign_reverse_swap_claim(
            "swap-reverse",
            &lockup.preimage,
            Some(ToSign {
                pub_nonce: user.pub_nonce.serialize().to_vec(),
                transaction: raw(&claim),
                index: 0,
            }),
        )
        .await?
        .context("partial signature for claim")?;
    assert_eq!(h.lightning.settled_invoices(), 1);

    let operator_nonce = PubNonce::from_bytes(&signature.pub_nonce).map_err(anyhow::Error::msg)?;
    let agg_nonce = AggNonce::sum([operator_nonce.clone(), user.pub_nonce.clone()]);
    musig2::verify_partial(
        &user.key_agg,
        PartialSignature::from_slice(&signature.partial_signature)?,
        &agg_nonce,
        lockup.operator_key,
        &operator_nonce,
        sighash,
    )
    .context("operator partial signature must verify")?;
    Ok(())
}

#[tokio::test]
async fn reverse_claim_checks_preimage_and_status() -> Result<()> {
    let h = harness()?;
    let lockup = Lockup::fund(&h, "swap-reverse", 4, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Reverse(
        lockup.reverse_swap(4, SwapStatus::TransactionConfirmed)?,
    ))?;

    let err = h
        .signer
        .sign_reverse_swap_claim("swap-reverse", &[1u8; 32], None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::IncorrectPreimage));

    let err = h
        .signer
        .sign_reverse_swap_claim("swap-reverse", &lockup.preimage[..31], None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::IncorrectPreimage));
    assert_eq!(h.lightning.settled_invoices(), 0);

    let other = Lockup::fund(&h, "swap-created", 5, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Reverse(
        other.reverse_swap(5, SwapStatus::SwapCreated)?,
    ))?;
    let err = h
        .signer
        .sign_reverse_swap_claim("swap-created", &other.preimage, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::NotEligibleForCooperativeClaim));
    assert_eq!(h.lightning.settled_invoices(), 0);
    Ok(())
}

#[tokio::test]
async fn chain_claim_signs_sending_leg() -> Result<()> {
    let h = harness()?;
    let lockup = Lockup::fund(&h, "swap-chain-claim", 6, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Chain(
        lockup.chain_swap_sending(6, SwapStatus::TransactionServerConfirmed)?,
    ))?;

    let signature = h
        .signer
        .sign_chain_swap_claim("swap-chain-claim", &lockup.preimage, None)
        .await
        .context("check preimage without signing")?;
    assert!(signature.is_none());
    let SwapRecord::Chain(stored) = h.stored("swap-chain-claim")? else {
        anyhow::bail!("expected a chain swap");
    };
    assert_eq!(stored.preimage, Some(hex::encode(lockup.preimage)));

    let mut claim = lockup.spend(&operator_address(&h)?, 400)?;
    let sighash = lockup.key_spend_sighash(&claim)?;
    let user = lockup.user_session(lockup.operator_key, 11)?;
    let ours = h
        .signer
        .sign_chain_swap_claim(
            "swap-chain-claim",
            &lockup.preimage,
            Some(ToSign {
                pub_nonce: user.pub_nonce.serialize().to_vec(),
                transaction: raw(&claim),
                index: 0,
            }),
        )
        .await?
        .context("partial signature for sending leg claim")?;

    let operator_nonce = PubNonce::from_bytes(&ours.pub_nonce).map_err(anyhow::Error::msg)?;
    let operator_signature = PartialSignature::from_slice(&ours.partial_signature)?;
    let agg_nonce = AggNonce::sum([operator_nonce.clone(), user.pub_nonce.clone()]);
    let key_agg = user.key_agg.clone();
    let user_signature = user.sign(&operator_nonce, sighash)?;
    let signature: schnorr::Signature = musig2::aggregate_partial_signatures(
        &key_agg,
        &agg_nonce,
        [operator_signature, user_signature],
        sighash,
    )?;
    claim.input[0].witness = bitcoin::Witness::from_slice(&[signature.serialize().to_vec()]);
    verify_key_spend(&claim, lockup.output_key()?, sighash)?;
    Ok(())
}

#[tokio::test]
async fn chain_claim_checks_preimage_and_status() -> Result<()> {
    let h = harness()?;
    let lockup = Lockup::fund(&h, "swap-chain-claim", 6, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Chain(
        lockup.chain_swap_sending(6, SwapStatus::TransactionServerMempool)?,
    ))?;

    let claim = lockup.spend(&operator_address(&h)?, 400)?;
    let user = lockup.user_session(lockup.operator_key, 12)?;
    let err = h
        .signer
        .sign_chain_swap_claim(
            "swap-chain-claim",
            &[3u8; 32],
            Some(ToSign {
                pub_nonce: user.pub_nonce.serialize().to_vec(),
                transaction: raw(&claim),
                index: 0,
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::IncorrectPreimage));
    let SwapRecord::Chain(stored) = h.stored("swap-chain-claim")? else {
        anyhow::bail!("expected a chain swap");
    };
    assert_eq!(stored.preimage, None);

    // Nothing is locked on the sending leg yet.
    let early = Lockup::fund(&h, "swap-chain-early", 7, LOCKUP_AMOUNT, TIMEOUT)?;
    h.insert(SwapRecord::Chain(
        early.chain_swap_sending(7, SwapStatus::SwapCreated)?,
    ))?;
    let err = h
        .signer
        .sign_chain_swap_claim("swap-chain-early", &early.preimage, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::NotEligibleForCooperativeClaim));

    let err = h
        .signer
        .sign_chain_swap_claim("missing", &early.preimage, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::SwapNotFound(_)));
    Ok(())
}
