use std::fmt;

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::{Keypair, PublicKey, SecretKey, XOnlyPublicKey, schnorr};
use musig2::{AggNonce, KeyAggContext, PartialSignature, PubNonce, SecNonce};
use rand::RngCore as _;

use crate::error::SettlementError;
use crate::swap::tree::SwapTree;

/// Untweaked MuSig2 aggregate of `[ours, theirs]`, the taproot internal key of a swap.
pub fn aggregate_internal_key(ours: PublicKey, theirs: PublicKey) -> Result<XOnlyPublicKey> {
    let key_agg = KeyAggContext::new([ours, theirs]).context("aggregate public keys")?;
    let aggregate: PublicKey = key_agg.aggregated_pubkey();
    Ok(aggregate.x_only_public_key().0)
}

pub fn parse_pub_nonce(bytes: &[u8]) -> Result<PubNonce, SettlementError> {
    PubNonce::from_bytes(bytes).map_err(|_| SettlementError::InvalidNonce)
}

pub fn parse_partial_signature(bytes: &[u8]) -> Result<PartialSignature, SettlementError> {
    PartialSignature::from_slice(bytes).map_err(|_| SettlementError::InvalidPartialSignatureEncoding)
}

/// One 2-of-2 MuSig2 signing round between us and a counterparty.
///
/// The secret nonce is consumed by [`MusigSession::sign_partial`], so a
/// session yields at most one partial signature, and the message is fixed by
/// the first [`MusigSession::initialize_session`] call.
#[derive(Clone)]
pub struct MusigSession {
    our_keys: Keypair,
    their_public_key: PublicKey,
    key_agg: KeyAggContext,
    internal_key: XOnlyPublicKey,
    tweaked: bool,
    sec_nonce: Option<SecNonce>,
    pub_nonce: PubNonce,
    their_nonce: Option<PubNonce>,
    agg_nonce: Option<AggNonce>,
    message: Option<[u8; 32]>,
}

impl fmt::Debug for MusigSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MusigSession")
            .field("our_public_key", &self.our_keys.public_key())
            .field("their_public_key", &self.their_public_key)
            .field("internal_key", &self.internal_key)
            .field("tweaked", &self.tweaked)
            .field("nonce_used", &self.sec_nonce.is_none())
            .finish_non_exhaustive()
    }
}

impl MusigSession {
    pub fn new(our_keys: Keypair, their_public_key: PublicKey) -> Result<Self> {
        let key_agg = KeyAggContext::new([our_keys.public_key(), their_public_key])
            .context("aggregate public keys")?;
        let aggregate: PublicKey = key_agg.aggregated_pubkey();

        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let sec_nonce = SecNonce::build_with_seckey(seed, our_keys.secret_key())
            .with_aggregated_pubkey(aggregate)
            .build();
        let pub_nonce = sec_nonce.public_nonce();

        Ok(Self {
            our_keys,
            their_public_key,
            key_agg,
            internal_key: aggregate.x_only_public_key().0,
            tweaked: false,
            sec_nonce: Some(sec_nonce),
            pub_nonce,
            their_nonce: None,
            agg_nonce: None,
            message: None,
        })
    }

    pub fn our_public_key(&self) -> PublicKey {
        self.our_keys.public_key()
    }

    pub fn their_public_key(&self) -> PublicKey {
        self.their_public_key
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.internal_key
    }

    pub fn public_nonce(&self) -> &PubNonce {
        &self.pub_nonce
    }

    /// Aggregate key the final signature verifies against.
    pub fn aggregated_public_key(&self) -> XOnlyPublicKey {
        let aggregate: PublicKey = self.key_agg.aggregated_pubkey();
        aggregate.x_only_public_key().0
    }

    /// Commits the aggregate key to `tree` with the taproot tweak of the tree's chain.
    pub fn tweak(&mut self, tree: &SwapTree) -> Result<()> {
        anyhow::ensure!(!self.tweaked, "musig session already tweaked");

        let tweak = tree
            .tap_tweak(self.internal_key)
            .context("compute taproot tweak")?;
        let tweak = SecretKey::from_slice(&tweak).context("taproot tweak out of range")?;

        self.key_agg = self
            .key_agg
            .clone()
            .with_tweak(tweak, true)
            .context("apply taproot tweak")?;
        self.tweaked = true;
        Ok(())
    }

    pub fn aggregate_nonces(&mut self, their_nonce: PubNonce) -> Result<()> {
        anyhow::ensure!(
            self.sec_nonce.is_some(),
            "musig session nonce already used"
        );
        self.agg_nonce = Some(AggNonce::sum([self.pub_nonce.clone(), their_nonce.clone()]));
        self.their_nonce = Some(their_nonce);
        Ok(())
    }

    pub fn initialize_session(&mut self, message: [u8; 32]) -> Result<()> {
        if let Some(existing) = self.message {
            anyhow::ensure!(
                existing == message,
                "musig session already initialized for another message"
            );
        }
        self.message = Some(message);
        Ok(())
    }

    pub fn sign_partial(&mut self) -> Result<PartialSignature> {
        let agg_nonce = self.agg_nonce.as_ref().context("nonces not aggregated")?;
        let message = self.message.context("musig session not initialized")?;
        let sec_nonce = self
            .sec_nonce
            .take()
            .context("musig session nonce already used")?;

        musig2::sign_partial(
            &self.key_agg,
            self.our_keys.secret_key(),
            sec_nonce,
            agg_nonce,
            message,
        )
        .context("create partial signature")
    }

    /// Checks the counterparty's partial signature for the initialized message.
    pub fn verify_partial(&self, their_signature: PartialSignature) -> bool {
        let (Some(agg_nonce), Some(their_nonce), Some(message)) =
            (&self.agg_nonce, &self.their_nonce, self.message)
        else {
            return false;
        };

        musig2::verify_partial(
            &self.key_agg,
            their_signature,
            agg_nonce,
            self.their_public_key,
            their_nonce,
            message,
        )
        .is_ok()
    }

    pub fn aggregate_partials(
        &self,
        ours: PartialSignature,
        theirs: PartialSignature,
    ) -> Result<schnorr::Signature> {
        let agg_nonce = self.agg_nonce.as_ref().context("nonces not aggregated")?;
        let message = self.message.context("musig session not initialized")?;

        musig2::aggregate_partial_signatures(&self.key_agg, agg_nonce, [ours, theirs], message)
            .context("aggregate partial signatures")
    }

    /// Forgets the secret nonce without signing.
    pub fn discard_nonce(&mut self) {
        self.sec_nonce = None;
    }

    pub fn nonce_used(&self) -> bool {
        self.sec_nonce.is_none()
    }
}
