use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context as _, Result};
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{Keypair, Secp256k1};
use bitcoin::{Address, Network};

use super::Wallet;

const SWAP_KEY_BRANCH: u32 = 0;
const SWEEP_ADDRESS_BRANCH: u32 = 1;

/// BIP32 wallet: swap keys at `m/0/<index>`, sweep addresses at `m/1/<n>`.
pub struct Bip32Wallet {
    master: Xpriv,
    network: Network,
    next_address_index: AtomicU32,
}

impl Bip32Wallet {
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self> {
        let master = Xpriv::new_master(network, seed).context("derive master key")?;
        Ok(Self {
            master,
            network,
            next_address_index: AtomicU32::new(0),
        })
    }

    pub fn from_xpriv(xpriv: &str, network: Network) -> Result<Self> {
        let master: Xpriv = xpriv.parse().context("parse xpriv")?;
        Ok(Self {
            master,
            network,
            next_address_index: AtomicU32::new(0),
        })
    }

    fn derive(&self, branch: u32, index: u32) -> Result<Keypair> {
        let secp = Secp256k1::new();
        let path = DerivationPath::from(vec![
            ChildNumber::from_normal_idx(branch).context("invalid derivation branch")?,
            ChildNumber::from_normal_idx(index).context("invalid derivation index")?,
        ]);
        let xprv = self
            .master
            .derive_priv(&secp, &path)
            .with_context(|| format!("derive key at m/{branch}/{index}"))?;
        Ok(xprv.to_keypair(&secp))
    }

    pub fn address_at(&self, index: u32) -> Result<Address> {
        let secp = Secp256k1::new();
        let keys = self.derive(SWEEP_ADDRESS_BRANCH, index)?;
        let (internal_key, _) = keys.x_only_public_key();
        Ok(Address::p2tr(&secp, internal_key, None, self.network))
    }
}

#[async_trait::async_trait]
impl Wallet for Bip32Wallet {
    fn derive_keys(&self, index: u32) -> Result<Keypair> {
        self.derive(SWAP_KEY_BRANCH, index)
    }

    async fn new_address(&self, label: &str) -> Result<String> {
        let index = self.next_address_index.fetch_add(1, Ordering::SeqCst);
        let address = self.address_at(index)?;
        tracing::debug!(%address, index, label, "new sweep address");
        Ok(address.to_string())
    }
}
