pub mod bip32;
pub mod liquid;

use anyhow::Result;
use bitcoin::secp256k1::Keypair;

/// Key derivation and address source for one chain.
#[async_trait::async_trait]
pub trait Wallet: Send + Sync {
    /// Keys of the swap created with derivation `index`.
    fn derive_keys(&self, index: u32) -> Result<Keypair>;

    /// Fresh address owned by the operator, used as sweep destination.
    async fn new_address(&self, label: &str) -> Result<String>;
}
