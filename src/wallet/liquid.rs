use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use bitcoin::secp256k1::{Keypair, Secp256k1};
use lwk_signer::SwSigner;
use lwk_wollet::elements::bitcoin::bip32::{ChildNumber, DerivationPath};
use lwk_wollet::elements::Address;
use lwk_wollet::{
    ElectrumClient, ElectrumUrl, ElementsNetwork, Wollet, WolletDescriptor,
    full_scan_with_electrum_client,
};

use super::Wallet;

struct WalletState {
    wollet: Wollet,
    client: ElectrumClient,
}

/// LWK wallet for L-BTC sweeps; swap keys come from the software signer.
#[derive(Clone)]
pub struct LiquidWallet {
    signer: Arc<SwSigner>,
    state: Arc<Mutex<WalletState>>,
}

impl LiquidWallet {
    pub fn new(
        mnemonic: &str,
        slip77_key: &str,
        electrum_url: &str,
        persist_dir: &Path,
        network: ElementsNetwork,
    ) -> Result<Self> {
        let signer = SwSigner::new(mnemonic, false).context("create SwSigner")?;
        let xpub = signer.xpub();

        let desc_str = format!("ct(slip77({slip77_key}),elwpkh({xpub}/*))");
        let descriptor: WolletDescriptor = desc_str.parse().context("parse wollet descriptor")?;

        let wollet =
            Wollet::with_fs_persist(network, descriptor, persist_dir).context("create wollet")?;

        let client = electrum_client(electrum_url).context("create electrum client")?;

        let wallet = Self {
            signer: Arc::new(signer),
            state: Arc::new(Mutex::new(WalletState { wollet, client })),
        };
        wallet.sync().context("initial sync")?;
        Ok(wallet)
    }

    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock().expect("wallet mutex poisoned");
        let WalletState { wollet, client } = &mut *state;
        full_scan_with_electrum_client(wollet, client).context("sync wollet via electrum")
    }

    fn next_unused_address(&self) -> Result<Address> {
        self.sync().context("sync wallet before new address")?;
        Ok(self
            .state
            .lock()
            .expect("wallet mutex poisoned")
            .wollet
            .address(None)
            .context("get wollet address")?
            .address()
            .clone())
    }
}

#[async_trait::async_trait]
impl Wallet for LiquidWallet {
    fn derive_keys(&self, index: u32) -> Result<Keypair> {
        let child = ChildNumber::from_normal_idx(index).context("invalid derivation index")?;
        let path = DerivationPath::from(vec![child]);
        let xprv = self.signer.derive_xprv(&path).context("derive xprv")?;
        Ok(Keypair::from_secret_key(
            &Secp256k1::new(),
            &xprv.private_key,
        ))
    }

    async fn new_address(&self, label: &str) -> Result<String> {
        let wallet = self.clone();
        let address = tokio::task::spawn_blocking(move || wallet.next_unused_address())
            .await
            .context("join new address")??;
        tracing::debug!(%address, label, "new sweep address");
        Ok(address.to_string())
    }
}

fn electrum_client(url: &str) -> Result<ElectrumClient> {
    let endpoint = url.trim_start_matches("tcp://");
    let electrum_url = ElectrumUrl::new(endpoint, false, false)
        .with_context(|| format!("parse electrum url {endpoint}"))?;
    ElectrumClient::new(&electrum_url).context("create electrum client")
}
