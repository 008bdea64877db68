use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use bitcoincore_rpc::bitcoin::{Address, Amount, Network, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi as _};
use tempfile::TempDir;

use coop_settlement::chain::ChainType;
use coop_settlement::chain::rpc::RpcChainClient;

const RPC_USER: &str = "settlement";
const RPC_PASSWORD: &str = "settlement";
const MINER_WALLET: &str = "miner";

/// Throwaway regtest `bitcoind` with a funded miner wallet.
pub struct RegtestNode {
    _data_dir: TempDir,
    rpc_port: u16,
    child: Child,
}

impl RegtestNode {
    /// Spawns the node and mines enough blocks for the miner wallet to spend.
    pub fn start() -> Result<Self> {
        let data_dir = tempfile::tempdir().context("create bitcoind datadir")?;
        let rpc_port = free_port()?;
        let p2p_port = free_port()?;

        let child = Command::new("bitcoind")
            .arg("-regtest")
            .arg(format!("-datadir={}", data_dir.path().display()))
            .arg(format!("-rpcport={rpc_port}"))
            .arg(format!("-port={p2p_port}"))
            .arg(format!("-rpcuser={RPC_USER}"))
            .arg(format!("-rpcpassword={RPC_PASSWORD}"))
            .arg("-fallbackfee=0.0001")
            .arg("-txindex=1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawn bitcoind")?;
        let mut node = Self {
            _data_dir: data_dir,
            rpc_port,
            child,
        };

        node.wait_ready(Duration::from_secs(30))?;
        node.client(None)?
            .create_wallet(MINER_WALLET, None, None, None, None)
            .context("create miner wallet")?;
        node.mine(101)?;
        Ok(node)
    }

    fn wait_ready(&mut self, within: Duration) -> Result<()> {
        let deadline = Instant::now() + within;
        let client = self.client(None)?;
        while client.get_blockchain_info().is_err() {
            if let Some(status) = self.child.try_wait().context("poll bitcoind")? {
                anyhow::bail!("bitcoind exited early with {status}");
            }
            anyhow::ensure!(Instant::now() < deadline, "bitcoind rpc not ready");
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(())
    }

    fn rpc_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.rpc_port)
    }

    fn client(&self, wallet: Option<&str>) -> Result<Client> {
        let url = match wallet {
            Some(wallet) => format!("{}/wallet/{wallet}", self.rpc_url()),
            None => self.rpc_url(),
        };
        Client::new(&url, Auth::UserPass(RPC_USER.into(), RPC_PASSWORD.into()))
            .context("create bitcoind client")
    }

    pub fn mine(&self, blocks: u64) -> Result<()> {
        let miner = self.client(Some(MINER_WALLET))?;
        let address = miner
            .get_new_address(None, None)
            .context("get mining address")?
            .require_network(Network::Regtest)?;
        miner
            .generate_to_address(blocks, &address)
            .context("generate blocks")?;
        Ok(())
    }

    /// Pays `sats` from the miner wallet, leaving the transaction unconfirmed.
    pub fn fund(&self, address: &Address, sats: u64) -> Result<Txid> {
        self.client(Some(MINER_WALLET))?
            .send_to_address(
                address,
                Amount::from_sat(sats),
                None,
                None,
                None,
                None,
                None,
                None,
            )
            .with_context(|| format!("fund {address}"))
    }

    pub fn chain_client(&self) -> Result<RpcChainClient> {
        RpcChainClient::new(
            &self.rpc_url(),
            RPC_USER.to_string(),
            RPC_PASSWORD.to_string(),
            ChainType::Bitcoin,
        )
    }
}

impl Drop for RegtestNode {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).context("bind ephemeral port")?;
    Ok(listener.local_addr()?.port())
}
