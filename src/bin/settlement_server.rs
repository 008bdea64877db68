use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use clap::Parser as _;
use coop_settlement::chain::rpc::RpcChainClient;
use coop_settlement::chain::{ChainType, Currencies, Currency};
use coop_settlement::config::{
    DEFAULT_BATCH_CLAIM_INTERVAL_SECS, DEFAULT_EXPIRY_TOLERANCE_MINUTES, SettlementConfig,
};
use coop_settlement::cooperative::deferred::{ClaimEvent, DeferredClaimer};
use coop_settlement::cooperative::schedule::SweepSchedule;
use coop_settlement::cooperative::signer::MusigSigner;
use coop_settlement::lightning::LightningClient;
use coop_settlement::lightning::ldk::LdkLightningClient;
use coop_settlement::proto::v1::settlement_service_server::SettlementServiceServer;
use coop_settlement::service::SettlementServiceImpl;
use coop_settlement::swap::store::SqliteSwapStore;
use coop_settlement::wallet::bip32::Bip32Wallet;
use coop_settlement::wallet::liquid::LiquidWallet;
use lwk_wollet::ElementsNetwork;
use tokio::sync::mpsc;
use tonic::transport::Server;

const BITCOIN_SYMBOL: &str = "BTC";
const LIQUID_SYMBOL: &str = "L-BTC";

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, env = "SETTLEMENT_LISTEN_ADDR", default_value = "127.0.0.1:50061")]
    listen_addr: String,

    #[arg(long, env = "SETTLEMENT_STORE_PATH")]
    store_path: PathBuf,

    #[arg(long, env = "SETTLEMENT_BITCOIN_RPC_URL")]
    bitcoin_rpc_url: String,

    #[arg(long, env = "SETTLEMENT_BITCOIN_RPC_USER")]
    bitcoin_rpc_user: String,

    #[arg(long, env = "SETTLEMENT_BITCOIN_RPC_PASSWORD")]
    bitcoin_rpc_password: String,

    #[arg(long, env = "SETTLEMENT_BITCOIN_NETWORK", default_value = "regtest")]
    bitcoin_network: String,

    #[arg(long, env = "SETTLEMENT_BITCOIN_XPRIV")]
    bitcoin_xpriv: String,

    /// ldk-server REST addresses used for BTC Lightning lookups.
    #[arg(long, env = "SETTLEMENT_LDK_REST_ADDRS", value_delimiter = ',')]
    ldk_rest_addrs: Vec<String>,

    #[arg(long, env = "SETTLEMENT_ELEMENTS_RPC_URL")]
    elements_rpc_url: Option<String>,

    #[arg(long, env = "SETTLEMENT_ELEMENTS_RPC_USER", default_value = "")]
    elements_rpc_user: String,

    #[arg(long, env = "SETTLEMENT_ELEMENTS_RPC_PASSWORD", default_value = "")]
    elements_rpc_password: String,

    #[arg(long, env = "SETTLEMENT_LIQUID_ELECTRUM_URL", default_value = "")]
    liquid_electrum_url: String,

    #[arg(long, env = "SETTLEMENT_LIQUID_MNEMONIC", default_value = "")]
    liquid_mnemonic: String,

    #[arg(long, env = "SETTLEMENT_LIQUID_SLIP77", default_value = "")]
    liquid_slip77: String,

    #[arg(long, env = "SETTLEMENT_LIQUID_WALLET_DIR", default_value = "liquid-wallet")]
    liquid_wallet_dir: PathBuf,

    /// Symbols whose claims are batched.
    #[arg(long, env = "SETTLEMENT_DEFERRED_SYMBOLS", value_delimiter = ',')]
    deferred_claim_symbols: Vec<String>,

    #[arg(
        long,
        env = "SETTLEMENT_BATCH_CLAIM_INTERVAL_SECS",
        default_value_t = DEFAULT_BATCH_CLAIM_INTERVAL_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    batch_claim_interval_secs: u64,

    #[arg(long, env = "SETTLEMENT_EXPIRY_TOLERANCE_MINUTES", default_value_t = DEFAULT_EXPIRY_TOLERANCE_MINUTES)]
    expiry_tolerance_minutes: u64,

    #[arg(long, env = "SETTLEMENT_SWEEP_AMOUNT_TRIGGER")]
    sweep_amount_trigger: Option<u64>,

    /// Per-symbol limit of claims in one batch transaction, as SYMBOL=N.
    #[arg(
        long,
        env = "SETTLEMENT_MAX_BATCH_CLAIM_CHUNK",
        value_delimiter = ',',
        value_parser = parse_chunk_override
    )]
    max_batch_claim_chunk: Vec<(String, usize)>,
}

fn parse_chunk_override(value: &str) -> Result<(String, usize)> {
    let (symbol, chunk) = value
        .split_once('=')
        .with_context(|| format!("expected SYMBOL=N, got {value}"))?;
    let chunk: usize = chunk
        .parse()
        .with_context(|| format!("parse chunk size of {symbol}"))?;
    anyhow::ensure!(chunk > 0, "chunk size of {symbol} must be at least 1");
    Ok((symbol.to_string(), chunk))
}

#[tokio::main]
async fn main() -> Result<()> {
    coop_settlement::logging::init().ok();

    let args = Args::parse();
    let listen_addr: SocketAddr = args.listen_addr.parse().context("parse listen_addr")?;

    let store = SqliteSwapStore::open(args.store_path.clone()).context("open sqlite store")?;
    let store = Arc::new(Mutex::new(store));

    let currencies = Currencies::new(build_currencies(&args)?);

    let config = SettlementConfig {
        deferred_claim_symbols: args.deferred_claim_symbols.clone(),
        batch_claim_interval_secs: args.batch_claim_interval_secs,
        expiry_tolerance_minutes: args.expiry_tolerance_minutes,
        sweep_amount_trigger: args.sweep_amount_trigger,
        max_batch_claim_chunk: args.max_batch_claim_chunk.iter().cloned().collect(),
    };
    config.validate().context("invalid settlement config")?;
    let interval = config.batch_claim_interval();

    let (events_tx, events_rx) = mpsc::channel(256);
    spawn_claim_event_logger(events_rx);

    let claimer = Arc::new(DeferredClaimer::new(
        config,
        currencies.clone(),
        store.clone(),
        events_tx,
    ));
    let signer = Arc::new(MusigSigner::new(
        currencies,
        store,
        claimer.batch_claim_lock(),
    ));

    let recovered = claimer.init().await.context("recover deferred claims")?;
    tracing::info!(?recovered, "startup sweep done");

    let schedule = SweepSchedule::spawn(claimer.clone(), interval)?;

    tracing::info!(%listen_addr, "starting settlement gRPC server");

    Server::builder()
        .add_service(SettlementServiceServer::new(SettlementServiceImpl::new(
            claimer, signer,
        )))
        .serve_with_shutdown(listen_addr, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "listen for ctrl-c");
            }
            tracing::info!("shutting down");
        })
        .await
        .context("serve gRPC")?;

    schedule.shutdown().await;
    Ok(())
}

fn build_currencies(args: &Args) -> Result<Vec<Currency>> {
    let network =
        bitcoin::Network::from_str(&args.bitcoin_network).context("parse bitcoin_network")?;
    let wallet =
        Bip32Wallet::from_xpriv(&args.bitcoin_xpriv, network).context("load bitcoin wallet")?;
    let chain_client = RpcChainClient::new(
        &args.bitcoin_rpc_url,
        args.bitcoin_rpc_user.clone(),
        args.bitcoin_rpc_password.clone(),
        ChainType::Bitcoin,
    )?;

    let lightning_clients: Vec<Arc<dyn LightningClient>> = args
        .ldk_rest_addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| {
            Arc::new(LdkLightningClient::new(format!("ldk-{i}"), addr.clone()))
                as Arc<dyn LightningClient>
        })
        .collect();

    let mut currencies = vec![Currency {
        symbol: BITCOIN_SYMBOL.to_string(),
        chain_type: ChainType::Bitcoin,
        chain_client: Arc::new(chain_client),
        wallet: Arc::new(wallet),
        lightning_clients,
    }];
    tracing::info!(symbol = BITCOIN_SYMBOL, %network, "bitcoin currency ready");

    if let Some(url) = &args.elements_rpc_url {
        std::fs::create_dir_all(&args.liquid_wallet_dir).context("create liquid_wallet_dir")?;
        let wallet = LiquidWallet::new(
            &args.liquid_mnemonic,
            &args.liquid_slip77,
            &args.liquid_electrum_url,
            &args.liquid_wallet_dir,
            ElementsNetwork::default_regtest(),
        )
        .context("create liquid wallet")?;
        let chain_client = RpcChainClient::new(
            url,
            args.elements_rpc_user.clone(),
            args.elements_rpc_password.clone(),
            ChainType::Liquid,
        )?;

        currencies.push(Currency {
            symbol: LIQUID_SYMBOL.to_string(),
            chain_type: ChainType::Liquid,
            chain_client: Arc::new(chain_client),
            wallet: Arc::new(wallet),
            lightning_clients: Vec::new(),
        });
        tracing::info!(symbol = LIQUID_SYMBOL, "liquid currency ready");
    }

    Ok(currencies)
}

fn spawn_claim_event_logger(mut events: mpsc::Receiver<ClaimEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(
                swap_id = %event.swap.id(),
                txid = %event.transaction_id,
                fee = event.fee,
                channel_creation = event.channel_creation.is_some(),
                "swap claimed"
            );
        }
    });
}
