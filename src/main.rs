mod cache;
mod chain;
mod config;
mod cursor;
mod error;
mod handlers;
mod identity;
mod inflight;
mod keepalive;
mod maintenance;
mod model;
mod profitability;
mod protocol_state;
mod router;
mod sender;
mod shutdown;
mod sink;
mod state_file;
mod watcher;

use clap::Parser;
use ethers::middleware::{NonceManagerMiddleware, SignerMiddleware};
use ethers::prelude::{Http, Provider};
use ethers::providers::Middleware;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{H256, U256};
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::sync::Arc;

use cache::StateCache;
use chain::contracts::{Erc20, Hub, KeepAlive, PriceOracle, Staking, SwapRouter};
use chain::ChainAdapter;
use config::{AgentConfig, Args};
use cursor::BlockCursorStore;
use handlers::FulfillContext;
use identity::NullIdentityResolver;
use inflight::InFlightSet;
use keepalive::KeepAliveDriver;
use maintenance::MaintenanceLoops;
use protocol_state::NullExtendedStateResolver;
use router::{FulfillmentRouter, HandlerRegistry};
use sender::TransactionSender;
use shutdown::Shutdown;
use sink::{BroadcastSink, InProcessBroadcastSink};
use watcher::{EventWatcher, WatcherConfig};

const BROADCAST_CAPACITY: usize = 1024;
const LOG_CHANNEL_CAPACITY: usize = 512;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = AgentConfig::from_args(args)?;

    let wallet: LocalWallet = cfg
        .admin_private_key
        .parse::<LocalWallet>()
        .map_err(|e| eyre!("invalid ADMIN_PRIVATE_KEY: {e}"))?
        .with_chain_id(cfg.chain_id);

    let provider = Provider::<Http>::try_from(cfg.rpc_url.as_str())?
        .interval(std::time::Duration::from_millis(800));

    let remote_chain_id = provider.get_chainid().await?.as_u64();
    if remote_chain_id != cfg.chain_id {
        return Err(eyre!(
            "RPC chainId mismatch: configured {}, RPC reports {}. Refusing to run.",
            cfg.chain_id,
            remote_chain_id
        ));
    }

    let signer = SignerMiddleware::new(provider, wallet.clone());
    let client = Arc::new(NonceManagerMiddleware::new(signer, wallet.address()));

    std::fs::create_dir_all(&cfg.state_dir)
        .map_err(|e| eyre!("failed to create state dir {}: {e}", cfg.state_dir.display()))?;

    tracing::info!(
        chain_id = cfg.chain_id,
        hub = ?cfg.hub_contract,
        signer = ?wallet.address(),
        dry_run = cfg.dry_run,
        once = cfg.once,
        "fulfillment agent starting"
    );

    let adapter = Arc::new(ChainAdapter::new(client.clone()));
    let cursor_store = Arc::new(BlockCursorStore::new(cfg.state_dir.join("cursors")));
    let shutdown = Shutdown::new();

    let hub = Arc::new(Hub::new(cfg.hub_contract, client.clone()));
    let keepalive_contract = Arc::new(KeepAlive::new(cfg.keepalive_contract, client.clone()));
    let oracle = Arc::new(PriceOracle::new(cfg.price_oracle, client.clone()));
    let staking = cfg.staking_contract.map(|addr| Arc::new(Staking::new(addr, client.clone())));
    let swap_router = match (cfg.swap_router, cfg.token_contract) {
        (Some(router_addr), Some(token_addr)) => {
            Some((Arc::new(SwapRouter::new(router_addr, client.clone())), token_addr))
        }
        _ => None,
    };

    if let Some(buyback) = cfg.buyback_module {
        // No direct call surface: `Hub::flushProtocolFeesToBuyback` moves
        // funds into it entirely on-chain. Logged so operators can see
        // it's wired without this agent pretending to call into it.
        tracing::info!(buyback_module = ?buyback, "buyback module configured");
    }

    if let Some(usdc) = cfg.usdc_contract {
        let usdc_token = Erc20::new(usdc, client.clone());
        match usdc_token.allowance(wallet.address(), cfg.hub_contract).call().await {
            Ok(allowance) if allowance.is_zero() => {
                tracing::info!("USDC allowance to hub is zero; submitting one-time max approval");
                match usdc_token.approve(cfg.hub_contract, U256::MAX).send().await {
                    Ok(pending) => {
                        if let Err(e) = pending.await {
                            tracing::warn!(error = %e, "USDC auto-approve transaction failed to confirm");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "USDC auto-approve submission failed"),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to read USDC allowance; skipping auto-approve"),
        }
    }

    let broadcast: Arc<dyn BroadcastSink> = Arc::new(InProcessBroadcastSink::new(BROADCAST_CAPACITY));
    let identity = Arc::new(NullIdentityResolver);
    let extended_state = Arc::new(NullExtendedStateResolver);
    let state_cache = Arc::new(StateCache::new(
        hub.clone(),
        cfg.hub_contract,
        oracle.clone(),
        keepalive_contract.clone(),
        staking.clone(),
        wallet.address(),
        identity,
        extended_state,
        broadcast.clone(),
    ));
    state_cache.seed_history().await;

    let tx_sender = TransactionSender::spawn(shutdown.clone());

    let pricing = {
        let snapshot = state_cache.current().await;
        Arc::new(tokio::sync::RwLock::new(snapshot.pricing.clone()))
    };

    let fulfill_ctx = FulfillContext {
        hub: hub.clone(),
        adapter: adapter.clone(),
        sender: tx_sender.clone(),
        pricing: pricing.clone(),
        broadcast: broadcast.clone(),
        http: reqwest::Client::new(),
        loss_tolerance_units: cfg.loss_tolerance_units,
        gas_buffer_pct: cfg.gas_buffer_pct,
        dry_run: cfg.dry_run,
    };

    // Endpoint-to-handler wiring is deployment-specific; an empty
    // registry means the router logs "no handler registered" for every
    // request until operators register real endpoint handlers here.
    let handlers: HandlerRegistry<_> = HashMap::new();

    let in_flight_requests: InFlightSet<H256> = InFlightSet::new();

    let router = Arc::new(FulfillmentRouter::new(
        hub.clone(),
        cfg.hub_contract,
        handlers,
        fulfill_ctx,
        cursor_store.clone(),
    ));

    let keepalive_driver = Arc::new(KeepAliveDriver::new(
        keepalive_contract.clone(),
        adapter.clone(),
        tx_sender.clone(),
        pricing.clone(),
        broadcast.clone(),
        cfg.dry_run,
    ));

    let (request_logs_tx, request_logs_rx) = tokio::sync::mpsc::channel(LOG_CHANNEL_CAPACITY);
    let request_created_topic = ethers::utils::id("RequestCreated(bytes32,bytes32,address,uint256)");
    let hub_watcher_cfg = WatcherConfig::new(
        "hub-watcher",
        cfg.hub_contract,
        vec![("RequestCreated", H256::from(request_created_topic))],
    );
    let hub_watcher = EventWatcher::new(
        adapter.clone(),
        cursor_store.clone(),
        hub_watcher_cfg,
        request_logs_tx,
    );

    let (keepalive_logs_tx, keepalive_logs_rx) = tokio::sync::mpsc::channel(LOG_CHANNEL_CAPACITY);
    let keepalive_watcher_cfg = WatcherConfig::new(
        "keepalive-watcher",
        cfg.keepalive_contract,
        vec![
            (
                "SubscriptionCreated",
                H256::from(ethers::utils::id("SubscriptionCreated(bytes32,address)")),
            ),
            (
                "SubscriptionFulfilled",
                H256::from(ethers::utils::id("SubscriptionFulfilled(bytes32,uint256)")),
            ),
            (
                "SubscriptionCancelled",
                H256::from(ethers::utils::id("SubscriptionCancelled(bytes32)")),
            ),
        ],
    );
    let keepalive_watcher = EventWatcher::new(
        adapter.clone(),
        cursor_store.clone(),
        keepalive_watcher_cfg,
        keepalive_logs_tx,
    );

    let (config_logs_tx, config_logs_rx) = tokio::sync::mpsc::channel(LOG_CHANNEL_CAPACITY);
    let config_watcher_cfg = WatcherConfig::new(
        "config-watcher",
        cfg.hub_contract,
        vec![
            (
                "PriceOracleUpdated",
                H256::from(ethers::utils::id("PriceOracleUpdated(address)")),
            ),
            (
                "EndpointUpdated",
                H256::from(ethers::utils::id("EndpointUpdated(bytes32)")),
            ),
            (
                "EndpointGasConfigUpdated",
                H256::from(ethers::utils::id("EndpointGasConfigUpdated(bytes32)")),
            ),
        ],
    );
    let config_watcher = EventWatcher::new(
        adapter.clone(),
        cursor_store.clone(),
        config_watcher_cfg,
        config_logs_tx,
    );

    let maintenance = MaintenanceLoops::spawn(
        hub.clone(),
        cfg.hub_contract,
        adapter.clone(),
        tx_sender.clone(),
        broadcast.clone(),
        cursor_store.clone(),
        in_flight_requests,
        staking,
        wallet.address(),
        swap_router,
        shutdown.clone(),
    );

    let mut handles = Vec::new();
    handles.push(tokio::spawn(hub_watcher.run(shutdown.clone())));
    handles.push(tokio::spawn(keepalive_watcher.run(shutdown.clone())));
    handles.push(tokio::spawn(config_watcher.run(shutdown.clone())));
    handles.push(tokio::spawn(
        router.clone().run_channel_consumer(request_logs_rx, shutdown.clone()),
    ));
    handles.push(tokio::spawn(router.clone().run_fallback_poll(shutdown.clone())));
    handles.push(tokio::spawn(keepalive_driver.run(shutdown.clone())));
    handles.push(tokio::spawn(state_cache.clone().run(shutdown.clone())));
    handles.push(tokio::spawn(run_keepalive_lifecycle_consumer(
        keepalive_logs_rx,
        broadcast.clone(),
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(run_config_change_consumer(
        config_logs_rx,
        state_cache.clone(),
        shutdown.clone(),
    )));

    if cfg.once {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        shutdown.trigger();
    } else {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received ctrl-c; shutting down");
        shutdown.trigger();
    }

    for handle in handles {
        let _ = handle.await;
    }
    maintenance.join().await;

    Ok(())
}

/// Translates raw `KeepAlive` lifecycle logs into broadcast events. Kept
/// as a standalone consumer rather than folded into `KeepAliveDriver`
/// because it only relays state, it never submits a transaction in
/// response — the two have no business sharing a task.
async fn run_keepalive_lifecycle_consumer(
    mut logs: tokio::sync::mpsc::Receiver<watcher::DispatchedLog>,
    broadcast: Arc<dyn BroadcastSink>,
    shutdown: Shutdown,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            maybe_log = logs.recv() => {
                let Some((name, log)) = maybe_log else { return };
                let Some(subscription_id) = log.topics.get(1).copied() else { continue };
                let timestamp = now_unix();

                let event = match name {
                    "SubscriptionCreated" => {
                        sink::BroadcastEvent::KeepaliveSubscriptionCreated { subscription_id, timestamp }
                    }
                    "SubscriptionCancelled" => {
                        sink::BroadcastEvent::KeepaliveSubscriptionCancelled { subscription_id, timestamp }
                    }
                    _ => continue,
                };

                let _ = broadcast.publish(event);
            }
        }
    }
}

/// Translates Hub config-change logs into an immediate cache refresh
/// request, rather than waiting for the cache's own probe/staleness
/// timers to eventually notice (spec §4.4).
async fn run_config_change_consumer<M: Middleware + 'static>(
    mut logs: tokio::sync::mpsc::Receiver<watcher::DispatchedLog>,
    state_cache: Arc<StateCache<M>>,
    shutdown: Shutdown,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            maybe_log = logs.recv() => {
                let Some((name, _log)) = maybe_log else { return };
                tracing::info!(event = name, "config change observed; requesting cache refresh");
                state_cache.request_refresh();
            }
        }
    }
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
