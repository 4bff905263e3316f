//! State Cache & Broadcaster (spec §4.9): an atomically-swapped snapshot
//! of cheap-to-read protocol state, refreshed on three triggers — a
//! cheap delta probe, a hard staleness ceiling, and an external
//! config-change notification (spec §4.4) — plus a ring buffer of
//! recently broadcast events for late subscribers to backfill from,
//! seeded at startup by a bounded historical scan.
//!
//! Grounded on `worldcoin-signup-sequencer`'s `app.rs`/`app/mod.rs`
//! shared-state-behind-a-lock shape, generalized from one
//! write-through state object into an immutable snapshot behind
//! `RwLock<Arc<_>>` so readers never block a concurrent refresh (the
//! "atomic swap" design note in spec §9), and on `event_bus.rs`'s
//! broadcast sink (already adapted in `sink.rs`) for the push side.

use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber, Filter, H256, U256};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

use crate::chain::contracts::{Hub, KeepAlive, PriceOracle, Staking};
use crate::identity::IdentityResolver;
use crate::model::{Endpoint, EndpointPricing, Id32, PricingSnapshot};
use crate::protocol_state::{ExtendedState, ExtendedStateResolver};
use crate::shutdown::Shutdown;
use crate::sink::{BroadcastEvent, BroadcastSink};

/// Cheap probe cadence: re-reads the two monotonic hub counters spec
/// §4.9 names (accumulated protocol fees, served-request counter) to
/// decide whether a full refresh is warranted, without paying for the
/// whole per-endpoint fan-out on every tick.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// Hard ceiling: a full refresh happens at least this often even if the
/// cheap probe saw no change.
const MAX_STALENESS: Duration = Duration::from_secs(30);
const RECENT_EVENTS_CAPACITY: usize = 200;
/// Depth of the one-time startup backfill that seeds the ring buffer
/// (spec §4.9 step 3: "~50k-block historical scan").
const HISTORY_SCAN_DEPTH_BLOCKS: u64 = 50_000;
const HISTORY_CHUNK_BLOCKS: u64 = 1000;

/// The full read model the cache exposes to the rest of the agent and,
/// via `AppState`/`PricingUpdate` broadcasts, to external consumers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
    pub pricing: PricingSnapshot,
    pub hub_stats: HubStats,
    pub keepalive_stats: Option<KeepAliveStats>,
    pub staking_stats: Option<StakingStats>,
    pub extended: ExtendedState,
    pub refreshed_at: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HubStats {
    pub total_requests: U256,
    pub total_fulfilled: U256,
    pub total_cancelled: U256,
    pub served_request_counter: U256,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct KeepAliveStats {
    pub total_subscriptions: U256,
    pub total_fulfillments: U256,
    pub active_subscriptions: U256,
}

/// This agent's own staking position (spec §4.9's "staking" field),
/// read against the configured agent address rather than an arbitrary
/// account — there is no roster of accounts to aggregate over.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StakingStats {
    pub staked: U256,
    pub staked_since: U256,
    pub total_staked_protocol_wide: U256,
    pub pending_rewards: U256,
    pub reputation: U256,
    pub eligible_agent: bool,
}

pub struct StateCache<M> {
    hub: Arc<Hub<M>>,
    hub_address: Address,
    oracle: Arc<PriceOracle<M>>,
    keepalive: Arc<KeepAlive<M>>,
    staking: Option<Arc<Staking<M>>>,
    agent_address: Address,
    identity: Arc<dyn IdentityResolver>,
    extended: Arc<dyn ExtendedStateResolver>,
    broadcast: Arc<dyn BroadcastSink>,
    current: RwLock<Arc<Snapshot>>,
    recent_events: RwLock<VecDeque<BroadcastEvent>>,
    /// Signalled by the config-change watcher consumer so a pricing
    /// refresh happens immediately instead of waiting for the next probe
    /// or staleness ceiling (spec §4.4/§4.9).
    refresh_requested: Notify,
}

impl<M: Middleware + 'static> StateCache<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<Hub<M>>,
        hub_address: Address,
        oracle: Arc<PriceOracle<M>>,
        keepalive: Arc<KeepAlive<M>>,
        staking: Option<Arc<Staking<M>>>,
        agent_address: Address,
        identity: Arc<dyn IdentityResolver>,
        extended: Arc<dyn ExtendedStateResolver>,
        broadcast: Arc<dyn BroadcastSink>,
    ) -> Self {
        Self {
            hub,
            hub_address,
            oracle,
            keepalive,
            staking,
            agent_address,
            identity,
            extended,
            broadcast,
            current: RwLock::new(Arc::new(Snapshot {
                pricing: PricingSnapshot::default(),
                hub_stats: HubStats::default(),
                keepalive_stats: None,
                staking_stats: None,
                extended: ExtendedState::default(),
                refreshed_at: 0,
            })),
            recent_events: RwLock::new(VecDeque::with_capacity(RECENT_EVENTS_CAPACITY)),
            refresh_requested: Notify::new(),
        }
    }

    /// Requests an out-of-band full refresh on the next loop iteration,
    /// bypassing the cheap probe. Called by the config-change watcher
    /// consumer when `PriceOracleUpdated`/`EndpointUpdated`/
    /// `EndpointGasConfigUpdated` fires (spec §4.4).
    pub fn request_refresh(&self) {
        self.refresh_requested.notify_one();
    }

    /// Returns the current snapshot without blocking on a refresh; readers
    /// always see a consistent, already-published snapshot (spec §4.9
    /// "readers never observe a partially updated snapshot").
    pub async fn current(&self) -> Arc<Snapshot> {
        self.current.read().await.clone()
    }

    pub async fn record_event(&self, event: BroadcastEvent) {
        self.push_recent_event(event.clone()).await;
        let _ = self.broadcast.publish(event);
    }

    async fn push_recent_event(&self, event: BroadcastEvent) {
        let mut buf = self.recent_events.write().await;
        if buf.len() == RECENT_EVENTS_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(event);
    }

    pub async fn recent_events(&self) -> Vec<BroadcastEvent> {
        self.recent_events.read().await.iter().cloned().collect()
    }

    /// One-time startup backfill of the last `HISTORY_SCAN_DEPTH_BLOCKS`
    /// blocks of `RequestCreated`/`RequestFulfilled` logs, so the ring
    /// buffer isn't empty for the first subscriber that connects (spec
    /// §4.9 step 3). Seeded events are pushed directly into the buffer,
    /// not re-published — a subscriber connecting now shouldn't be
    /// replayed history as if it just happened.
    pub async fn seed_history(&self) {
        if let Err(e) = self.seed_history_inner().await {
            warn!(error = %e, "state cache historical backfill failed; ring buffer starts empty");
        }
    }

    async fn seed_history_inner(&self) -> eyre::Result<()> {
        let current = self.hub.client().get_block_number().await?.as_u64();
        let from = current.saturating_sub(HISTORY_SCAN_DEPTH_BLOCKS).max(1);

        let created_topic = H256::from(ethers::utils::id(
            "RequestCreated(bytes32,bytes32,address,uint256)",
        ));
        let fulfilled_topic = H256::from(ethers::utils::id(
            "RequestFulfilled(bytes32,address,uint256)",
        ));

        let mut seeded = 0u64;
        let mut chunk_start = from;
        while chunk_start <= current {
            let chunk_end = chunk_start.saturating_add(HISTORY_CHUNK_BLOCKS - 1).min(current);

            let created_filter = Filter::new()
                .address(self.hub_address)
                .topic0(created_topic)
                .from_block(BlockNumber::Number(chunk_start.into()))
                .to_block(BlockNumber::Number(chunk_end.into()));
            let fulfilled_filter = Filter::new()
                .address(self.hub_address)
                .topic0(fulfilled_topic)
                .from_block(BlockNumber::Number(chunk_start.into()))
                .to_block(BlockNumber::Number(chunk_end.into()));

            let (created_logs, fulfilled_logs) = tokio::join!(
                self.hub.client().get_logs(&created_filter),
                self.hub.client().get_logs(&fulfilled_filter),
            );

            for log in created_logs.unwrap_or_default() {
                let (Some(request_id), Some(endpoint_id)) =
                    (log.topics.get(1).copied(), log.topics.get(2).copied())
                else {
                    continue;
                };
                // The log itself carries no block timestamp without an
                // extra getBlock round trip per entry; the block number
                // stands in as a coarse, monotonic ordering hint for a
                // backfill whose only job is to not leave the buffer
                // empty, not to reproduce exact wall-clock times.
                let timestamp = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
                self.push_recent_event(BroadcastEvent::RequestCreated {
                    request_id,
                    endpoint_id,
                    timestamp,
                })
                .await;
                seeded += 1;
            }

            for log in fulfilled_logs.unwrap_or_default() {
                let Some(request_id) = log.topics.get(1).copied() else {
                    continue;
                };
                let tx_hash = log.transaction_hash.unwrap_or_default();
                let timestamp = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
                self.push_recent_event(BroadcastEvent::RequestFulfilled {
                    request_id,
                    tx_hash,
                    timestamp,
                })
                .await;
                seeded += 1;
            }

            chunk_start = chunk_end + 1;
        }

        info!(seeded, from, to = current, "state cache historical backfill complete");
        Ok(())
    }

    /// Runs the two-trigger refresh loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let mut shutdown_rx = shutdown.subscribe();
        let mut last_full_refresh = Instant::now() - MAX_STALENESS;
        let mut last_known_fees = U256::zero();
        let mut last_known_served_counter = U256::zero();

        loop {
            let mut forced = false;
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("state cache stopping on shutdown signal");
                    return;
                }
                _ = self.refresh_requested.notified() => {
                    forced = true;
                }
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
            }

            let (fees_probe, served_probe) = tokio::join!(
                self.hub.protocol_fees_accumulator().call(),
                self.hub.get_hub_stats().call(),
            );
            let fees_probe = fees_probe.ok();
            let served_probe = served_probe.ok().map(|s| s.3);

            let changed = fees_probe.map(|f| f != last_known_fees).unwrap_or(false)
                || served_probe
                    .map(|s| s != last_known_served_counter)
                    .unwrap_or(false);
            let past_ceiling = last_full_refresh.elapsed() >= MAX_STALENESS;

            if !changed && !past_ceiling && !forced {
                continue;
            }

            match self.full_refresh().await {
                Ok(snapshot) => {
                    last_known_fees = fees_probe.unwrap_or(last_known_fees);
                    last_known_served_counter = served_probe.unwrap_or(last_known_served_counter);
                    last_full_refresh = Instant::now();

                    if changed || forced {
                        let _ = self.broadcast.publish(BroadcastEvent::PricingUpdate {
                            timestamp: now_unix(),
                            data: json!({ "eth_price_usdc": snapshot.pricing.eth_price_usdc }),
                        });
                    }
                }
                Err(e) => warn!(error = %e, "state cache full refresh failed"),
            }
        }
    }

    /// Gathers every field of the snapshot, tolerating a per-field
    /// failure (one bad endpoint read should not blank the whole
    /// snapshot) the way `event_bus.rs`'s consumers tolerate a missed
    /// event rather than crash the producer (spec §4.9: "a failure
    /// fetching one piece of state does not discard the rest").
    async fn full_refresh(&self) -> eyre::Result<Arc<Snapshot>> {
        let eth_price = self.oracle.get_eth_price().call().await.unwrap_or(U256::zero());

        let endpoint_count = self.hub.get_endpoint_count().call().await?.as_u64();
        // Fan out every per-endpoint read concurrently; a single bad
        // endpoint degrades that one field, it never aborts the whole
        // refresh (spec §4.9).
        let fetches = (0..endpoint_count).map(|i| self.fetch_endpoint_pricing(i));
        let endpoints: std::collections::HashMap<Id32, EndpointPricing> =
            futures::future::join_all(fetches)
                .await
                .into_iter()
                .flatten()
                .collect();

        let (stats_raw, keepalive_stats, staking_stats, extended) = tokio::join!(
            self.hub.get_hub_stats().call(),
            self.fetch_keepalive_stats(),
            self.fetch_staking_stats(),
            self.extended.resolve(),
        );

        let hub_stats = stats_raw
            .map(|s| HubStats {
                total_requests: s.0,
                total_fulfilled: s.1,
                total_cancelled: s.2,
                served_request_counter: s.3,
            })
            .unwrap_or_default();

        let snapshot = Arc::new(Snapshot {
            pricing: PricingSnapshot {
                eth_price_usdc: eth_price,
                endpoints,
            },
            hub_stats,
            keepalive_stats,
            staking_stats,
            extended,
            refreshed_at: now_unix(),
        });

        *self.current.write().await = snapshot.clone();
        Ok(snapshot)
    }

    /// One endpoint's pricing fields, or `None` on any read failure —
    /// folded away by the caller's `join_all`/`flatten` rather than
    /// failing the whole refresh.
    async fn fetch_endpoint_pricing(&self, index: u64) -> Option<(Id32, EndpointPricing)> {
        let id = match self.hub.endpoint_ids(U256::from(index)).call().await {
            Ok(id) => Id32::from(id),
            Err(e) => {
                warn!(index, error = %e, "failed to read endpoint id");
                return None;
            }
        };
        let raw = match self.hub.get_endpoint(id.to_fixed_bytes()).call().await {
            Ok(e) => e,
            Err(e) => {
                warn!(endpoint_id = ?id, error = %e, "failed to read endpoint");
                return None;
            }
        };
        let endpoint = Endpoint {
            id,
            url: raw.1,
            input_format: raw.2,
            output_format: raw.3,
            base_cost_units: raw.4,
            max_response_bytes: raw.5.as_u64(),
            callback_gas_limit: raw.6.as_u64(),
            estimated_gas_cost_wei: raw.7,
            owner: raw.0,
            active: raw.8,
            registered_at: raw.9.as_u64(),
        };
        let _name = self.identity.resolve(endpoint.owner).await;
        Some((
            id,
            EndpointPricing {
                estimated_gas_cost_wei: endpoint.estimated_gas_cost_wei,
                base_cost_units: endpoint.base_cost_units,
            },
        ))
    }

    /// Aggregate keep-alive subscription counters (spec §4.9's
    /// "keep-alive stats" field), `None` if the call fails rather than
    /// failing the whole refresh.
    async fn fetch_keepalive_stats(&self) -> Option<KeepAliveStats> {
        match self.keepalive.get_stats().call().await {
            Ok(s) => Some(KeepAliveStats {
                total_subscriptions: s.0,
                total_fulfillments: s.1,
                active_subscriptions: s.2,
            }),
            Err(e) => {
                warn!(error = %e, "failed to read keep-alive stats");
                None
            }
        }
    }

    /// This agent's own staking position (spec §4.9's "staking" field).
    /// `None` when no staking contract is configured or the read fails.
    async fn fetch_staking_stats(&self) -> Option<StakingStats> {
        let staking = self.staking.as_ref()?;
        let (stake_info, total_staked, pending_rewards, reputation, eligible) = tokio::join!(
            staking.get_stake_info(self.agent_address).call(),
            staking.total_staked().call(),
            staking.pending_rewards(self.agent_address).call(),
            staking.get_reputation(self.agent_address).call(),
            staking.is_eligible_agent(self.agent_address).call(),
        );

        let (staked, staked_since) = stake_info.unwrap_or((U256::zero(), U256::zero()));
        Some(StakingStats {
            staked,
            staked_since,
            total_staked_protocol_wide: total_staked.unwrap_or_default(),
            pending_rewards: pending_rewards.unwrap_or_default(),
            reputation: reputation.unwrap_or_default(),
            eligible_agent: eligible.unwrap_or(false),
        })
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_and_staleness_intervals_match_spec() {
        assert_eq!(PROBE_INTERVAL, Duration::from_secs(5));
        assert_eq!(MAX_STALENESS, Duration::from_secs(30));
    }

    #[test]
    fn history_scan_depth_matches_spec() {
        assert_eq!(HISTORY_SCAN_DEPTH_BLOCKS, 50_000);
    }

    fn test_cache() -> StateCache<ethers::providers::Provider<ethers::providers::Http>> {
        use crate::sink::InProcessBroadcastSink;
        use ethers::providers::{Http, Provider};

        let provider = Provider::<Http>::try_from("http://localhost:8545").unwrap();
        let client = Arc::new(provider);
        let hub = Arc::new(Hub::new(Address::zero(), client.clone()));
        let oracle = Arc::new(PriceOracle::new(Address::zero(), client.clone()));
        let keepalive = Arc::new(KeepAlive::new(Address::zero(), client));
        let broadcast: Arc<dyn BroadcastSink> = Arc::new(InProcessBroadcastSink::new(16));
        let identity: Arc<dyn IdentityResolver> = Arc::new(crate::identity::NullIdentityResolver);
        let extended: Arc<dyn ExtendedStateResolver> =
            Arc::new(crate::protocol_state::NullExtendedStateResolver);

        StateCache::new(
            hub,
            Address::zero(),
            oracle,
            keepalive,
            None,
            Address::zero(),
            identity,
            extended,
            broadcast,
        )
    }

    #[tokio::test]
    async fn recent_events_ring_buffer_caps_at_capacity() {
        let cache = test_cache();
        for i in 0..(RECENT_EVENTS_CAPACITY + 10) {
            cache
                .record_event(BroadcastEvent::RequestCancelled {
                    request_id: Id32::from_low_u64_be(i as u64),
                    timestamp: i as u64,
                })
                .await;
        }

        assert_eq!(cache.recent_events().await.len(), RECENT_EVENTS_CAPACITY);
    }

    #[tokio::test]
    async fn request_refresh_wakes_a_pending_notified_waiter() {
        let cache = test_cache();

        cache.request_refresh();
        tokio::time::timeout(Duration::from_millis(50), cache.refresh_requested.notified())
            .await
            .expect("a notification should already be pending");
    }

    #[tokio::test]
    async fn snapshot_starts_with_no_staking_or_extended_data() {
        let cache = test_cache();
        let snapshot = cache.current().await;
        assert!(snapshot.staking_stats.is_none());
        assert!(snapshot.extended.locker.is_none());
    }
}
