//! Keep-Alive Driver (spec §4.7): polls subscriptions for readiness,
//! batches on-chain eligibility checks, gates by profitability, and
//! submits `fulfill(id)` through the shared sender; a companion watcher
//! tracks subscription lifecycle events.
//!
//! Grounded on the teacher's `collector.rs::collect_due` (cached id list,
//! per-id readiness precheck, bounded concurrency via
//! `for_each_concurrent`, per-cycle tx budget) generalized from
//! subscription-collect semantics to the keep-alive contract's
//! `isReady`/`fulfill` surface, and from a single flat id list into a
//! TTL-cached list refreshed on its own schedule (spec §4.7: "the
//! subscription id list itself is cached with a 60s TTL").

use ethers::providers::Middleware;
use ethers::types::{H256, U256};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::chain::contracts::KeepAlive;
use crate::chain::ChainAdapter;
use crate::inflight::InFlightSet;
use crate::model::{Id32, PricingSnapshot, Subscription};
use crate::profitability::{self, Verdict};
use crate::sender::{SenderError, TransactionSender};
use crate::shutdown::Shutdown;
use crate::sink::{BroadcastEvent, BroadcastSink};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const ID_LIST_TTL: Duration = Duration::from_secs(60);
const READINESS_BATCH_SIZE: usize = 5;
const MAX_CONCURRENT_FULFILLMENTS: usize = 8;
/// $0.005 at 6 decimals, same default as the fulfillment path (spec
/// §4.5 / §4.7).
const LOSS_TOLERANCE_UNITS: i128 = profitability::DEFAULT_LOSS_TOLERANCE_UNITS;
const GAS_BUFFER_PCT: u64 = profitability::DEFAULT_GAS_BUFFER_PCT;
const RECEIPT_WAIT: Duration = Duration::from_secs(120);

struct CachedIds {
    ids: Vec<Id32>,
    fetched_at: Instant,
}

pub struct KeepAliveDriver<M> {
    keepalive: Arc<KeepAlive<M>>,
    adapter: Arc<ChainAdapter<M>>,
    sender: TransactionSender,
    pricing: Arc<RwLock<PricingSnapshot>>,
    broadcast: Arc<dyn BroadcastSink>,
    in_flight: InFlightSet<Id32>,
    cached_ids: Mutex<Option<CachedIds>>,
    dry_run: bool,
}

impl<M: Middleware + 'static> KeepAliveDriver<M> {
    pub fn new(
        keepalive: Arc<KeepAlive<M>>,
        adapter: Arc<ChainAdapter<M>>,
        sender: TransactionSender,
        pricing: Arc<RwLock<PricingSnapshot>>,
        broadcast: Arc<dyn BroadcastSink>,
        dry_run: bool,
    ) -> Self {
        Self {
            keepalive,
            adapter,
            sender,
            pricing,
            broadcast,
            in_flight: InFlightSet::new(),
            cached_ids: Mutex::new(None),
            dry_run,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("keep-alive driver stopping on shutdown signal");
                    return;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            if let Err(e) = self.clone().poll_once().await {
                warn!(error = %e, "keep-alive poll cycle failed");
            }
        }
    }

    async fn subscription_ids(&self) -> eyre::Result<Vec<Id32>> {
        let mut cached = self.cached_ids.lock().await;
        if let Some(c) = cached.as_ref() {
            if c.fetched_at.elapsed() < ID_LIST_TTL {
                return Ok(c.ids.clone());
            }
        }

        let count = self.keepalive.get_subscription_count().call().await?.as_u64();
        let mut ids = Vec::with_capacity(count as usize);
        for i in 0..count {
            let id = self.keepalive.subscription_ids(U256::from(i)).call().await?;
            ids.push(H256::from(id));
        }

        *cached = Some(CachedIds {
            ids: ids.clone(),
            fetched_at: Instant::now(),
        });
        Ok(ids)
    }

    async fn poll_once(self: Arc<Self>) -> eyre::Result<()> {
        let ids = self.subscription_ids().await?;

        let batches: Vec<Vec<Id32>> = ids.chunks(READINESS_BATCH_SIZE).map(|c| c.to_vec()).collect();
        let mut ready = Vec::new();
        for batch in batches {
            for id in batch {
                match self.keepalive.is_ready(id.to_fixed_bytes()).call().await {
                    Ok(true) => ready.push(id),
                    Ok(false) => {}
                    Err(e) => warn!(subscription_id = ?id, error = %e, "isReady check failed"),
                }
            }
        }

        let this = self.clone();
        stream::iter(ready)
            .for_each_concurrent(MAX_CONCURRENT_FULFILLMENTS, move |id| {
                let this = this.clone();
                async move { this.try_fulfill(id).await }
            })
            .await;

        Ok(())
    }

    async fn try_fulfill(&self, subscription_id: Id32) {
        let Some(_guard) = self.in_flight.try_acquire(subscription_id) else {
            return;
        };

        let raw = match self
            .keepalive
            .get_subscription(subscription_id.to_fixed_bytes())
            .call()
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(subscription_id = ?subscription_id, error = %e, "failed to load subscription");
                return;
            }
        };
        let subscription = Subscription {
            id: subscription_id,
            consumer: raw.0,
            callback_target: raw.1,
            callback_gas_limit: raw.2.as_u64(),
            interval_secs: raw.3.as_u64(),
            fee_per_cycle_units: raw.4,
            estimated_gas_cost_wei: raw.5,
            max_fulfillments: raw.6.as_u64(),
            fulfillment_count: raw.7.as_u64(),
            last_fulfilled_at: raw.8.as_u64(),
            active: raw.9,
        };

        if !subscription.locally_ready(now_unix()) {
            return;
        }

        // The batch `isReady` check in `poll_once` can be stale by the
        // time this subscription's turn comes up in the fulfill step;
        // spec §4.7 requires re-checking it once more, in this single
        // RPC, right before submitting.
        match self.keepalive.is_ready(subscription_id.to_fixed_bytes()).call().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(subscription_id = ?subscription_id, error = %e, "isReady re-check failed");
                return;
            }
        }

        let fee_per_cycle_units = match self
            .keepalive
            .get_subscription_cost(subscription_id.to_fixed_bytes())
            .call()
            .await
        {
            Ok(cost) => cost,
            Err(e) => {
                warn!(subscription_id = ?subscription_id, error = %e, "getSubscriptionCost failed; falling back to cached fee");
                subscription.fee_per_cycle_units
            }
        };
        let call = self.keepalive.fulfill(subscription_id.to_fixed_bytes());

        let raw_gas_estimate = self.adapter.estimate_gas(&call).await.ok();

        let gas_price = self
            .keepalive
            .client()
            .get_gas_price()
            .await
            .unwrap_or(U256::zero());
        let eth_price = self.pricing.read().await.eth_price_usdc;

        // Reimbursement is the subscriber's per-cycle fee plus the
        // contract's own estimate of the gas cost it will refund, so the
        // profitability check sees the full amount this agent is paid,
        // not just the flat fee (spec §4.7's "reimbursement = fee +
        // gasReimbursement").
        let gas_reimbursement_units = match raw_gas_estimate {
            Some(gas) => self
                .keepalive
                .estimate_gas_reimbursement(gas.saturating_mul(gas_price))
                .call()
                .await
                .unwrap_or(U256::zero()),
            None => U256::zero(),
        };
        let reimbursement = fee_per_cycle_units.saturating_add(gas_reimbursement_units);

        let outcome = profitability::evaluate(
            raw_gas_estimate,
            gas_price,
            eth_price,
            reimbursement,
            GAS_BUFFER_PCT,
            LOSS_TOLERANCE_UNITS,
        );

        match outcome.verdict {
            Verdict::UndecidableWouldRevert => {
                let _ = self.broadcast.publish(BroadcastEvent::KeepaliveSkipped {
                    subscription_id,
                    reason: "simulation reverted".to_string(),
                    timestamp: now_unix(),
                });
                return;
            }
            Verdict::Unprofitable => {
                let _ = self.broadcast.publish(BroadcastEvent::KeepaliveSkipped {
                    subscription_id,
                    reason: "unprofitable".to_string(),
                    timestamp: now_unix(),
                });
                return;
            }
            Verdict::Profitable => {}
        }

        if self.dry_run {
            info!(subscription_id = ?subscription_id, profit = outcome.profit, "dry-run: would fulfill subscription");
            return;
        }

        let gas_ceiling = outcome.gas_ceiling;
        let keepalive = self.keepalive.clone();
        let adapter = self.adapter.clone();
        let job: crate::sender::SendJob = Box::pin(async move {
            let call = keepalive.fulfill(subscription_id.to_fixed_bytes());
            let tx_hash = adapter
                .send_with_gas(call, gas_ceiling)
                .await
                .map_err(|e| SenderError::Rpc(e.to_string()))?;

            let receipt = adapter
                .wait_for_receipt(tx_hash, RECEIPT_WAIT)
                .await
                .map_err(|_| SenderError::ReceiptTimeout { tx_hash })?;

            match receipt.status {
                Some(s) if s == 1u64.into() => Ok(tx_hash),
                _ => Err(SenderError::Reverted {
                    tx_hash,
                    block: receipt.block_number.map(|b| b.as_u64()),
                }),
            }
        });

        match self.sender.submit(job).await {
            Ok(tx_hash) => {
                info!(subscription_id = ?subscription_id, tx_hash = ?tx_hash, "subscription kept alive");
                // Explicit invalidation rather than waiting out the TTL
                // (spec §4.7: "explicit invalidation after any successful
                // fulfill") — `fulfillment_count`/`last_fulfilled_at` just
                // changed on-chain, so the next cycle should re-fetch.
                *self.cached_ids.lock().await = None;
                let _ = self.broadcast.publish(BroadcastEvent::KeepaliveFulfilled {
                    subscription_id,
                    tx_hash,
                    timestamp: now_unix(),
                });
            }
            Err(e) => {
                warn!(subscription_id = ?subscription_id, error = %e, "keep-alive submission failed");
            }
        }
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
    fn id_list_ttl_matches_spec() {
        assert_eq!(ID_LIST_TTL, Duration::from_secs(60));
    }

    #[test]
    fn readiness_batch_size_matches_spec() {
        assert_eq!(READINESS_BATCH_SIZE, 5);
    }

    #[test]
    fn loss_tolerance_matches_shared_default() {
        assert_eq!(LOSS_TOLERANCE_UNITS, 5_000);
    }
}
