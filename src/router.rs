//! Fulfillment Router (spec §4.6): consumes `RequestCreated` logs off the
//! watcher's dispatch channel, single-flights by request id, classifies
//! by endpoint into a registered handler, and delegates. A separate
//! fallback poll re-scans the same address on a fixed cadence so a
//! dropped or never-seen log still gets picked up (spec §4.6 "never
//! relies solely on the watcher's channel").
//!
//! Generalizes the teacher's `collector.rs::collect_due` (bounded
//! concurrency over a fixed id list, single endpoint/semantics) into a
//! dynamic dispatch-by-endpoint-id over a dynamically discovered request
//! set, using the same `for_each_concurrent` bounded-fan-out shape.

use ethers::providers::Middleware;
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chain::contracts::Hub;
use crate::cursor::BlockCursorStore;
use crate::handlers::{submit_cancel_request, EndpointHandler, FulfillContext, FulfillOutcome, HandlerError};
use crate::inflight::InFlightSet;
use crate::model::{Id32, Request, RequestStatus};
use crate::shutdown::Shutdown;
use crate::sink::BroadcastEvent;
use crate::watcher::DispatchedLog;

/// How stale a request's on-chain `createdAt` may be before the router
/// gives up racing for it and cancels it instead (spec §4.6 step 2,
/// scenario 2: "discard entries older than 5 minutes").
const MAX_LOG_AGE: Duration = Duration::from_secs(300);
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(30);
const FALLBACK_CURSOR_LABEL: &str = "hub-fallback";
const FALLBACK_LOOKBACK_BLOCKS: u64 = 2000;

pub type HandlerRegistry<M> = HashMap<Id32, Arc<dyn EndpointHandler<M>>>;

pub struct FulfillmentRouter<M> {
    hub: Arc<Hub<M>>,
    hub_address: Address,
    handlers: HandlerRegistry<M>,
    in_flight: InFlightSet<Id32>,
    ctx: FulfillContext<M>,
    cursor_store: Arc<BlockCursorStore>,
}

impl<M: Middleware + 'static> FulfillmentRouter<M> {
    pub fn new(
        hub: Arc<Hub<M>>,
        hub_address: Address,
        handlers: HandlerRegistry<M>,
        ctx: FulfillContext<M>,
        cursor_store: Arc<BlockCursorStore>,
    ) -> Self {
        Self {
            hub,
            hub_address,
            handlers,
            in_flight: InFlightSet::new(),
            ctx,
            cursor_store,
        }
    }

    /// Drains `RequestCreated` logs pushed by the event watcher until
    /// `shutdown` fires. Each log is handled on its own spawned task so
    /// one slow upstream call never blocks the next log from being
    /// picked up (spec §4.6 "processed independently, not serially").
    pub async fn run_channel_consumer(
        self: Arc<Self>,
        mut logs: mpsc::Receiver<DispatchedLog>,
        shutdown: Shutdown,
    ) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("fulfillment router stopping on shutdown signal");
                    return;
                }
                maybe_log = logs.recv() => {
                    match maybe_log {
                        Some((name, log)) if name == "RequestCreated" => {
                            let this = self.clone();
                            tokio::spawn(async move { this.handle_request_created_log(log).await });
                        }
                        Some(_) => {}
                        None => {
                            warn!("fulfillment router's log channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_request_created_log(&self, log: ethers::types::Log) {
        let Some(request_id) = log.topics.get(1).copied() else {
            warn!("RequestCreated log missing request id topic");
            return;
        };

        self.try_fulfill(request_id).await;
    }

    /// Attempts to fulfill `request_id`: single-flight guard, load from
    /// chain, classify by endpoint, delegate to the registered handler.
    /// The guard is held for the whole attempt and released on every
    /// exit path via `Drop` (spec §4.6 step 5).
    async fn try_fulfill(&self, request_id: H256) {
        let Some(_guard) = self.in_flight.try_acquire(request_id) else {
            return;
        };

        let raw = match self.hub.get_request(request_id.to_fixed_bytes()).call().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(request_id = ?request_id, error = %e, "failed to load request");
                return;
            }
        };

        let status = RequestStatus::from_u8(raw.8).unwrap_or(RequestStatus::Cancelled);
        if status != RequestStatus::Pending {
            return;
        }

        let request = Request {
            id: request_id,
            endpoint_id: H256::from(raw.0),
            requester: raw.1,
            agent: raw.2,
            total_cost_units: raw.3,
            base_cost_units: raw.4,
            markup_units: raw.5,
            gas_reimbursement_units: raw.6,
            created_at: raw.7.as_u64(),
            status,
            params: raw.9.to_vec(),
            response: raw.10.to_vec(),
            has_callback: raw.11,
        };

        let age_secs = now_unix().saturating_sub(request.created_at);
        if age_secs > MAX_LOG_AGE.as_secs() {
            info!(request_id = ?request_id, age_secs, "request is stale; cancelling");
            let _ = self.ctx.broadcast.publish(BroadcastEvent::RequestTimeout {
                request_id: request.id,
                reason: "stale".to_string(),
                timestamp: now_unix(),
            });
            self.cancel(request_id).await;
            return;
        }

        let _ = self.ctx.broadcast.publish(BroadcastEvent::RequestRouting {
            request_id: request.id,
            endpoint_id: request.endpoint_id,
            timestamp: now_unix(),
        });

        let Some(handler) = self.handlers.get(&request.endpoint_id) else {
            info!(request_id = ?request_id, endpoint_id = ?request.endpoint_id, "no handler registered for endpoint");
            let _ = self.ctx.broadcast.publish(BroadcastEvent::RequestTimeout {
                request_id: request.id,
                reason: "unknown_endpoint".to_string(),
                timestamp: now_unix(),
            });
            self.cancel(request_id).await;
            return;
        };

        match handler.fulfill(&request, &self.ctx).await {
            Ok(FulfillOutcome::Fulfilled { tx_hash }) => {
                info!(request_id = ?request_id, tx_hash = ?tx_hash, "request fulfilled by router");
            }
            Ok(FulfillOutcome::Skipped { reason }) => {
                info!(request_id = ?request_id, reason = %reason, "handler skipped request");
            }
            Err(HandlerError::NoLongerPending) => {
                // Another agent won the race; not an error (spec §7).
            }
            Err(e) => {
                warn!(request_id = ?request_id, error = %e, "fulfillment attempt failed");
            }
        }
    }

    /// Submits `cancelRequest` for `request_id` and logs the outcome.
    /// Never re-raises the error: a failed cancel just leaves the request
    /// PENDING for the sweeper or another agent to retry (spec §7).
    async fn cancel(&self, request_id: H256) {
        match submit_cancel_request(request_id, &self.hub, &self.ctx.adapter, &self.ctx.sender).await {
            Ok(tx_hash) => {
                info!(request_id = ?request_id, tx_hash = ?tx_hash, "request cancelled");
                let _ = self.ctx.broadcast.publish(BroadcastEvent::RequestCancelled {
                    request_id,
                    timestamp: now_unix(),
                });
            }
            Err(e) => {
                warn!(request_id = ?request_id, error = %e, "cancelRequest submission failed");
            }
        }
    }

    /// Periodic safety-net scan independent of the watcher's channel
    /// (spec §4.6). Re-derives the same request ids a `RequestCreated`
    /// log would have carried by re-scanning the hub's logs directly,
    /// so a log dropped by a full channel or missed during a watcher
    /// restart still gets attempted.
    pub async fn run_fallback_poll(self: Arc<Self>, shutdown: Shutdown) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("fulfillment router fallback poll stopping on shutdown signal");
                    return;
                }
                _ = tokio::time::sleep(FALLBACK_POLL_INTERVAL) => {}
            }

            if let Err(e) = self.fallback_poll_once().await {
                warn!(error = %e, "fulfillment router fallback poll failed");
            }
        }
    }

    async fn fallback_poll_once(&self) -> eyre::Result<()> {
        use ethers::types::{BlockNumber, Filter};

        let current = self.hub.client().get_block_number().await?.as_u64();
        let last = self.cursor_store.load(FALLBACK_CURSOR_LABEL)?;
        let from = if last == 0 {
            current.saturating_sub(FALLBACK_LOOKBACK_BLOCKS).max(1)
        } else {
            last.saturating_add(1)
        };

        if from > current {
            return Ok(());
        }

        let topic0 = ethers::utils::id("RequestCreated(bytes32,bytes32,address,uint256)");
        let filter = Filter::new()
            .address(self.hub_address)
            .topic0(H256::from(topic0))
            .from_block(BlockNumber::Number(from.into()))
            .to_block(BlockNumber::Number(current.into()));

        let logs = self.hub.client().get_logs(&filter).await?;
        for log in logs {
            if let Some(id) = log.topics.get(1).copied() {
                self.try_fulfill(id).await;
            }
        }

        self.cursor_store.save(FALLBACK_CURSOR_LABEL, current)?;
        Ok(())
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
    fn max_log_age_matches_spec() {
        assert_eq!(MAX_LOG_AGE, Duration::from_secs(300));
    }

    #[test]
    fn request_older_than_max_age_is_stale() {
        let now = 10_000u64;
        let created_at = now - 301;
        assert!(now.saturating_sub(created_at) > MAX_LOG_AGE.as_secs());
    }

    #[test]
    fn request_within_max_age_is_not_stale() {
        let now = 10_000u64;
        let created_at = now - 10;
        assert!(now.saturating_sub(created_at) <= MAX_LOG_AGE.as_secs());
    }
}
