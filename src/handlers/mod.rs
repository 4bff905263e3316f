//! Upstream API adapters (spec §1: "one per endpoint family... out of
//! scope"). This module owns the trait boundary and registration/dispatch
//! machinery the Fulfillment Router (spec §4.6) classifies and delegates
//! through; the two submodules are illustrative reference
//! implementations, grounded on `aa-rs`'s `reqwest`-based HTTP calling
//! (the closest pack example of an agent-side binary making outbound API
//! calls), not exhaustive upstream integrations.

pub mod alchemy;
pub mod opensea;

use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{H256, U256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::chain::contracts::Hub;
use crate::chain::ChainAdapter;
use crate::model::{Id32, PricingSnapshot, Request, RequestStatus};
use crate::profitability::{self, Verdict};
use crate::sender::{SenderError, TransactionSender};
use crate::sink::{BroadcastEvent, BroadcastSink};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("upstream API call failed: {0}")]
    Upstream(String),

    #[error("upstream response exceeds the endpoint's max-response-bytes")]
    ResponseTooLarge,

    #[error("request is no longer PENDING on-chain; skipping")]
    NoLongerPending,

    #[error("fulfillment is unprofitable")]
    Unprofitable,

    #[error("fulfillRequest simulation reverted: {0}")]
    SimulationReverted(String),

    #[error(transparent)]
    Send(#[from] SenderError),
}

#[derive(Debug)]
pub enum FulfillOutcome {
    Fulfilled { tx_hash: H256 },
    Skipped { reason: String },
}

/// Everything a handler needs to call its upstream API, price the
/// fulfillment, and submit the on-chain write through the shared sender.
pub struct FulfillContext<M> {
    pub hub: Arc<Hub<M>>,
    pub adapter: Arc<ChainAdapter<M>>,
    pub sender: TransactionSender,
    pub pricing: Arc<RwLock<PricingSnapshot>>,
    pub broadcast: Arc<dyn BroadcastSink>,
    pub http: reqwest::Client,
    pub loss_tolerance_units: i128,
    pub gas_buffer_pct: u64,
    /// When set, every write this context would submit is logged and
    /// skipped instead of sent (spec §6 `--dry-run`).
    pub dry_run: bool,
}

/// A registered API handler (spec §4.6: "a static registry of handler
/// classes"). Implementors call the upstream API, build response bytes,
/// re-check the on-chain status is still PENDING, run the profitability
/// gate, and submit `fulfillRequest` through the shared sender.
#[async_trait]
pub trait EndpointHandler<M>: Send + Sync
where
    M: Middleware + 'static,
{
    async fn fulfill(
        &self,
        request: &Request,
        ctx: &FulfillContext<M>,
    ) -> Result<FulfillOutcome, HandlerError>;
}

/// Upper bound applied by illustrative handlers that don't have a
/// per-endpoint `max_response_bytes` in hand (spec §3 endpoint field);
/// a real handler would use the endpoint's own configured limit instead.
pub const MAX_RESPONSE_BYTES_FALLBACK: u64 = 1_000_000;

const RECEIPT_WAIT: Duration = Duration::from_secs(120);
/// Placeholder session id used when a handler has no richer session
/// concept of its own; the on-chain contract only requires it be passed
/// through to `fulfillRequest`, not interpreted by this agent.
const DEFAULT_SESSION_ID: [u8; 32] = [0u8; 32];

/// Shared tail of every handler's `fulfill`: re-check the request is
/// still PENDING (spec §4.6 step 4's race guard), run the profitability
/// gate, simulate, and submit through the shared sender. Every concrete
/// handler (alchemy, opensea, ...) calls this once it has produced
/// `response_bytes` from its upstream API — grounded on `collector.rs`'s
/// single precheck → simulate → send → wait-receipt sequence, reused
/// here instead of being duplicated per handler.
pub async fn submit_fulfillment<M: Middleware + 'static>(
    request: &Request,
    response_bytes: Vec<u8>,
    ctx: &FulfillContext<M>,
) -> Result<FulfillOutcome, HandlerError> {
    let request_id = request.id;
    let raw = ctx
        .hub
        .get_request(request_id.to_fixed_bytes())
        .call()
        .await
        .map_err(|e| HandlerError::Upstream(format!("re-check get_request failed: {e}")))?;
    let current_status = RequestStatus::from_u8(raw.8).unwrap_or(RequestStatus::Cancelled);
    if current_status != RequestStatus::Pending {
        return Err(HandlerError::NoLongerPending);
    }

    let call = ctx.hub.fulfill_request(
        request_id.to_fixed_bytes(),
        response_bytes.into(),
        DEFAULT_SESSION_ID,
    );

    let raw_gas_estimate = match ctx.adapter.estimate_gas(&call).await {
        Ok(g) => Some(g),
        Err(e) => {
            warn!(request_id = ?request_id, error = %e, "fulfillRequest gas estimation reverted");
            None
        }
    };

    let pricing = ctx.pricing.read().await;
    let eth_price = pricing.eth_price_usdc;
    drop(pricing);

    let gas_price = ctx
        .hub
        .client()
        .get_gas_price()
        .await
        .unwrap_or(U256::zero());

    let outcome = profitability::evaluate(
        raw_gas_estimate,
        gas_price,
        eth_price,
        request.gas_reimbursement_units,
        ctx.gas_buffer_pct,
        ctx.loss_tolerance_units,
    );

    match outcome.verdict {
        Verdict::UndecidableWouldRevert => {
            return Err(HandlerError::SimulationReverted(
                "fulfillRequest would revert".to_string(),
            ))
        }
        Verdict::Unprofitable => return Err(HandlerError::Unprofitable),
        Verdict::Profitable => {}
    }

    if ctx.dry_run {
        info!(request_id = ?request_id, profit = outcome.profit, "dry-run: would fulfill request");
        return Ok(FulfillOutcome::Skipped {
            reason: "dry-run".to_string(),
        });
    }

    let gas_ceiling = outcome.gas_ceiling;
    let hub = ctx.hub.clone();
    let adapter = ctx.adapter.clone();
    let response_for_job = response_bytes;

    let job: crate::sender::SendJob = Box::pin(async move {
        let call = hub.fulfill_request(
            request_id.to_fixed_bytes(),
            response_for_job.into(),
            DEFAULT_SESSION_ID,
        );

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

    let tx_hash = ctx.sender.submit(job).await?;

    info!(request_id = ?request_id, tx_hash = ?tx_hash, "request fulfilled");
    let _ = ctx.broadcast.publish(BroadcastEvent::RequestFulfilled {
        request_id,
        tx_hash,
        timestamp: now_unix(),
    });

    Ok(FulfillOutcome::Fulfilled { tx_hash })
}

/// Submits `cancelRequest(id)` through the shared sender. Used by the
/// router's staleness/unknown-endpoint paths and the sweeper (spec §4.6
/// steps 2-3, §4.8, §7: "unknown endpoint id ... cancelled immediately",
/// "staleness ... cancelled by any agent"). Skips the profitability gate
/// entirely — cancellation is a cleanup action, not a priced one.
pub async fn submit_cancel_request<M: Middleware + 'static>(
    request_id: Id32,
    hub: &Arc<Hub<M>>,
    adapter: &Arc<ChainAdapter<M>>,
    sender: &TransactionSender,
) -> Result<H256, SenderError> {
    let call = hub.cancel_request(request_id.to_fixed_bytes());
    let raw_gas_estimate = adapter
        .estimate_gas(&call)
        .await
        .map_err(|e| SenderError::GasEstimationFailed(e.to_string()))?;
    let gas_ceiling = raw_gas_estimate.saturating_mul(U256::from(120u64)) / U256::from(100u64);

    let hub = hub.clone();
    let adapter = adapter.clone();
    let job: crate::sender::SendJob = Box::pin(async move {
        let call = hub.cancel_request(request_id.to_fixed_bytes());
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

    sender.submit(job).await
}

fn now_unix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
