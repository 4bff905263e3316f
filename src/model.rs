//! Data model shared across the agent: requests, endpoints, subscriptions,
//! and the pricing snapshot used to cheaply re-derive costs locally.

use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque 32-byte identifiers used throughout the protocol (request id,
/// endpoint id, subscription id are all `bytes32` on-chain).
pub type Id32 = H256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Fulfilled,
    Cancelled,
}

impl RequestStatus {
    /// Decode the `uint8` status enum as observed on-chain: 0 = Pending,
    /// 1 = Fulfilled, 2 = Cancelled.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Pending),
            1 => Some(Self::Fulfilled),
            2 => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A single API call work item (spec §3 "Request").
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Id32,
    pub endpoint_id: Id32,
    pub requester: Address,
    /// Zero address until fulfilled.
    pub agent: Address,
    pub total_cost_units: U256,
    pub base_cost_units: U256,
    pub markup_units: U256,
    pub gas_reimbursement_units: U256,
    pub created_at: u64,
    pub status: RequestStatus,
    pub params: Vec<u8>,
    pub response: Vec<u8>,
    pub has_callback: bool,
}

/// A registered API handler (spec §3 "Endpoint").
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: Id32,
    pub url: String,
    pub input_format: String,
    pub output_format: String,
    pub base_cost_units: U256,
    pub max_response_bytes: u64,
    pub callback_gas_limit: u64,
    pub estimated_gas_cost_wei: U256,
    pub owner: Address,
    pub active: bool,
    pub registered_at: u64,
}

/// A recurring work item for the keep-alive driver (spec §3 "Subscription").
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Id32,
    pub consumer: Address,
    pub callback_target: Address,
    pub callback_gas_limit: u64,
    pub interval_secs: u64,
    pub fee_per_cycle_units: U256,
    pub estimated_gas_cost_wei: U256,
    /// Zero means unbounded.
    pub max_fulfillments: u64,
    pub fulfillment_count: u64,
    pub last_fulfilled_at: u64,
    pub active: bool,
}

impl Subscription {
    /// Readiness per spec §3: active AND below max-fulfillments AND the
    /// interval has elapsed. The consumer's optional external predicate
    /// (on-chain `isReady`) is checked separately by the caller; this is
    /// the local, cheap half of the readiness check.
    pub fn locally_ready(&self, now: u64) -> bool {
        self.active
            && (self.max_fulfillments == 0 || self.fulfillment_count < self.max_fulfillments)
            && now.saturating_sub(self.last_fulfilled_at) >= self.interval_secs
    }
}

/// ETH price plus per-endpoint gas/cost hints, used to cheaply re-derive
/// per-request economics locally without re-polling every field (spec §3
/// "PricingSnapshot").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingSnapshot {
    /// ETH price in stablecoin units (6 decimals) per 1e18 wei.
    pub eth_price_usdc: U256,
    pub endpoints: HashMap<Id32, EndpointPricing>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EndpointPricing {
    pub estimated_gas_cost_wei: U256,
    pub base_cost_units: U256,
}
