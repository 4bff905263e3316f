//! Illustrative handler for an "Alchemy-style" read-only chain-data
//! endpoint family: one upstream JSON-RPC call, response forwarded
//! through unchanged. Grounded on `aa-rs`'s `reqwest::Client` usage for
//! calling an external bundler RPC from an agent-side binary — the
//! closest pack example of an agent making an outbound JSON-RPC call of
//! its own, as opposed to talking to the chain via `ethers`.

use async_trait::async_trait;
use ethers::providers::Middleware;
use serde_json::json;

use super::{submit_fulfillment, EndpointHandler, FulfillContext, FulfillOutcome, HandlerError};
use crate::model::Request;

pub struct AlchemyHandler {
    pub upstream_url: String,
}

impl AlchemyHandler {
    pub fn new(upstream_url: impl Into<String>) -> Self {
        Self {
            upstream_url: upstream_url.into(),
        }
    }
}

#[async_trait]
impl<M> EndpointHandler<M> for AlchemyHandler
where
    M: Middleware + 'static,
{
    async fn fulfill(
        &self,
        request: &Request,
        ctx: &FulfillContext<M>,
    ) -> Result<FulfillOutcome, HandlerError> {
        // `request.params` is opaque ABI-encoded bytes per spec §3; this
        // illustrative handler assumes it's already a JSON-RPC body and
        // forwards it verbatim, which is exactly the kind of per-family
        // decoding the router's handler registry exists to isolate.
        let body: serde_json::Value =
            serde_json::from_slice(&request.params).unwrap_or_else(|_| json!({}));

        let resp = ctx
            .http
            .post(&self.upstream_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HandlerError::Upstream(e.to_string()))?;

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| HandlerError::Upstream(e.to_string()))?;

        if bytes.len() as u64 > crate::handlers::MAX_RESPONSE_BYTES_FALLBACK {
            return Err(HandlerError::ResponseTooLarge);
        }

        submit_fulfillment(request, bytes.to_vec(), ctx).await
    }
}
