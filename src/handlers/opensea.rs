//! Illustrative handler for an "OpenSea-style" REST endpoint family:
//! a GET against a path built from the request params, response body
//! forwarded as the fulfillment payload. Same grounding as
//! `alchemy.rs` (`aa-rs`'s `reqwest` usage); differs only in HTTP verb
//! and URL construction, which is the actual shape of variation across
//! real upstream API families.

use async_trait::async_trait;
use ethers::providers::Middleware;
use serde::Deserialize;

use super::{submit_fulfillment, EndpointHandler, FulfillContext, FulfillOutcome, HandlerError};
use crate::model::Request;

#[derive(Debug, Deserialize)]
struct OpenseaParams {
    path: String,
}

pub struct OpenseaHandler {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl OpenseaHandler {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl<M> EndpointHandler<M> for OpenseaHandler
where
    M: Middleware + 'static,
{
    async fn fulfill(
        &self,
        request: &Request,
        ctx: &FulfillContext<M>,
    ) -> Result<FulfillOutcome, HandlerError> {
        let params: OpenseaParams = serde_json::from_slice(&request.params)
            .map_err(|e| HandlerError::Upstream(format!("malformed params: {e}")))?;

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), params.path);
        let mut req = ctx.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-KEY", key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| HandlerError::Upstream(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(HandlerError::Upstream(format!(
                "upstream returned {}",
                resp.status()
            )));
        }

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
