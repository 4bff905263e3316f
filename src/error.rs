//! Typed error taxonomy for the chain adapter boundary (spec §4.1, §7).
//!
//! No retries live behind these errors — callers (watcher, sender, cache)
//! decide retry/backoff policy, matching the teacher's
//! `scanner.rs::fetch_logs_with_retries` keeping retry policy at the call
//! site rather than inside the thing it calls.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("rpc unavailable: {0}")]
    RpcUnavailable(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("simulation would revert: {0}")]
    RevertedSimulation(String),

    #[error("rate limited")]
    RateLimited,

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl AdapterError {
    /// Transient errors (spec §7: "Transient RPC") are the ones watchers
    /// and the cache retry/tolerate; simulation reverts are a normal
    /// economic outcome, never retried in the same cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::RpcUnavailable(_) | AdapterError::RateLimited | AdapterError::Timeout(_)
        )
    }
}

/// Classifies a raw provider error into the typed taxonomy. `ethers`
/// surfaces reverts as a generic contract/provider error, so we pattern
/// match on its string rendering the same way `collector.rs` logs
/// `err.to_string()` into `FailureRecord::reason` without attempting
/// finer-grained decoding.
pub fn classify_provider_error<E: std::fmt::Display>(err: &E) -> AdapterError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("revert") {
        AdapterError::RevertedSimulation(msg)
    } else if lower.contains("rate limit") || lower.contains("429") {
        AdapterError::RateLimited
    } else if lower.contains("timed out") || lower.contains("timeout") {
        AdapterError::Timeout(msg)
    } else {
        AdapterError::RpcUnavailable(msg)
    }
}
