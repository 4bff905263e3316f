//! Broadcast sink (spec §6 "Broadcast sink"): the push channel downstream
//! readers subscribe to. The actual SSE/websocket transport that relays
//! these events to external consumers is an explicitly out-of-scope
//! external collaborator (spec §1); this module owns the narrow interface
//! an in-process transport adapter would sit on top of.
//!
//! Grounded on `worldcoin-signup-sequencer`'s `src/event_bus.rs`
//! (`Event` enum + `Sender`/`Receiver` over `tokio::sync::broadcast`),
//! generalized from one event variant to the full set named in spec §6.

use crate::model::Id32;
use ethers::types::H256;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::SendError, Receiver};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BroadcastEvent {
    RequestCreated {
        request_id: Id32,
        endpoint_id: Id32,
        timestamp: u64,
    },
    RequestRouting {
        request_id: Id32,
        endpoint_id: Id32,
        timestamp: u64,
    },
    RequestTimeout {
        request_id: Id32,
        reason: String,
        timestamp: u64,
    },
    RequestFulfilled {
        request_id: Id32,
        tx_hash: H256,
        timestamp: u64,
    },
    RequestCancelled {
        request_id: Id32,
        timestamp: u64,
    },
    KeepaliveFulfilled {
        subscription_id: Id32,
        tx_hash: H256,
        timestamp: u64,
    },
    KeepaliveSkipped {
        subscription_id: Id32,
        reason: String,
        timestamp: u64,
    },
    KeepaliveSubscriptionCreated {
        subscription_id: Id32,
        timestamp: u64,
    },
    KeepaliveSubscriptionCancelled {
        subscription_id: Id32,
        timestamp: u64,
    },
    AppState {
        timestamp: u64,
        data: Value,
    },
    PricingUpdate {
        timestamp: u64,
        data: Value,
    },
}

/// The narrow push/subscribe interface the state cache and the
/// fulfillment/keep-alive loops publish through.
pub trait BroadcastSink: Send + Sync {
    fn publish(&self, event: BroadcastEvent) -> Result<(), SendError<BroadcastEvent>>;
    fn subscribe(&self) -> Receiver<BroadcastEvent>;
}

/// In-process implementation: a `tokio::sync::broadcast` channel. An
/// external HTTP/SSE layer (out of scope here) would hold a clone of this
/// sink, `subscribe()`, and relay received events to connected clients.
pub struct InProcessBroadcastSink {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl InProcessBroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl BroadcastSink for InProcessBroadcastSink {
    fn publish(&self, event: BroadcastEvent) -> Result<(), SendError<BroadcastEvent>> {
        // `send` errors only when there are zero receivers; that is a
        // normal, harmless state (no subscribers yet) so callers should
        // generally ignore it, same as `event_bus.rs::publish` propagating
        // the error for the caller to decide.
        self.sender.send(event).map(|_| ())
    }

    fn subscribe(&self) -> Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_misses_events_sent_before_subscribing() {
        let sink = InProcessBroadcastSink::new(16);
        let _ = sink.publish(BroadcastEvent::RequestCancelled {
            request_id: Id32::zero(),
            timestamp: 1,
        });

        let mut rx = sink.subscribe();
        let _ = sink.publish(BroadcastEvent::RequestCancelled {
            request_id: Id32::zero(),
            timestamp: 2,
        });

        let got = rx.recv().await.unwrap();
        match got {
            BroadcastEvent::RequestCancelled { timestamp, .. } => assert_eq!(timestamp, 2),
            _ => panic!("unexpected event"),
        }
    }

    #[test]
    fn publish_with_no_subscribers_is_not_fatal() {
        let sink = InProcessBroadcastSink::new(4);
        // Should not panic; the send error (no receivers) is informational.
        let _ = sink.publish(BroadcastEvent::RequestCancelled {
            request_id: Id32::zero(),
            timestamp: 0,
        });
    }
}
