//! Protocol subsystems whose contract ABIs spec §6 never defines: locker,
//! governor, timelock, leaderboard, proposals, dispute, and bazaar state.
//! Spec §4.9 names all of them as fields the state cache gathers, but §6's
//! "Contract read surface" only gives concrete method signatures for Hub,
//! KeepAlive, and Staking — so unlike those three, this crate has nothing
//! to `abigen!` against for the rest.
//!
//! Modeled the same way `identity.rs` models the identity service: a
//! narrow trait consulted every refresh, with a null default that always
//! degrades rather than blocking a refresh on a service this crate has no
//! concrete binding for (spec §9's "a failure fetching one piece of state
//! does not discard the rest", extended here to "an unspecified piece of
//! state doesn't block the rest either").

use async_trait::async_trait;
use serde_json::Value;

/// One slot per named-but-unbound subsystem. `None` means "no resolver
/// configured or the resolver didn't have data"; the field is still
/// present on every `Snapshot` so none of spec §4.9's named subsystems
/// is silently absent from the data model.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExtendedState {
    pub locker: Option<Value>,
    pub governor: Option<Value>,
    pub timelock: Option<Value>,
    pub leaderboard: Option<Value>,
    pub proposals: Option<Value>,
    pub dispute: Option<Value>,
    pub bazaar: Option<Value>,
}

#[async_trait]
pub trait ExtendedStateResolver: Send + Sync {
    async fn resolve(&self) -> ExtendedState;
}

/// Default resolver: every field degrades to `None`. A deployment with
/// real locker/governor/timelock/etc. bindings would supply its own
/// `ExtendedStateResolver` instead of swapping this module out.
pub struct NullExtendedStateResolver;

#[async_trait]
impl ExtendedStateResolver for NullExtendedStateResolver {
    async fn resolve(&self) -> ExtendedState {
        ExtendedState::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_resolver_degrades_every_field_to_none() {
        let state = NullExtendedStateResolver.resolve().await;
        assert!(state.locker.is_none());
        assert!(state.governor.is_none());
        assert!(state.timelock.is_none());
        assert!(state.leaderboard.is_none());
        assert!(state.proposals.is_none());
        assert!(state.dispute.is_none());
        assert!(state.bazaar.is_none());
    }
}
