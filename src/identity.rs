//! Identity resolution (address → human-readable name) is an external
//! collaborator per spec §1. The cache's endpoint-owner name resolution
//! depends on it; per the §9 open question, its failure mode is "degrade
//! to null" — modeled here as a trait with a null default rather than
//! hidden behind an `unwrap_or` deep in the cache refresh.

use async_trait::async_trait;
use ethers::types::Address;

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a human-readable name (e.g. a basename) for `address`.
    /// Returns `None` on any failure or when the address has no name.
    async fn resolve(&self, address: Address) -> Option<String>;
}

/// Default resolver used when no identity service is configured: always
/// degrades to `None`, never blocks or errors the cache refresh.
pub struct NullIdentityResolver;

#[async_trait]
impl IdentityResolver for NullIdentityResolver {
    async fn resolve(&self, _address: Address) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_resolver_always_degrades_to_none() {
        let resolver = NullIdentityResolver;
        assert_eq!(resolver.resolve(Address::zero()).await, None);
    }
}
