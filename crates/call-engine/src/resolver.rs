//! Resolver chain.
//!
//! Ordered callbacks that expand a callee string into destination
//! descriptors. Each signaling adapter contributes a resolver for the
//! destinations it can reach; the chain concatenates every resolver's
//! output in registration order.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use mediahub_session_core::{Destination, ServiceId};

/// One resolver in the chain.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Destinations this resolver contributes for the callee; empty when it
    /// has nothing to offer.
    async fn resolve(&self, service: &ServiceId, callee: &str) -> Vec<Destination>;
}

/// Ordered resolver chain.
pub struct ResolverChain {
    resolvers: RwLock<Vec<Arc<dyn Resolver>>>,
}

impl ResolverChain {
    pub fn new() -> Self {
        Self {
            resolvers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, resolver: Arc<dyn Resolver>) {
        self.resolvers.write().unwrap().push(resolver);
    }

    pub async fn resolve(&self, service: &ServiceId, callee: &str) -> Vec<Destination> {
        let resolvers: Vec<Arc<dyn Resolver>> =
            self.resolvers.read().unwrap().iter().cloned().collect();
        let mut destinations = Vec::new();
        for resolver in resolvers {
            destinations.extend(resolver.resolve(service, callee).await);
        }
        destinations
    }
}

impl Default for ResolverChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediahub_session_core::DestToken;

    struct Fixed(Vec<Destination>);

    #[async_trait]
    impl Resolver for Fixed {
        async fn resolve(&self, _service: &ServiceId, _callee: &str) -> Vec<Destination> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn chain_concatenates_in_order() {
        let chain = ResolverChain::new();
        chain.register(Arc::new(Fixed(vec![Destination::new(DestToken::Api {
            user: "a".into(),
        })])));
        chain.register(Arc::new(Fixed(vec![
            Destination::new(DestToken::Api { user: "b".into() }),
            Destination::new(DestToken::Api { user: "c".into() }),
        ])));

        let out = chain.resolve(&ServiceId::new("s"), "whoever").await;
        let users: Vec<String> = out
            .iter()
            .map(|d| match &d.dest {
                DestToken::Api { user } => user.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(users, vec!["a", "b", "c"]);
    }
}
