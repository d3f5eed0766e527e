//! SIP registrar: contact bindings with expiry.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// One contact binding.
#[derive(Debug, Clone)]
pub struct Binding {
    pub contact: String,
    pub expires_at: Instant,
}

/// Address-of-record → contact store. Expired bindings are pruned lazily on
/// lookup.
pub struct Registrar {
    bindings: DashMap<String, Binding>,
}

impl Registrar {
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
        }
    }

    /// Register or refresh a binding. Zero expiry unregisters.
    pub fn register(&self, aor: &str, contact: &str, expires_secs: u64) {
        if expires_secs == 0 {
            debug!(aor, "unregistered");
            self.bindings.remove(aor);
            return;
        }
        debug!(aor, contact, expires_secs, "registered");
        self.bindings.insert(
            aor.to_string(),
            Binding {
                contact: contact.to_string(),
                expires_at: Instant::now() + Duration::from_secs(expires_secs),
            },
        );
    }

    pub fn lookup(&self, aor: &str) -> Option<String> {
        self.bindings
            .remove_if(aor, |_, b| b.expires_at <= Instant::now());
        self.bindings.get(aor).map(|b| b.contact.clone())
    }

    pub fn is_registered(&self, aor: &str) -> bool {
        self.lookup(aor).is_some()
    }

    pub fn list(&self) -> Vec<String> {
        self.bindings.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_unregister() {
        let registrar = Registrar::new();
        registrar.register("alice@example.org", "sip:alice@10.0.0.5:5060", 3600);
        assert_eq!(
            registrar.lookup("alice@example.org"),
            Some("sip:alice@10.0.0.5:5060".to_string())
        );

        registrar.register("alice@example.org", "sip:alice@10.0.0.5:5060", 0);
        assert!(!registrar.is_registered("alice@example.org"));
    }

    #[test]
    fn expired_bindings_are_pruned() {
        let registrar = Registrar::new();
        registrar.bindings.insert(
            "bob@example.org".to_string(),
            Binding {
                contact: "sip:bob@10.0.0.6".to_string(),
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );
        assert!(registrar.lookup("bob@example.org").is_none());
    }
}
