//! Observer fabric.
//!
//! The single process-wide registry of who is interested in whom. For each
//! subject (a session or call id) the fabric holds the set of observer
//! entries: a hashable key identifying the observer, the observer's
//! [`Lifetime`](crate::lifetime::Lifetime) token, and an opaque payload
//! echoed back to the observer with every event.
//!
//! The fabric is generic over the key and payload types; the core defines
//! the concrete link-key union. Iteration (`fold`) works on a snapshot taken
//! under the per-subject lock, so concurrent add/remove never produces
//! duplicates or misses within a single fold.

use std::collections::HashMap;
use std::hash::Hash;

use dashmap::DashMap;

use crate::lifetime::{Lifetime, LifetimeId};

/// One registration: observer key, liveness token, optional payload.
#[derive(Debug, Clone)]
pub struct ObserverEntry<K, P> {
    pub key: K,
    pub lifetime: Lifetime,
    pub payload: Option<P>,
}

/// Registry of observer entries keyed by subject id.
pub struct ObserverFabric<K, P> {
    subjects: DashMap<String, HashMap<K, ObserverEntry<K, P>>>,
}

impl<K, P> ObserverFabric<K, P>
where
    K: Eq + Hash + Clone,
    P: Clone,
{
    pub fn new() -> Self {
        Self {
            subjects: DashMap::new(),
        }
    }

    /// Register an observer of `subject`. Idempotent on the key: a second
    /// add with the same key replaces the previous entry.
    pub fn add(&self, subject: &str, entry: ObserverEntry<K, P>) {
        self.subjects
            .entry(subject.to_string())
            .or_default()
            .insert(entry.key.clone(), entry);
    }

    /// Remove one observer entry. Returns true if it existed.
    pub fn remove(&self, subject: &str, key: &K) -> bool {
        let mut removed = false;
        if let Some(mut entries) = self.subjects.get_mut(subject) {
            removed = entries.remove(key).is_some();
        }
        self.subjects
            .remove_if(subject, |_, entries| entries.is_empty());
        removed
    }

    /// Drop every entry of a subject (the subject is going away).
    pub fn remove_subject(&self, subject: &str) -> usize {
        self.subjects
            .remove(subject)
            .map(|(_, entries)| entries.len())
            .unwrap_or(0)
    }

    /// Fold over a snapshot of the subject's entries.
    pub fn fold<A, F>(&self, subject: &str, init: A, mut f: F) -> A
    where
        F: FnMut(A, &ObserverEntry<K, P>) -> A,
    {
        let snapshot = self.entries(subject);
        let mut acc = init;
        for entry in &snapshot {
            acc = f(acc, entry);
        }
        acc
    }

    /// Snapshot of a subject's entries.
    pub fn entries(&self, subject: &str) -> Vec<ObserverEntry<K, P>> {
        self.subjects
            .get(subject)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Look up one entry.
    pub fn get(&self, subject: &str, key: &K) -> Option<ObserverEntry<K, P>> {
        self.subjects
            .get(subject)
            .and_then(|entries| entries.get(key).cloned())
    }

    pub fn observer_count(&self, subject: &str) -> usize {
        self.subjects
            .get(subject)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Remove and return every entry registered under the given lifetime,
    /// across all subjects. Used for cleanup when a lifetime ends.
    pub fn on_lifetime_end(&self, lifetime: LifetimeId) -> Vec<(String, K)> {
        self.collect_dead(|entry| entry.lifetime.id() == lifetime)
    }

    /// Remove and return every entry whose lifetime has ended.
    pub fn sweep(&self) -> Vec<(String, K)> {
        self.collect_dead(|entry| entry.lifetime.is_ended())
    }

    fn collect_dead<F>(&self, mut dead: F) -> Vec<(String, K)>
    where
        F: FnMut(&ObserverEntry<K, P>) -> bool,
    {
        let mut out = Vec::new();
        for mut subject in self.subjects.iter_mut() {
            let name = subject.key().clone();
            subject.value_mut().retain(|key, entry| {
                if dead(entry) {
                    out.push((name.clone(), key.clone()));
                    false
                } else {
                    true
                }
            });
        }
        let empty: Vec<String> = self
            .subjects
            .iter()
            .filter(|s| s.value().is_empty())
            .map(|s| s.key().clone())
            .collect();
        for name in empty {
            self.subjects.remove_if(&name, |_, entries| entries.is_empty());
        }
        out
    }
}

impl<K, P> Default for ObserverFabric<K, P>
where
    K: Eq + Hash + Clone,
    P: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
