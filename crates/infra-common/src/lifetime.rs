//! Lifetime tokens.
//!
//! Every party that registers interest in a session or call hands over a
//! [`Lifetime`]: a cloneable token the subject can watch to learn that the
//! observer has gone away. The observing party keeps the matching
//! [`LifetimeGuard`]; dropping the guard ends the lifetime and wakes every
//! watcher. Built on a `tokio::sync::watch` channel so death detection is
//! push-based rather than polled.

use std::fmt;
use tokio::sync::watch;
use uuid::Uuid;

/// Unique identifier of a lifetime, shared by a guard and all its watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LifetimeId(Uuid);

impl LifetimeId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LifetimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owned end of a lifetime. Dropping the guard ends the lifetime.
#[derive(Debug)]
pub struct LifetimeGuard {
    id: LifetimeId,
    tx: watch::Sender<()>,
}

impl LifetimeGuard {
    /// Create a fresh lifetime.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(());
        Self {
            id: LifetimeId::new(),
            tx,
        }
    }

    /// Identifier shared with every watcher of this lifetime.
    pub fn id(&self) -> LifetimeId {
        self.id
    }

    /// Create a watcher token for this lifetime.
    pub fn watcher(&self) -> Lifetime {
        Lifetime {
            id: self.id,
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for LifetimeGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Watcher end of a lifetime. Cloneable; all clones observe the same guard.
#[derive(Debug, Clone)]
pub struct Lifetime {
    id: LifetimeId,
    rx: watch::Receiver<()>,
}

impl Lifetime {
    /// Identifier of the underlying lifetime.
    pub fn id(&self) -> LifetimeId {
        self.id
    }

    /// True once the guard has been dropped.
    pub fn is_ended(&self) -> bool {
        self.rx.has_changed().is_err()
    }

    /// Resolve when the guard is dropped. Returns immediately if it already
    /// was.
    pub async fn ended(&self) {
        let mut rx = self.rx.clone();
        while rx.changed().await.is_ok() {}
    }
}
