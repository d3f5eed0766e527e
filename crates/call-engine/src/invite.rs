//! Invite dispatch.
//!
//! Calls reach their destinations through an ordered chain of
//! [`CallPlugin`]s, one per signaling adapter. A plugin that cannot handle
//! a destination returns [`InviteReply::Pass`] and the next one is tried.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use mediahub_session_core::{CallId, Destination, Link, Sdp};

/// Default ring time for a launched invite.
pub const DEF_RING: Duration = Duration::from_secs(30);

/// Hard cap on ring time, whatever the destination asked for.
pub const MAX_RING: Duration = Duration::from_secs(180);

/// Effective ring duration for a destination.
pub fn ring_duration(requested_secs: Option<u64>) -> Duration {
    let requested = requested_secs
        .map(Duration::from_secs)
        .unwrap_or(DEF_RING);
    requested.min(MAX_RING)
}

/// Reply of one plugin to an invite dispatch.
#[derive(Debug)]
pub enum InviteReply {
    /// Leg launched; the link identifies it for ringing/answered/rejected.
    Ok { link: Link },
    /// Try this destination again after the given delay.
    Retry { secs: u64 },
    /// Drop this destination.
    Remove,
    /// Not my kind of destination.
    Pass,
}

/// One invite-dispatch plugin.
#[async_trait]
pub trait CallPlugin: Send + Sync {
    async fn invite(
        &self,
        call_id: &CallId,
        dest: &Destination,
        offer: Option<&Sdp>,
        meta: &Value,
    ) -> InviteReply;

    /// Cancel a leg previously launched by this plugin. Plugins ignore
    /// links they did not create.
    async fn cancel(&self, call_id: &CallId, link: &Link);
}

/// Ordered plugin chain with `Pass` fall-through.
pub struct PluginChain {
    plugins: RwLock<Vec<Arc<dyn CallPlugin>>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, plugin: Arc<dyn CallPlugin>) {
        self.plugins.write().unwrap().push(plugin);
    }

    /// Dispatch an invite through the chain. All-pass collapses to
    /// `Remove`: nothing can reach this destination.
    pub async fn invite(
        &self,
        call_id: &CallId,
        dest: &Destination,
        offer: Option<&Sdp>,
        meta: &Value,
    ) -> InviteReply {
        let plugins: Vec<Arc<dyn CallPlugin>> =
            self.plugins.read().unwrap().iter().cloned().collect();
        for plugin in plugins {
            match plugin.invite(call_id, dest, offer, meta).await {
                InviteReply::Pass => continue,
                reply => return reply,
            }
        }
        InviteReply::Remove
    }

    pub async fn cancel(&self, call_id: &CallId, link: &Link) {
        let plugins: Vec<Arc<dyn CallPlugin>> =
            self.plugins.read().unwrap().iter().cloned().collect();
        for plugin in plugins {
            plugin.cancel(call_id, link).await;
        }
    }
}

impl Default for PluginChain {
    fn default() -> Self {
        Self::new()
    }
}

/// One outbound invite of a call.
pub(crate) struct Invite {
    pub dest: Destination,
    pub launched: bool,
    pub removed: bool,
    pub link: Option<Link>,
    pub wait_timer: Option<JoinHandle<()>>,
    pub ring_timer: Option<JoinHandle<()>>,
}

impl Invite {
    pub fn new(dest: Destination) -> Self {
        Self {
            dest,
            launched: false,
            removed: false,
            link: None,
            wait_timer: None,
            ring_timer: None,
        }
    }

    /// Still a candidate for winning the call.
    pub fn live(&self) -> bool {
        !self.removed
    }

    pub fn abort_timers(&mut self) {
        if let Some(t) = self.wait_timer.take() {
            t.abort();
        }
        if let Some(t) = self.ring_timer.take() {
            t.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_capped() {
        assert_eq!(ring_duration(None), DEF_RING);
        assert_eq!(ring_duration(Some(5)), Duration::from_secs(5));
        assert_eq!(ring_duration(Some(100_000)), MAX_RING);
    }
}
