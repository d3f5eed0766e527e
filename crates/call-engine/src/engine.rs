//! Call engine: registry and entry point of the call layer.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use mediahub_infra_common::{EventBus, LifetimeGuard, ObserverFabric};

use mediahub_session_core::{
    CallId, CallLauncher, CallSpawn, LinkKey, Registration, Result, Sdp, ServiceId,
    SessionId, SessionManager,
};

use crate::call::actor::CallActor;
use crate::call::handle::CallHandle;
use crate::call::state::CallState;
use crate::invite::{CallPlugin, PluginChain};
use crate::resolver::{Resolver, ResolverChain};

/// Configuration of one new call.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub service: ServiceId,
    pub callee: String,
    /// Offer shared with every out-leg.
    pub offer: Option<Sdp>,
    pub meta: Value,
    /// Initial observer registration (the initiating adapter or session).
    pub register: Option<Registration>,
    pub caller_session: Option<SessionId>,
}

impl CallConfig {
    pub fn new(service: ServiceId, callee: impl Into<String>) -> Self {
        Self {
            service,
            callee: callee.into(),
            offer: None,
            meta: Value::Null,
            register: None,
            caller_session: None,
        }
    }

    pub fn with_offer(mut self, offer: Sdp) -> Self {
        self.offer = Some(offer);
        self
    }

    pub fn with_register(mut self, registration: Registration) -> Self {
        self.register = Some(registration);
        self
    }

    pub fn with_caller_session(mut self, session: SessionId) -> Self {
        self.caller_session = Some(session);
        self
    }
}

/// Result of starting a call. Resolution and invites proceed
/// asynchronously; lifecycle lands on the registered observers and the
/// topic bus.
#[derive(Debug, Clone)]
pub struct StartedCall {
    pub id: CallId,
    pub handle: CallHandle,
}

/// State shared between the engine and every call actor.
pub(crate) struct CallEngineShared {
    pub(crate) bus: Arc<EventBus>,
    pub(crate) fabric: Arc<ObserverFabric<LinkKey, Registration>>,
    pub(crate) resolvers: ResolverChain,
    pub(crate) plugins: PluginChain,
    pub(crate) calls: DashMap<CallId, CallHandle>,
}

/// Public face of the call layer.
#[derive(Clone)]
pub struct CallEngine {
    shared: Arc<CallEngineShared>,
}

impl CallEngine {
    /// Build against a session manager, sharing its event bus and observer
    /// fabric.
    pub fn new(manager: &SessionManager) -> Self {
        Self {
            shared: Arc::new(CallEngineShared {
                bus: manager.bus(),
                fabric: manager.fabric(),
                resolvers: ResolverChain::new(),
                plugins: PluginChain::new(),
                calls: DashMap::new(),
            }),
        }
    }

    pub fn register_resolver(&self, resolver: Arc<dyn Resolver>) {
        self.shared.resolvers.register(resolver);
    }

    pub fn register_plugin(&self, plugin: Arc<dyn CallPlugin>) {
        self.shared.plugins.register(plugin);
    }

    /// Start a call. Returns immediately; the actor resolves and invites in
    /// the background.
    pub fn start_call(&self, config: CallConfig) -> StartedCall {
        let id = CallId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = LifetimeGuard::new();
        let handle = CallHandle::new(id.clone(), tx.clone(), guard.watcher());
        self.shared.calls.insert(id.clone(), handle.clone());

        debug!(call_id = %id, callee = %config.callee, "starting call");
        let state = CallState::new(
            id.clone(),
            config.service,
            config.callee,
            config.offer,
            config.meta,
            config.caller_session,
        );
        let actor = CallActor::new(state, self.shared.clone(), rx, tx, guard);
        tokio::spawn(actor.run(config.register));

        StartedCall { id, handle }
    }

    pub fn call(&self, id: &CallId) -> Option<CallHandle> {
        self.shared.calls.get(id).map(|h| h.clone())
    }

    pub fn list_calls(&self) -> Vec<CallId> {
        self.shared.calls.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl CallLauncher for CallEngine {
    async fn launch(&self, spawn: CallSpawn) -> Result<CallId> {
        let mut config = CallConfig::new(spawn.service, spawn.callee);
        config.offer = spawn.offer;
        config.meta = spawn.meta;
        config.caller_session = spawn.caller_session;
        config.register = spawn.link.map(Registration::new);
        Ok(self.start_call(config).id)
    }
}
