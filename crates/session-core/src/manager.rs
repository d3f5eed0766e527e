//! Session manager: the entry point of the session layer.
//!
//! Owns the session registry, the backend registry, the observer fabric,
//! the event bus, and the room registry. Spawns one actor per session and
//! exposes cloneable handles.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use mediahub_infra_common::{EventBus, LifetimeGuard, ObserverFabric};

use crate::backend::p2p::P2pBackend;
use crate::backend::{BackendFactory, BackendRegistry, EngineEvent, SessionEventRouter};
use crate::config::HubConfig;
use crate::errors::{CoreError, Result};
use crate::rooms::RoomRegistry;
use crate::session::actor::SessionActor;
use crate::session::handle::SessionHandle;
use crate::types::{
    BackendId, CallId, Link, LinkKey, Registration, Sdp, SdpType, ServiceId, SessionId,
    SessionInfo, SessionType, TypeExt,
};

/// Configuration of one new session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service: ServiceId,
    pub session_type: SessionType,
    pub backend: Option<BackendId>,
    pub offer: Option<Sdp>,
    pub type_ext: TypeExt,
    /// Initial observer registration (usually the originating adapter).
    pub register: Option<Registration>,
    /// Master leg of a linked pair; this session's answer propagates there.
    pub master_peer: Option<Link>,
    /// SDP flavor for a backend-generated offer. Defaults to webrtc.
    pub sdp_type: Option<SdpType>,
    pub wait_timeout: Option<Duration>,
    pub ready_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(service: ServiceId, session_type: SessionType) -> Self {
        Self {
            service,
            session_type,
            backend: None,
            offer: None,
            type_ext: TypeExt::default(),
            register: None,
            master_peer: None,
            sdp_type: None,
            wait_timeout: None,
            ready_timeout: None,
        }
    }

    pub fn with_backend(mut self, backend: BackendId) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_offer(mut self, offer: Sdp) -> Self {
        self.offer = Some(offer);
        self
    }

    pub fn with_ext(mut self, type_ext: TypeExt) -> Self {
        self.type_ext = type_ext;
        self
    }

    pub fn with_register(mut self, registration: Registration) -> Self {
        self.register = Some(registration);
        self
    }

    pub fn with_master_peer(mut self, master: Link) -> Self {
        self.master_peer = Some(master);
        self
    }
}

/// Result of a successful session start.
#[derive(Debug, Clone)]
pub struct StartedSession {
    pub id: SessionId,
    pub handle: SessionHandle,
    /// Offer generated by the backend, when the session is the offerer.
    pub offer: Option<Sdp>,
    /// Answer produced synchronously by the backend, when it could.
    pub answer: Option<Sdp>,
}

/// Request handed to the call layer when a session of type `call` needs a
/// multi-leg invite.
#[derive(Debug, Clone)]
pub struct CallSpawn {
    pub service: ServiceId,
    pub callee: String,
    pub offer: Option<Sdp>,
    pub caller_session: Option<SessionId>,
    pub link: Option<Link>,
    pub meta: Value,
}

/// Hook the call engine registers so sessions can launch calls without the
/// session layer depending on it.
#[async_trait]
pub trait CallLauncher: Send + Sync {
    async fn launch(&self, spawn: CallSpawn) -> Result<CallId>;
}

/// State shared between the manager and every session actor.
pub(crate) struct SessionShared {
    pub(crate) config: HubConfig,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) fabric: Arc<ObserverFabric<LinkKey, Registration>>,
    pub(crate) rooms: RoomRegistry,
    pub(crate) sessions: DashMap<SessionId, SessionHandle>,
    pub(crate) backends: BackendRegistry,
    pub(crate) launcher: OnceLock<Arc<dyn CallLauncher>>,
}

impl SessionShared {
    pub(crate) fn session(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|h| h.clone())
    }
}

/// Public face of the session layer.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<SessionShared>,
}

impl SessionManager {
    pub fn new(config: HubConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let backends = BackendRegistry::new();
        // The built-in p2p backend goes first so it is the default for
        // signaling-only session types.
        backends.register(Arc::new(P2pBackend));
        let shared = Arc::new(SessionShared {
            config,
            bus: bus.clone(),
            fabric: Arc::new(ObserverFabric::new()),
            rooms: RoomRegistry::new(bus),
            sessions: DashMap::new(),
            backends,
            launcher: OnceLock::new(),
        });
        Self { shared }
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.shared.bus.clone()
    }

    pub fn fabric(&self) -> Arc<ObserverFabric<LinkKey, Registration>> {
        self.shared.fabric.clone()
    }

    pub fn rooms(&self) -> RoomRegistry {
        self.shared.rooms.clone()
    }

    pub fn register_backend(&self, factory: Arc<dyn BackendFactory>) {
        self.shared.backends.register(factory);
    }

    /// Install the call layer. May be called once.
    pub fn set_call_launcher(&self, launcher: Arc<dyn CallLauncher>) {
        if self.shared.launcher.set(launcher).is_err() {
            warn!("call launcher already installed");
        }
    }

    /// Start a new session and wait for its backend to come up.
    ///
    /// For a trickle offer against a backend that needs complete SDP, this
    /// resolves only once end-of-candidates arrived (or the aggregation
    /// deadline passed) and the held start ran.
    pub async fn start_session(&self, config: SessionConfig) -> Result<StartedSession> {
        let id = SessionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let guard = LifetimeGuard::new();
        let handle = SessionHandle::new(id.clone(), tx.clone(), link_tx, guard.watcher());
        self.shared.sessions.insert(id.clone(), handle.clone());

        debug!(session_id = %id, session_type = %config.session_type, "starting session");
        let (start_tx, start_rx) = oneshot::channel();
        let actor = SessionActor::new(
            id.clone(),
            &config,
            self.shared.clone(),
            rx,
            tx,
            link_rx,
            guard,
            handle.clone(),
        );
        tokio::spawn(actor.run(config, start_tx));

        match start_rx.await {
            Ok(Ok(output)) => Ok(StartedSession {
                id,
                handle,
                offer: output.offer,
                answer: output.answer,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::Internal("session actor died during start".into())),
        }
    }

    pub fn session(&self, id: &SessionId) -> Option<SessionHandle> {
        self.shared.session(id)
    }

    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.shared.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn session_info(&self, id: &SessionId) -> Result<SessionInfo> {
        let handle = self
            .session(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.clone()))?;
        handle.get_info().await
    }

    /// Router handed to backend crates so engines can push events to the
    /// owning sessions.
    pub fn router(&self) -> Arc<dyn SessionEventRouter> {
        Arc::new(ManagerRouter {
            shared: self.shared.clone(),
        })
    }
}

struct ManagerRouter {
    shared: Arc<SessionShared>,
}

impl SessionEventRouter for ManagerRouter {
    fn route(&self, session: &SessionId, event: EngineEvent) {
        match self.shared.session(session) {
            Some(handle) => handle.engine_event(event),
            None => debug!(session_id = %session, "engine event for unknown session"),
        }
    }
}
