//! # mediahub - a media-signaling orchestrator
//!
//! A stateful hub mediating between human-facing signaling endpoints (SIP,
//! the Verto WebRTC protocol, an external programmatic API) and
//! media-processing backends (the FS conferencing engine, the KMS WebRTC
//! engine). It accepts an invite from one party, negotiates an SDP
//! offer/answer with a backend, optionally forwards the negotiated media to
//! a second party, and tracks the lifecycle of every leg, failing all
//! dependent legs atomically when any one fails.
//!
//! ## Components
//!
//! - [`session_core`]: one state machine per media leg, backend adapter seam
//! - [`call_engine`]: multi-leg invite coordination with first-answer-wins
//! - [`infra_common`]: observer fabric, lifetime tokens, event bus
//! - [`backend_fs`] / [`backend_kms`]: media engine adapters
//! - [`signaling_core`]: the SIP, Verto, and External-API endpoints
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediahub::MediaHubBuilder;
//! # use mediahub::backend_fs::FsEngine;
//! # use mediahub::backend_kms::KmsEngine;
//! # fn engines() -> (Arc<dyn FsEngine>, Arc<dyn KmsEngine>) { unimplemented!() }
//!
//! # async fn run() {
//! let (fs, kms) = engines();
//! let hub = MediaHubBuilder::new()
//!     .with_fs_engine(fs)
//!     .with_kms_engine(kms)
//!     .build();
//!
//! let verto_conn = hub.verto.connect();
//! let api_conn = hub.api.connect();
//! # }
//! ```

// Re-export all crates as modules
pub use mediahub_backend_fs as backend_fs;
pub use mediahub_backend_kms as backend_kms;
pub use mediahub_call_engine as call_engine;
pub use mediahub_infra_common as infra_common;
pub use mediahub_session_core as session_core;
pub use mediahub_signaling_core as signaling_core;

use std::sync::Arc;

use tracing::info;

use mediahub_backend_fs::{FsBackend, FsEngine};
use mediahub_backend_kms::{KmsBackend, KmsEngine};
use mediahub_call_engine::{CallEngine, CallPlugin, Resolver};
use mediahub_session_core::{
    CallLauncher, HubConfig, ServiceId, SessionManager,
};
use mediahub_signaling_core::{
    AllowAllLogin, ApiAdapter, DefaultSipInvite, SipAdapter, SipInviteHook, SipOutput,
    VertoAdapter, VertoLoginHook,
};

/// A fully wired hub.
pub struct MediaHub {
    pub manager: SessionManager,
    pub calls: CallEngine,
    pub verto: VertoAdapter,
    pub api: ApiAdapter,
    /// Present when a SIP stack was attached.
    pub sip: Option<SipAdapter>,
}

/// Builder wiring the session layer, the call layer, the backends, and the
/// signaling endpoints together.
pub struct MediaHubBuilder {
    config: HubConfig,
    service: ServiceId,
    fs: Option<Arc<dyn FsEngine>>,
    kms: Option<Arc<dyn KmsEngine>>,
    verto_login: Arc<dyn VertoLoginHook>,
    sip_output: Option<Arc<dyn SipOutput>>,
    sip_hook: Option<Arc<dyn SipInviteHook>>,
    resolvers: Vec<Arc<dyn Resolver>>,
    plugins: Vec<Arc<dyn CallPlugin>>,
}

impl MediaHubBuilder {
    pub fn new() -> Self {
        Self {
            config: HubConfig::default(),
            service: ServiceId::new("root"),
            fs: None,
            kms: None,
            verto_login: Arc::new(AllowAllLogin),
            sip_output: None,
            sip_hook: None,
            resolvers: Vec::new(),
            plugins: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_service(mut self, service: ServiceId) -> Self {
        self.service = service;
        self
    }

    pub fn with_fs_engine(mut self, engine: Arc<dyn FsEngine>) -> Self {
        self.fs = Some(engine);
        self
    }

    pub fn with_kms_engine(mut self, engine: Arc<dyn KmsEngine>) -> Self {
        self.kms = Some(engine);
        self
    }

    pub fn with_verto_login(mut self, hook: Arc<dyn VertoLoginHook>) -> Self {
        self.verto_login = hook;
        self
    }

    /// Attach a SIP stack. Without one, the SIP endpoint is absent.
    pub fn with_sip(mut self, output: Arc<dyn SipOutput>) -> Self {
        self.sip_output = Some(output);
        self
    }

    pub fn with_sip_invite_hook(mut self, hook: Arc<dyn SipInviteHook>) -> Self {
        self.sip_hook = Some(hook);
        self
    }

    /// Custom resolvers run before the endpoint resolvers.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    /// Custom invite plugins run before the endpoint plugins.
    pub fn with_plugin(mut self, plugin: Arc<dyn CallPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn build(self) -> MediaHub {
        let manager = SessionManager::new(self.config);
        if let Some(engine) = self.fs {
            manager.register_backend(Arc::new(FsBackend::new(engine, manager.router())));
        }
        if let Some(engine) = self.kms {
            manager.register_backend(Arc::new(KmsBackend::new(engine, manager.router())));
        }

        let calls = CallEngine::new(&manager);
        manager.set_call_launcher(Arc::new(calls.clone()) as Arc<dyn CallLauncher>);

        for resolver in self.resolvers {
            calls.register_resolver(resolver);
        }
        for plugin in self.plugins {
            calls.register_plugin(plugin);
        }

        let verto = VertoAdapter::new(
            self.service.clone(),
            manager.clone(),
            calls.clone(),
            self.verto_login,
        );
        calls.register_plugin(verto.plugin());
        calls.register_resolver(verto.resolver());

        let api = ApiAdapter::new(self.service.clone(), manager.clone(), calls.clone());
        calls.register_plugin(api.plugin());

        let sip = self.sip_output.map(|output| {
            let hook = self
                .sip_hook
                .unwrap_or_else(|| Arc::new(DefaultSipInvite::new(manager.clone())));
            let adapter = SipAdapter::new(
                self.service.clone(),
                manager.clone(),
                calls.clone(),
                output,
                hook,
            );
            calls.register_plugin(adapter.plugin());
            calls.register_resolver(adapter.resolver());
            adapter
        });

        info!(service = %self.service, sip = sip.is_some(), "media hub wired");
        MediaHub {
            manager,
            calls,
            verto,
            api,
            sip,
        }
    }
}

impl Default for MediaHubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Common imports for mediahub applications.
pub mod prelude {
    pub use crate::{MediaHub, MediaHubBuilder};

    pub use mediahub_call_engine::{
        CallConfig, CallEngine, CallHandle, CallPlugin, InviteReply, Resolver,
    };
    pub use mediahub_infra_common::{
        EventBus, EventFrame, Lifetime, LifetimeGuard, ObjClass, Topic,
    };
    pub use mediahub_session_core::{
        BackendId, CallId, Candidate, CoreError, CoreEvent, CoreEventKind, Destination,
        DestToken, EventSink, HubConfig, IceCandidate, Link, LinkKey, Registration, Result,
        RoomId, Sdp, SdpType, ServiceId, SessionConfig, SessionHandle, SessionId, SessionManager,
        SessionType, StopReason, TypeExt, UpdateKind,
    };
    pub use mediahub_signaling_core::{
        ApiAdapter, SipAdapter, VertoAdapter,
    };
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
