//! Backend adapter seam.
//!
//! A backend adapter owns the media side of one session. The session actor
//! drives it through the [`BackendSession`] trait and applies whatever
//! attribute mutations ([`ExtOps`]) the adapter requests, atomically with
//! the operation's reply and before any outbound event is emitted.
//!
//! Adapters form an ordered chain: an operation an adapter does not handle
//! returns [`Outcome::Pass`] and falls through to the session's default
//! behavior.

pub mod p2p;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{CoreError, Result};
use crate::types::{
    BackendId, Candidate, Sdp, SdpType, ServiceId, SessionId, SessionType, StopReason, TypeExt,
    UpdateKind,
};

/// Attribute mutations an adapter requests alongside an operation's reply.
/// Applied by the session actor before it emits any event.
#[derive(Debug, Clone, Default)]
pub struct ExtOps {
    pub offer: Option<Sdp>,
    pub answer: Option<Sdp>,
    pub session_type: Option<SessionType>,
    pub type_ext: Option<TypeExt>,
}

impl ExtOps {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn answer(answer: Sdp) -> Self {
        Self {
            answer: Some(answer),
            ..Self::default()
        }
    }

    pub fn offer(offer: Sdp) -> Self {
        Self {
            offer: Some(offer),
            ..Self::default()
        }
    }

    pub fn retype(session_type: SessionType, ext: TypeExt) -> Self {
        Self {
            session_type: Some(session_type),
            type_ext: Some(ext),
            ..Self::default()
        }
    }
}

/// Result of one adapter operation.
#[derive(Debug)]
pub enum Outcome {
    /// Operation handled; `reply` goes back to the caller, `ops` mutate the
    /// session.
    Ok { reply: Value, ops: ExtOps },
    /// Operation failed. Whether this stops the session depends on the
    /// operation (start/answer failures do, update failures do not).
    Err(CoreError),
    /// Not handled here; fall through.
    Pass,
}

impl Outcome {
    pub fn ok() -> Self {
        Outcome::Ok {
            reply: Value::Null,
            ops: ExtOps::none(),
        }
    }

    pub fn with_ops(ops: ExtOps) -> Self {
        Outcome::Ok {
            reply: Value::Null,
            ops,
        }
    }

    pub fn reply(reply: Value) -> Self {
        Outcome::Ok {
            reply,
            ops: ExtOps::none(),
        }
    }

    pub fn err(err: impl Into<CoreError>) -> Self {
        Outcome::Err(err.into())
    }
}

/// Read-only view of the owning session, cloned per operation.
#[derive(Debug, Clone)]
pub struct BackendCtx {
    pub session_id: SessionId,
    pub service: ServiceId,
    pub session_type: SessionType,
    pub type_ext: TypeExt,
    pub offer: Option<Sdp>,
    pub answer: Option<Sdp>,
    /// SDP flavor for generated offers, when the session is the offerer.
    pub sdp_type: SdpType,
}

/// Asynchronous notification from a media engine about one session's leg.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Leg reached the neutral (parked) state.
    Parked,
    /// Leg was bridged; the adapter resolves the peer session when it can.
    Bridged { peer_session: Option<SessionId> },
    /// Engine hung the leg up.
    Hangup { code: Option<u16> },
    /// Leg destroyed on the engine side.
    Destroyed,
    /// Engine-generated trickle candidate for the client.
    Candidate { candidate: Candidate },
    /// Endpoint is ready to take client candidates.
    EndpointReady,
    /// Engine-specific info (MCU composition changes and the like).
    Info { body: Value },
}

/// Per-engine factory: decides what it supports and creates the per-session
/// adapter state machine.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    fn id(&self) -> BackendId;

    fn supports(&self, session_type: SessionType) -> bool;

    /// Whether this backend needs a complete SDP offer up front. When true
    /// and the client offer advertises trickle, the session holds the start
    /// until end-of-candidates and aggregates.
    fn needs_full_offer(&self) -> bool {
        false
    }

    async fn init(&self, ctx: &BackendCtx) -> Result<Box<dyn BackendSession>>;
}

/// Per-session adapter state machine, owned and serialized by the session
/// actor.
#[async_trait]
pub trait BackendSession: Send {
    /// Begin media work. With `ctx.offer` set this is the answering path;
    /// without, the adapter is expected to generate an offer via ops.
    async fn start(&mut self, ctx: &BackendCtx) -> Outcome;

    async fn set_offer(&mut self, offer: &Sdp, ctx: &BackendCtx) -> Outcome;

    async fn set_answer(&mut self, answer: &Sdp, ctx: &BackendCtx) -> Outcome;

    async fn update(&mut self, update: &UpdateKind, ctx: &BackendCtx) -> Outcome;

    async fn candidate(&mut self, candidate: &Candidate, ctx: &BackendCtx) -> Outcome;

    /// Asynchronous engine notification routed to this session.
    async fn engine_event(&mut self, event: EngineEvent, ctx: &BackendCtx) -> Outcome;

    /// Release engine resources. Must not fail.
    async fn stop(&mut self, reason: &StopReason, ctx: &BackendCtx);
}

/// Routes engine events to the session that owns the leg. Implemented by
/// the session manager; handed to backend crates at construction.
pub trait SessionEventRouter: Send + Sync {
    fn route(&self, session: &SessionId, event: EngineEvent);
}

/// Ordered registry of backend factories.
pub struct BackendRegistry {
    factories: RwLock<Vec<Arc<dyn BackendFactory>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, factory: Arc<dyn BackendFactory>) {
        self.factories.write().unwrap().push(factory);
    }

    pub fn get(&self, id: &BackendId) -> Option<Arc<dyn BackendFactory>> {
        self.factories
            .read()
            .unwrap()
            .iter()
            .find(|f| &f.id() == id)
            .cloned()
    }

    /// First registered factory that supports the type.
    pub fn select(&self, session_type: SessionType) -> Option<Arc<dyn BackendFactory>> {
        self.factories
            .read()
            .unwrap()
            .iter()
            .find(|f| f.supports(session_type))
            .cloned()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
