//! Proxy-less P2P adapter.
//!
//! No media work at all: both offer and answer come from signaling peers,
//! and candidates are forwarded between the linked legs by the session
//! actor. Every operation that needs media is a `Pass`.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{BackendId, Candidate, Sdp, SessionType, StopReason, UpdateKind};

use super::{BackendCtx, BackendFactory, BackendSession, Outcome};

/// Factory for the built-in P2P backend.
pub struct P2pBackend;

#[async_trait]
impl BackendFactory for P2pBackend {
    fn id(&self) -> BackendId {
        BackendId::p2p()
    }

    fn supports(&self, session_type: SessionType) -> bool {
        matches!(session_type, SessionType::P2p | SessionType::Call)
    }

    async fn init(&self, _ctx: &BackendCtx) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(P2pSession))
    }
}

struct P2pSession;

#[async_trait]
impl BackendSession for P2pSession {
    async fn start(&mut self, _ctx: &BackendCtx) -> Outcome {
        Outcome::Pass
    }

    async fn set_offer(&mut self, _offer: &Sdp, _ctx: &BackendCtx) -> Outcome {
        Outcome::ok()
    }

    async fn set_answer(&mut self, _answer: &Sdp, _ctx: &BackendCtx) -> Outcome {
        Outcome::ok()
    }

    async fn update(&mut self, _update: &UpdateKind, _ctx: &BackendCtx) -> Outcome {
        Outcome::Pass
    }

    async fn candidate(&mut self, _candidate: &Candidate, _ctx: &BackendCtx) -> Outcome {
        Outcome::Pass
    }

    async fn engine_event(
        &mut self,
        _event: super::EngineEvent,
        _ctx: &BackendCtx,
    ) -> Outcome {
        Outcome::Pass
    }

    async fn stop(&mut self, _reason: &StopReason, _ctx: &BackendCtx) {}
}
