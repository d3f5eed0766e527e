//! Session handle: the public face of a session actor.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use mediahub_infra_common::Lifetime;

use crate::backend::EngineEvent;
use crate::errors::{CoreError, Result};
use crate::types::{
    Candidate, CoreEvent, EventSink, Link, LinkKey, Registration, Sdp, SessionId, SessionInfo,
    StopReason, UpdateKind,
};

/// Commands a session actor processes from its mailbox.
#[derive(Debug)]
pub enum SessionCmd {
    SetOffer {
        offer: Sdp,
        reply: oneshot::Sender<Result<()>>,
    },
    SetAnswer {
        answer: Sdp,
        reply: oneshot::Sender<Result<()>>,
    },
    Update {
        update: UpdateKind,
        reply: oneshot::Sender<Result<Value>>,
    },
    Candidate {
        candidate: Candidate,
        reply: oneshot::Sender<Result<()>>,
    },
    Register {
        registration: Registration,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        key: LinkKey,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reason: StopReason,
    },
    GetOffer {
        reply: oneshot::Sender<Result<Sdp>>,
    },
    GetAnswer {
        reply: oneshot::Sender<Result<Sdp>>,
    },
    GetInfo {
        reply: oneshot::Sender<SessionInfo>,
    },
    EngineEvent {
        event: EngineEvent,
    },
    /// Peer session asks us to take part in a bridge it initiates.
    PeerBridge {
        from: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Peer session left the bridge; we reset to park.
    PeerBridgeStop {
        from: SessionId,
    },
    /// Candidate forwarded from the linked peer leg, bound for our client.
    PeerCandidate {
        candidate: Candidate,
    },
    ObserverDown {
        key: LinkKey,
    },
    WaitTimeout,
    ReadyTimeout,
    TrickleTimeout,
}

/// Cloneable handle to a running session actor.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::UnboundedSender<SessionCmd>,
    link_tx: mpsc::UnboundedSender<CoreEvent>,
    lifetime: Lifetime,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        tx: mpsc::UnboundedSender<SessionCmd>,
        link_tx: mpsc::UnboundedSender<CoreEvent>,
        lifetime: Lifetime,
    ) -> Self {
        Self {
            id,
            tx,
            link_tx,
            lifetime,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Lifetime of the session itself; ends when the actor exits.
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Identity link of this session, usable as an observer registration on
    /// other subjects.
    pub fn link(&self) -> Link {
        Link::Session {
            id: self.id.clone(),
            lifetime: self.lifetime.clone(),
            sink: EventSink::from_sender(self.link_tx.clone()),
        }
    }

    fn send(&self, cmd: SessionCmd) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| CoreError::SessionNotFound(self.id.clone()))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> SessionCmd,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await
            .map_err(|_| CoreError::SessionNotFound(self.id.clone()))?
    }

    pub async fn set_offer(&self, offer: Sdp) -> Result<()> {
        self.request(|reply| SessionCmd::SetOffer { offer, reply }).await
    }

    pub async fn set_answer(&self, answer: Sdp) -> Result<()> {
        self.request(|reply| SessionCmd::SetAnswer { answer, reply })
            .await
    }

    pub async fn update(&self, update: UpdateKind) -> Result<Value> {
        self.request(|reply| SessionCmd::Update { update, reply }).await
    }

    pub async fn candidate(&self, candidate: Candidate) -> Result<()> {
        self.request(|reply| SessionCmd::Candidate { candidate, reply })
            .await
    }

    /// End-of-candidates convenience.
    pub async fn candidate_end(&self) -> Result<()> {
        self.candidate(Candidate::End).await
    }

    pub async fn register(&self, registration: Registration) -> Result<()> {
        self.request(|reply| SessionCmd::Register { registration, reply })
            .await
    }

    pub async fn unregister(&self, key: LinkKey) -> Result<()> {
        self.request(|reply| SessionCmd::Unregister { key, reply })
            .await
    }

    /// Idempotent; safe to call on an already-stopped session.
    pub fn stop(&self, reason: StopReason) {
        let _ = self.tx.send(SessionCmd::Stop { reason });
    }

    /// Blocks until the offer exists, the session's wait timeout fires
    /// (`NotYet`), or the session stops.
    pub async fn get_offer(&self) -> Result<Sdp> {
        self.request(|reply| SessionCmd::GetOffer { reply }).await
    }

    /// Blocks until the answer exists, the session's ready timeout fires
    /// (`NotYet`), or the session stops.
    pub async fn get_answer(&self) -> Result<Sdp> {
        self.request(|reply| SessionCmd::GetAnswer { reply }).await
    }

    pub async fn get_info(&self) -> Result<SessionInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCmd::GetInfo { reply })?;
        rx.await
            .map_err(|_| CoreError::SessionNotFound(self.id.clone()))
    }

    pub fn engine_event(&self, event: EngineEvent) {
        let _ = self.tx.send(SessionCmd::EngineEvent { event });
    }

    pub(crate) async fn peer_bridge(&self, from: SessionId) -> Result<()> {
        self.request(|reply| SessionCmd::PeerBridge { from, reply })
            .await
    }

    pub(crate) fn peer_bridge_stop(&self, from: SessionId) {
        let _ = self.tx.send(SessionCmd::PeerBridgeStop { from });
    }

    pub(crate) fn peer_candidate(&self, candidate: Candidate) {
        let _ = self.tx.send(SessionCmd::PeerCandidate { candidate });
    }
}
