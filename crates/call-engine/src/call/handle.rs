//! Call handle: the public face of a call actor.

use tokio::sync::{mpsc, oneshot};

use mediahub_infra_common::Lifetime;

use mediahub_session_core::{
    CallId, CoreError, EventSink, Link, LinkKey, Registration, Result, Sdp, StopReason,
};

use super::state::CallInfo;

/// Commands a call actor processes from its mailbox.
#[derive(Debug)]
pub enum CallCmd {
    Ringing {
        key: LinkKey,
        answer: Option<Sdp>,
        reply: oneshot::Sender<Result<()>>,
    },
    Answered {
        key: LinkKey,
        answer: Sdp,
        reply: oneshot::Sender<Result<()>>,
    },
    Rejected {
        key: LinkKey,
        reply: oneshot::Sender<Result<()>>,
    },
    Hangup {
        reason: StopReason,
    },
    Register {
        registration: Registration,
        reply: oneshot::Sender<Result<()>>,
    },
    Unregister {
        key: LinkKey,
        reply: oneshot::Sender<Result<()>>,
    },
    GetInfo {
        reply: oneshot::Sender<CallInfo>,
    },
    /// Internal: launch the invite at `pos` now.
    LaunchOut {
        pos: usize,
    },
    /// Internal: ring timer of the invite at `pos` fired.
    RingTimeout {
        pos: usize,
    },
    /// Internal: a launched invite's link died before answering.
    InviteDown {
        pos: usize,
    },
    /// Internal: a registered observer's lifetime ended.
    ObserverDown {
        key: LinkKey,
    },
}

/// Cloneable handle to a running call actor.
#[derive(Clone, Debug)]
pub struct CallHandle {
    id: CallId,
    tx: mpsc::UnboundedSender<CallCmd>,
    lifetime: Lifetime,
}

impl CallHandle {
    pub(crate) fn new(
        id: CallId,
        tx: mpsc::UnboundedSender<CallCmd>,
        lifetime: Lifetime,
    ) -> Self {
        Self { id, tx, lifetime }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Identity link of this call. Calls do not consume events, so the
    /// sink side is a dead letter; the link's value is its key and
    /// lifetime.
    pub fn link(&self) -> Link {
        let (sink, _rx) = EventSink::channel();
        Link::Call {
            id: self.id.clone(),
            lifetime: self.lifetime.clone(),
            sink,
        }
    }

    fn send(&self, cmd: CallCmd) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| CoreError::CallNotFound(self.id.clone()))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> CallCmd,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await
            .map_err(|_| CoreError::CallNotFound(self.id.clone()))?
    }

    /// Report a launched leg as ringing, optionally with early media.
    pub async fn ringing(&self, key: LinkKey, answer: Option<Sdp>) -> Result<()> {
        self.request(|reply| CallCmd::Ringing { key, answer, reply })
            .await
    }

    /// Report a launched leg as answered. First answer wins.
    pub async fn answered(&self, key: LinkKey, answer: Sdp) -> Result<()> {
        self.request(|reply| CallCmd::Answered { key, answer, reply })
            .await
    }

    /// Report a launched leg as rejected.
    pub async fn rejected(&self, key: LinkKey) -> Result<()> {
        self.request(|reply| CallCmd::Rejected { key, reply }).await
    }

    /// Idempotent; safe to call on an already-stopped call.
    pub fn hangup(&self, reason: StopReason) {
        let _ = self.tx.send(CallCmd::Hangup { reason });
    }

    pub async fn register(&self, registration: Registration) -> Result<()> {
        self.request(|reply| CallCmd::Register { registration, reply })
            .await
    }

    pub async fn unregister(&self, key: LinkKey) -> Result<()> {
        self.request(|reply| CallCmd::Unregister { key, reply }).await
    }

    pub async fn get_info(&self) -> Result<CallInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(CallCmd::GetInfo { reply })?;
        rx.await.map_err(|_| CoreError::CallNotFound(self.id.clone()))
    }
}
