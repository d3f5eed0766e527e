//! Session state.

use std::time::{Duration, Instant};

use crate::types::{
    BackendId, Candidate, Sdp, SdpType, ServiceId, SessionId, SessionInfo, SessionType, TypeExt,
};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    WaitOffer,
    WaitAnswer,
    Ready,
    Stopping,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::New => "new",
            Phase::WaitOffer => "wait_offer",
            Phase::WaitAnswer => "wait_answer",
            Phase::Ready => "ready",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Complete state of one session, owned by its actor.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: SessionId,
    pub service: ServiceId,
    pub session_type: SessionType,
    pub type_ext: TypeExt,
    pub backend: Option<BackendId>,

    pub phase: Phase,
    pub entered_phase_at: Instant,

    pub offer: Option<Sdp>,
    pub answer: Option<Sdp>,
    /// SDP flavor for backend-generated offers.
    pub sdp_type: SdpType,

    /// Candidates from the local client, buffered until the remote leg is
    /// known (p2p) or the backend endpoint is ready.
    pub candidate_buf: Vec<Candidate>,

    /// Bridged/linked pair bookkeeping. The master created the pair and
    /// owns its lifecycle; the slave only observes.
    pub master_peer: Option<SessionId>,
    pub slave_peer: Option<SessionId>,
    pub park_after_bridge: bool,

    pub stop_sent: bool,

    pub wait_timeout: Duration,
    pub ready_timeout: Duration,

    pub created_at: Instant,
}

impl SessionState {
    pub fn new(
        session_id: SessionId,
        service: ServiceId,
        session_type: SessionType,
        wait_timeout: Duration,
        ready_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            service,
            session_type,
            type_ext: TypeExt::default(),
            backend: None,
            phase: Phase::New,
            entered_phase_at: now,
            offer: None,
            answer: None,
            sdp_type: SdpType::Webrtc,
            candidate_buf: Vec::new(),
            master_peer: None,
            slave_peer: None,
            park_after_bridge: false,
            stop_sent: false,
            wait_timeout,
            ready_timeout,
            created_at: now,
        }
    }

    pub fn transition_to(&mut self, phase: Phase) {
        self.phase = phase;
        self.entered_phase_at = Instant::now();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Stopping | Phase::Stopped)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            service: self.service.clone(),
            session_type: self.session_type,
            type_ext: self.type_ext.clone(),
            backend: self.backend.clone(),
            phase: self.phase.to_string(),
            has_offer: self.offer.is_some(),
            has_answer: self.answer.is_some(),
            master_peer: self.master_peer.clone(),
            slave_peer: self.slave_peer.clone(),
        }
    }
}
