//! Call state.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mediahub_session_core::{CallId, Link, Sdp, ServiceId, SessionId};

/// Lifecycle phase of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Resolving,
    Inviting,
    Answered,
    Stopping,
    Stopped,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallPhase::Resolving => "resolving",
            CallPhase::Inviting => "inviting",
            CallPhase::Answered => "answered",
            CallPhase::Stopping => "stopping",
            CallPhase::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Complete state of one call, owned by its actor.
#[derive(Debug)]
pub struct CallState {
    pub call_id: CallId,
    pub service: ServiceId,
    pub callee: String,
    /// Offer shared with every out-leg.
    pub offer: Option<Sdp>,
    pub meta: Value,
    /// Caller session this call was launched for, if any.
    pub caller_session: Option<SessionId>,

    pub phase: CallPhase,
    /// Winning destination's link, set on answer.
    pub callee_link: Option<Link>,
    pub stop_sent: bool,
    pub created_at: Instant,
}

impl CallState {
    pub fn new(
        call_id: CallId,
        service: ServiceId,
        callee: String,
        offer: Option<Sdp>,
        meta: Value,
        caller_session: Option<SessionId>,
    ) -> Self {
        Self {
            call_id,
            service,
            callee,
            offer,
            meta,
            caller_session,
            phase: CallPhase::Resolving,
            callee_link: None,
            stop_sent: false,
            created_at: Instant::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, CallPhase::Stopping | CallPhase::Stopped)
    }

    pub fn info(&self, invites: usize, launched: usize) -> CallInfo {
        CallInfo {
            call_id: self.call_id.clone(),
            service: self.service.clone(),
            callee: self.callee.clone(),
            caller_session: self.caller_session.clone(),
            phase: self.phase.to_string(),
            invites,
            launched,
            answered: self.phase == CallPhase::Answered,
        }
    }
}

/// Snapshot of a call for `call.info`-style queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub service: ServiceId,
    pub callee: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_session: Option<SessionId>,
    pub phase: String,
    pub invites: usize,
    pub launched: usize,
    pub answered: bool,
}
