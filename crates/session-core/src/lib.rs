//! # Session Core
//!
//! The session layer of mediahub: one finite-state machine per media leg,
//! a pluggable backend adapter seam, the room registry, and the shared
//! configuration and error taxonomy.
//!
//! A session owns exactly one SDP offer/answer pair and one backend
//! operation (park, echo, MCU, bridge, publish, listen, proxy, p2p, call).
//! Observers register through the observer fabric and are notified of every
//! lifecycle transition; when an observer dies, the session stops with a
//! reason naming the observer kind.

pub mod backend;
pub mod config;
pub mod errors;
pub mod manager;
pub mod rooms;
pub mod sdp;
pub mod session;
pub mod types;

pub use backend::{
    BackendCtx, BackendFactory, BackendRegistry, BackendSession, EngineEvent, ExtOps, Outcome,
    SessionEventRouter,
};
pub use config::HubConfig;
pub use errors::{error_code, CoreError, FsError, KmsError, Result, SipError, VertoError};
pub use manager::{
    CallLauncher, CallSpawn, SessionConfig, SessionManager, StartedSession,
};
pub use rooms::{RoomInfo, RoomRegistry, RoomRole};
pub use session::{Phase, SessionHandle};
pub use types::{
    BackendId, CallId, Candidate, ConnId, CoreEvent, CoreEventKind, DestToken, Destination,
    DialogHandle, EventSink, IceCandidate, Link, LinkKey, ObserverRole, Registration,
    RequestHandle, RoomId, Sdp, SdpType, ServiceId, SessionId, SessionInfo, SessionType,
    StopReason, Subject, TypeExt, UpdateKind,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
