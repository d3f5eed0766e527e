//! Core types for mediahub-session-core
//!
//! Identifiers, SDP payloads, session types, identity links, and the
//! lifecycle events exchanged between sessions, calls, and adapters.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use mediahub_infra_common::Lifetime;

/// Logical tenant identifier; every operation is scoped to one service.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServiceId(pub String);

impl ServiceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session ID type
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call ID type
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        Self(format!("call-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room ID type
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new() -> Self {
        Self(format!("room-{}", Uuid::new_v4()))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Adapter connection ID (Verto or External-API client connection).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnId(pub String);

impl ConnId {
    pub fn new() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a SIP transaction awaiting a final response.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestHandle(pub String);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a SIP dialog, used to correlate in-dialog requests.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct DialogHandle(pub String);

impl fmt::Display for DialogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media backend identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BackendId(pub String);

impl BackendId {
    pub fn fs() -> Self {
        Self("fs".to_string())
    }

    pub fn kms() -> Self {
        Self("kms".to_string())
    }

    pub fn p2p() -> Self {
        Self("p2p".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SDP flavor of a media leg.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Webrtc,
    Rtp,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Webrtc => write!(f, "webrtc"),
            SdpType::Rtp => write!(f, "rtp"),
        }
    }
}

/// One SDP payload (offer or answer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sdp {
    pub sdp: String,
    pub sdp_type: SdpType,
    #[serde(default)]
    pub trickle_ice: bool,
}

impl Sdp {
    pub fn webrtc(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Webrtc,
            trickle_ice: false,
        }
    }

    pub fn rtp(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Rtp,
            trickle_ice: false,
        }
    }

    pub fn with_trickle(mut self) -> Self {
        self.trickle_ice = true;
        self
    }
}

/// A single trickle-ICE candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub m_id: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub m_index: Option<u32>,
    pub candidate: String,
}

/// A trickle-ICE item: either one candidate or the end-of-candidates
/// sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Candidate {
    Item(IceCandidate),
    End,
}

impl Candidate {
    pub fn is_end(&self) -> bool {
        matches!(self, Candidate::End)
    }
}

/// What a session does with its media leg.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    P2p,
    Proxy,
    Park,
    Echo,
    Mcu,
    Bridge,
    Publish,
    Listen,
    Call,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionType::P2p => "p2p",
            SessionType::Proxy => "proxy",
            SessionType::Park => "park",
            SessionType::Echo => "echo",
            SessionType::Mcu => "mcu",
            SessionType::Bridge => "bridge",
            SessionType::Publish => "publish",
            SessionType::Listen => "listen",
            SessionType::Call => "call",
        };
        write!(f, "{s}")
    }
}

/// Type-specific session attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeExt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcu_layout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
}

/// Session update operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "update_type", rename_all = "snake_case")]
pub enum UpdateKind {
    SessionType {
        session_type: SessionType,
        #[serde(default)]
        ext: TypeExt,
    },
    Media {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mute_audio: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mute_video: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bitrate: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dtmf: Option<String>,
    },
    McuLayout {
        layout: String,
    },
    ListenSwitch {
        publisher_id: SessionId,
    },
}

/// Why a session stopped or a call hung up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserStop,
    SipBye,
    SipCancel,
    VertoBye,
    ApiStop,
    SessionStop,
    CalleeStop,
    MasterPeerStop,
    RegisteredStop,
    PeerStop,
    NoDestination,
    NoAnswer,
    OriginatorCancel,
    SessionTimeout,
    CallError { detail: String },
    Backend { detail: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::UserStop => write!(f, "user_stop"),
            StopReason::SipBye => write!(f, "sip_bye"),
            StopReason::SipCancel => write!(f, "sip_cancel"),
            StopReason::VertoBye => write!(f, "verto_bye"),
            StopReason::ApiStop => write!(f, "api_stop"),
            StopReason::SessionStop => write!(f, "session_stop"),
            StopReason::CalleeStop => write!(f, "callee_stop"),
            StopReason::MasterPeerStop => write!(f, "master_peer_stop"),
            StopReason::RegisteredStop => write!(f, "registered_stop"),
            StopReason::PeerStop => write!(f, "peer_stop"),
            StopReason::NoDestination => write!(f, "no_destination"),
            StopReason::NoAnswer => write!(f, "no_answer"),
            StopReason::OriginatorCancel => write!(f, "originator_cancel"),
            StopReason::SessionTimeout => write!(f, "session_timeout"),
            StopReason::CallError { detail } => write!(f, "call_error: {detail}"),
            StopReason::Backend { detail } => write!(f, "backend: {detail}"),
        }
    }
}

/// Hashable identity of an observer link. Keys carry ids only; the
/// resolvable handles (lifetime, sink) live on the [`Link`] itself.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum LinkKey {
    Session(SessionId),
    Call(CallId),
    SipIn(RequestHandle),
    SipOut(String),
    Verto { conn: ConnId, call_id: String },
    Api(ConnId),
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKey::Session(id) => write!(f, "session:{id}"),
            LinkKey::Call(id) => write!(f, "call:{id}"),
            LinkKey::SipIn(req) => write!(f, "sip_in:{req}"),
            LinkKey::SipOut(dest) => write!(f, "sip_out:{dest}"),
            LinkKey::Verto { conn, call_id } => write!(f, "verto:{conn}:{call_id}"),
            LinkKey::Api(conn) => write!(f, "api:{conn}"),
        }
    }
}

/// Identity token of a party that can observe sessions and calls.
///
/// Each variant bundles the wire-level identity, a [`Lifetime`] the subject
/// watches for death, and the [`EventSink`] events are delivered into.
#[derive(Debug, Clone)]
pub enum Link {
    Session {
        id: SessionId,
        lifetime: Lifetime,
        sink: EventSink,
    },
    Call {
        id: CallId,
        lifetime: Lifetime,
        sink: EventSink,
    },
    SipIn {
        request: RequestHandle,
        dialog: DialogHandle,
        lifetime: Lifetime,
        sink: EventSink,
    },
    SipOut {
        dest: String,
        lifetime: Lifetime,
        sink: EventSink,
    },
    Verto {
        conn: ConnId,
        call_id: String,
        lifetime: Lifetime,
        sink: EventSink,
    },
    Api {
        conn: ConnId,
        lifetime: Lifetime,
        sink: EventSink,
    },
}

impl Link {
    pub fn key(&self) -> LinkKey {
        match self {
            Link::Session { id, .. } => LinkKey::Session(id.clone()),
            Link::Call { id, .. } => LinkKey::Call(id.clone()),
            Link::SipIn { request, .. } => LinkKey::SipIn(request.clone()),
            Link::SipOut { dest, .. } => LinkKey::SipOut(dest.clone()),
            Link::Verto { conn, call_id, .. } => LinkKey::Verto {
                conn: conn.clone(),
                call_id: call_id.clone(),
            },
            Link::Api { conn, .. } => LinkKey::Api(conn.clone()),
        }
    }

    pub fn lifetime(&self) -> &Lifetime {
        match self {
            Link::Session { lifetime, .. }
            | Link::Call { lifetime, .. }
            | Link::SipIn { lifetime, .. }
            | Link::SipOut { lifetime, .. }
            | Link::Verto { lifetime, .. }
            | Link::Api { lifetime, .. } => lifetime,
        }
    }

    pub fn sink(&self) -> &EventSink {
        match self {
            Link::Session { sink, .. }
            | Link::Call { sink, .. }
            | Link::SipIn { sink, .. }
            | Link::SipOut { sink, .. }
            | Link::Verto { sink, .. }
            | Link::Api { sink, .. } => sink,
        }
    }
}

/// Role an observer registration plays for its subject. Decides the stop
/// reason reported when the observer dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverRole {
    Default,
    Callee,
    MasterPeer,
}

/// One observer registration on a session or call.
#[derive(Debug, Clone)]
pub struct Registration {
    pub link: Link,
    pub role: ObserverRole,
    pub payload: Option<Value>,
}

impl Registration {
    pub fn new(link: Link) -> Self {
        Self {
            link,
            role: ObserverRole::Default,
            payload: None,
        }
    }

    pub fn with_role(mut self, role: ObserverRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Stop reason a subject uses when this observer dies: the role wins,
    /// otherwise the link kind.
    pub fn stop_reason(&self) -> StopReason {
        match self.role {
            ObserverRole::Callee => StopReason::CalleeStop,
            ObserverRole::MasterPeer => StopReason::MasterPeerStop,
            ObserverRole::Default => match self.link {
                Link::Session { .. } => StopReason::SessionStop,
                _ => StopReason::RegisteredStop,
            },
        }
    }
}

/// The entity an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Session(SessionId),
    Call(CallId),
    Room(RoomId),
}

impl Subject {
    pub fn id_str(&self) -> &str {
        match self {
            Subject::Session(id) => id.as_str(),
            Subject::Call(id) => id.as_str(),
            Subject::Room(id) => id.as_str(),
        }
    }
}

/// Lifecycle event tags emitted by sessions and calls.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEventKind {
    Ringing {
        answer: Option<Sdp>,
    },
    Answer {
        answer: Option<Sdp>,
        winner: Option<LinkKey>,
    },
    Hangup {
        reason: StopReason,
    },
    Stop {
        reason: StopReason,
    },
    UpdatedType {
        session_type: SessionType,
        ext: TypeExt,
    },
    Candidate {
        candidate: Candidate,
    },
}

impl CoreEventKind {
    pub fn tag(&self) -> &'static str {
        match self {
            CoreEventKind::Ringing { .. } => "ringing",
            CoreEventKind::Answer { .. } => "answer",
            CoreEventKind::Hangup { .. } => "hangup",
            CoreEventKind::Stop { .. } => "stop",
            CoreEventKind::UpdatedType { .. } => "updated_type",
            CoreEventKind::Candidate { .. } => "candidate",
        }
    }

    /// JSON body carried on the broadcast bus for this event.
    pub fn body(&self) -> Value {
        match self {
            CoreEventKind::Ringing { answer } => match answer {
                Some(sdp) => serde_json::json!({ "answer": sdp }),
                None => Value::Null,
            },
            CoreEventKind::Answer { answer, .. } => match answer {
                Some(sdp) => serde_json::json!({ "answer": sdp }),
                None => Value::Null,
            },
            CoreEventKind::Hangup { reason } => {
                serde_json::json!({ "reason": reason })
            }
            CoreEventKind::Stop { reason } => {
                serde_json::json!({ "reason": reason })
            }
            CoreEventKind::UpdatedType { session_type, ext } => {
                serde_json::json!({ "session_type": session_type, "ext": ext })
            }
            CoreEventKind::Candidate { candidate } => {
                serde_json::json!({ "candidate": candidate })
            }
        }
    }
}

/// One delivered lifecycle event: subject, tag, and the payload the
/// receiving observer attached at registration time.
#[derive(Debug, Clone)]
pub struct CoreEvent {
    pub subject: Subject,
    pub kind: CoreEventKind,
    pub payload: Option<Value>,
}

/// Non-blocking mailbox into an observing party.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<CoreEvent>,
}

impl EventSink {
    /// Create a sink plus the receiving end of its mailbox.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self { tx }
    }

    /// Fire-and-forget delivery. A closed mailbox is not an error; the
    /// observer's lifetime watcher handles cleanup.
    pub fn send(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Destination token produced by the resolver chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DestToken {
    Verto { user: String },
    Sip { uri: String },
    Api { user: String },
}

impl fmt::Display for DestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestToken::Verto { user } => write!(f, "verto:{user}"),
            DestToken::Sip { uri } => write!(f, "sip:{uri}"),
            DestToken::Api { user } => write!(f, "api:{user}"),
        }
    }
}

/// One destination descriptor returned by a resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub dest: DestToken,
    /// Delay before this destination's invite is launched.
    #[serde(default)]
    pub wait_secs: u64,
    /// Ring timeout; capped by the engine's maximum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_type: Option<SdpType>,
}

impl Destination {
    pub fn new(dest: DestToken) -> Self {
        Self {
            dest,
            wait_secs: 0,
            ring_secs: None,
            sdp_type: None,
        }
    }
}

/// Snapshot of a session for `get_info` / `session.info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub service: ServiceId,
    pub session_type: SessionType,
    #[serde(default)]
    pub type_ext: TypeExt,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendId>,
    pub phase: String,
    pub has_offer: bool,
    pub has_answer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_peer: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_peer: Option<SessionId>,
}
