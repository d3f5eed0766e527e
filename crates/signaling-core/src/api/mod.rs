//! External API endpoint (`class = "media"`).
//!
//! One actor per client connection. Commands operate on sessions, calls,
//! and rooms; creating an object auto-subscribes the caller to its
//! lifecycle topic (opt-out with `subscribe: false`, optional
//! `events_body` attached to every delivered event). A disconnecting
//! client takes the objects it registered on down with it.

pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mediahub_call_engine::{CallConfig, CallEngine, CallPlugin, InviteReply};
use mediahub_infra_common::{EventFrame, Lifetime, LifetimeGuard, ObjClass, SubscriptionId, Topic};
use mediahub_session_core::{
    error_code, BackendId, CallId, Candidate, ConnId, CoreError, CoreEvent, CoreEventKind,
    Destination, DestToken, EventSink, IceCandidate, Link, Registration, RoomId, Sdp, SdpType,
    ServiceId, SessionConfig, SessionId, SessionManager, SessionType, StopReason, Subject,
    TypeExt, UpdateKind,
};

use protocol::{ApiEventData, ApiEventFrame, ApiFrame, ApiOut, ApiResponse};

struct ApiShared {
    service: ServiceId,
    manager: SessionManager,
    calls: CallEngine,
    conns: DashMap<ConnId, ApiConnHandle>,
    /// Users an API client serves as an out-leg handler for.
    handlers: DashMap<String, ConnId>,
    /// Outstanding hub-initiated invites, for cancel matching.
    pending_invites: DashMap<(CallId, ConnId), ()>,
}

/// The external API adapter.
#[derive(Clone)]
pub struct ApiAdapter {
    shared: Arc<ApiShared>,
}

impl ApiAdapter {
    pub fn new(service: ServiceId, manager: SessionManager, calls: CallEngine) -> Self {
        Self {
            shared: Arc::new(ApiShared {
                service,
                manager,
                calls,
                conns: DashMap::new(),
                handlers: DashMap::new(),
                pending_invites: DashMap::new(),
            }),
        }
    }

    /// Plugin dispatching call invites to bound API clients. Register it
    /// on the call engine.
    pub fn plugin(&self) -> Arc<ApiPlugin> {
        Arc::new(ApiPlugin {
            shared: self.shared.clone(),
        })
    }

    /// Bind a user to a client connection: invites for that user are
    /// pushed to the client, which answers through `call.*` commands.
    pub fn bind_user(&self, user: &str, conn: &ConnId) {
        self.shared.handlers.insert(user.to_string(), conn.clone());
    }

    /// Accept a new client connection.
    pub fn connect(&self) -> ApiConn {
        let conn_id = ConnId::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (bus_tx, mut bus_rx) = mpsc::unbounded_channel::<EventFrame>();
        let (core_tx, mut core_rx) = mpsc::unbounded_channel::<CoreEvent>();
        let guard = LifetimeGuard::new();

        let handle = ApiConnHandle {
            conn_id: conn_id.clone(),
            tx: cmd_tx.clone(),
            core_tx,
            lifetime: guard.watcher(),
        };
        self.shared.conns.insert(conn_id.clone(), handle);

        let event_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = bus_rx.recv().await {
                if event_tx.send(ApiConnCmd::BusEvent(frame)).is_err() {
                    break;
                }
            }
        });
        let leg_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = core_rx.recv().await {
                if leg_tx.send(ApiConnCmd::CoreEvent(event)).is_err() {
                    break;
                }
            }
        });

        let actor = ApiConnActor {
            conn_id: conn_id.clone(),
            shared: self.shared.clone(),
            cmd_rx,
            out_tx,
            bus_tx,
            _guard: guard,
            subscriptions: Vec::new(),
            next_tid: 1,
        };
        info!(conn_id = %conn_id, "api connection");
        tokio::spawn(actor.run());

        ApiConn {
            conn_id,
            tx: cmd_tx,
            outbound: out_rx,
        }
    }
}

/// Transport-side face of one API connection.
pub struct ApiConn {
    pub conn_id: ConnId,
    tx: mpsc::UnboundedSender<ApiConnCmd>,
    /// Messages for the wire.
    pub outbound: mpsc::UnboundedReceiver<ApiOut>,
}

impl ApiConn {
    pub fn handle_frame(&self, frame: ApiFrame) {
        let _ = self.tx.send(ApiConnCmd::Frame(frame));
    }

    /// Transport closed; every object this client registered on stops.
    pub fn close(&self) {
        let _ = self.tx.send(ApiConnCmd::Close);
    }
}

#[derive(Clone)]
struct ApiConnHandle {
    conn_id: ConnId,
    tx: mpsc::UnboundedSender<ApiConnCmd>,
    core_tx: mpsc::UnboundedSender<CoreEvent>,
    lifetime: Lifetime,
}

impl ApiConnHandle {
    /// Link for command-initiated registrations. The sink is a dead
    /// letter: those clients receive lifecycle through their topic
    /// subscriptions, the registration only couples lifetimes.
    fn link(&self) -> Link {
        let (sink, _rx) = EventSink::channel();
        Link::Api {
            conn: self.conn_id.clone(),
            lifetime: self.lifetime.clone(),
            sink,
        }
    }

    /// Link for hub-initiated out-legs: call lifecycle is pushed to the
    /// client so it can tear its wire leg down.
    fn leg_link(&self) -> Link {
        Link::Api {
            conn: self.conn_id.clone(),
            lifetime: self.lifetime.clone(),
            sink: EventSink::from_sender(self.core_tx.clone()),
        }
    }
}

enum ApiConnCmd {
    Frame(ApiFrame),
    BusEvent(EventFrame),
    /// Direct lifecycle of an out-leg this client serves.
    CoreEvent(CoreEvent),
    Invite {
        call: CallId,
        user: String,
        offer: Option<Sdp>,
    },
    CancelInvite {
        call: CallId,
    },
    Close,
}

struct ApiConnActor {
    conn_id: ConnId,
    shared: Arc<ApiShared>,
    cmd_rx: mpsc::UnboundedReceiver<ApiConnCmd>,
    out_tx: mpsc::UnboundedSender<ApiOut>,
    bus_tx: mpsc::UnboundedSender<EventFrame>,
    _guard: LifetimeGuard,
    subscriptions: Vec<(Topic, SubscriptionId)>,
    next_tid: u64,
}

// ---- command payloads ----------------------------------------------------

#[derive(Debug, Deserialize)]
struct SessionStartData {
    #[serde(rename = "type")]
    session_type: SessionType,
    backend: Option<BackendId>,
    offer: Option<Sdp>,
    sdp_type: Option<SdpType>,
    room_id: Option<RoomId>,
    room_type: Option<String>,
    peer_id: Option<SessionId>,
    publisher_id: Option<SessionId>,
    dest: Option<String>,
    #[serde(default = "default_true")]
    subscribe: bool,
    events_body: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SessionRefData {
    session_id: SessionId,
}

#[derive(Debug, Deserialize)]
struct SetAnswerData {
    session_id: SessionId,
    answer: Sdp,
}

#[derive(Debug, Deserialize)]
struct SetCandidateData {
    session_id: SessionId,
    #[serde(rename = "sdpMid")]
    m_id: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    m_index: Option<u32>,
    candidate: String,
}

#[derive(Debug, Deserialize)]
struct UpdateData {
    session_id: SessionId,
    #[serde(flatten)]
    update: UpdateKind,
}

#[derive(Debug, Deserialize)]
struct CallStartData {
    callee: String,
    offer: Option<Sdp>,
    session_id: Option<SessionId>,
    #[serde(default)]
    meta: Value,
    #[serde(default = "default_true")]
    subscribe: bool,
    events_body: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CallRefData {
    call_id: CallId,
}

#[derive(Debug, Deserialize)]
struct CallAnswerData {
    call_id: CallId,
    answer: Sdp,
}

#[derive(Debug, Deserialize)]
struct CallRingingData {
    call_id: CallId,
    answer: Option<Sdp>,
}

#[derive(Debug, Deserialize)]
struct CallHangupData {
    call_id: CallId,
    reason: Option<StopReason>,
}

#[derive(Debug, Deserialize)]
struct RoomCreateData {
    room_id: Option<RoomId>,
    room_type: Option<String>,
    backend: Option<BackendId>,
    #[serde(default = "default_true")]
    subscribe: bool,
    events_body: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RoomRefData {
    room_id: RoomId,
}

fn default_true() -> bool {
    true
}

impl ApiConnActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                ApiConnCmd::Frame(frame) => self.handle_frame(frame).await,
                ApiConnCmd::BusEvent(frame) => self.forward_event(frame),
                ApiConnCmd::CoreEvent(event) => self.on_leg_event(event),
                ApiConnCmd::Invite { call, user, offer } => {
                    let tid = self.next_tid();
                    self.send(ApiOut::Request(ApiFrame {
                        class: "media".to_string(),
                        subclass: "call".to_string(),
                        cmd: "invite".to_string(),
                        data: json!({
                            "call_id": call.as_str(),
                            "dest": user,
                            "offer": offer,
                        }),
                        tid,
                    }));
                }
                ApiConnCmd::CancelInvite { call } => {
                    let tid = self.next_tid();
                    self.send(ApiOut::Request(ApiFrame {
                        class: "media".to_string(),
                        subclass: "call".to_string(),
                        cmd: "cancel".to_string(),
                        data: json!({ "call_id": call.as_str() }),
                        tid,
                    }));
                }
                ApiConnCmd::Close => break,
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        let bus = self.shared.manager.bus();
        for (topic, id) in self.subscriptions.drain(..) {
            bus.unsubscribe(&topic, id);
        }
        self.shared.conns.remove(&self.conn_id);
        self.shared
            .handlers
            .retain(|_, conn| conn != &self.conn_id);
        debug!(conn_id = %self.conn_id, "api connection closed");
    }

    fn next_tid(&mut self) -> u64 {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    fn send(&self, out: ApiOut) {
        let _ = self.out_tx.send(out);
    }

    fn respond(&self, tid: u64, result: mediahub_session_core::Result<Option<Value>>) {
        match result {
            Ok(data) => self.send(ApiOut::Response(ApiResponse::ok(tid, data))),
            Err(e) => {
                let (code, text) = error_code(&e);
                self.send(ApiOut::Response(ApiResponse::error(tid, code, text)));
            }
        }
    }

    /// Lifecycle of a call whose out-leg this client serves. Hangups tear
    /// the client's wire leg down.
    fn on_leg_event(&mut self, event: CoreEvent) {
        let Subject::Call(call_id) = event.subject else {
            return;
        };
        if let CoreEventKind::Hangup { reason } = event.kind {
            let tid = self.next_tid();
            self.send(ApiOut::Request(ApiFrame {
                class: "media".to_string(),
                subclass: "call".to_string(),
                cmd: "hangup".to_string(),
                data: json!({ "call_id": call_id.as_str(), "reason": reason }),
                tid,
            }));
        }
    }

    fn forward_event(&self, frame: EventFrame) {
        self.send(ApiOut::Event(ApiEventFrame {
            class: "event".to_string(),
            data: ApiEventData {
                srv_id: frame.service,
                class: frame.class,
                subclass: frame.subclass.to_string(),
                event_type: frame.event_type,
                obj_id: frame.obj_id,
                body: frame.body,
            },
        }));
    }

    fn link(&self) -> Link {
        self.shared
            .conns
            .get(&self.conn_id)
            .map(|h| h.link())
            .expect("own connection is registered")
    }

    fn subscribe(&mut self, subclass: ObjClass, obj_id: &str, body: Option<Value>) {
        let topic = Topic::new(self.shared.service.as_str(), "media", subclass).instance(obj_id);
        let id = self
            .shared
            .manager
            .bus()
            .subscribe_with_sink(topic.clone(), self.bus_tx.clone(), body);
        self.subscriptions.push((topic, id));
    }

    async fn handle_frame(&mut self, frame: ApiFrame) {
        let ApiFrame {
            class,
            subclass,
            cmd,
            data,
            tid,
        } = frame;
        if class != "media" {
            self.respond(
                tid,
                Err(CoreError::UnknownCommand(format!("{class}.{subclass}.{cmd}"))),
            );
            return;
        }
        let result = match (subclass.as_str(), cmd.as_str()) {
            ("session", "start") => self.session_start(data).await,
            ("session", "stop") => self.session_stop(data).await,
            ("session", "set_answer") => self.session_set_answer(data).await,
            ("session", "set_candidate") => self.session_set_candidate(data).await,
            ("session", "set_candidate_end") => self.session_candidate_end(data).await,
            ("session", "update") => self.session_update(data).await,
            ("session", "info") => self.session_info(data).await,
            ("session", "list") => self.session_list().await,
            ("call", "start") => self.call_start(data).await,
            ("call", "ringing") => self.call_ringing(data).await,
            ("call", "answered") => self.call_answered(data).await,
            ("call", "rejected") => self.call_rejected(data).await,
            ("call", "hangup") => self.call_hangup(data).await,
            ("room", "create") => self.room_create(data),
            ("room", "destroy") => self.room_destroy(data),
            ("room", "list") => self.room_list(),
            ("room", "info") => self.room_info(data),
            (subclass, cmd) => Err(CoreError::UnknownCommand(format!("{subclass}.{cmd}"))),
        };
        self.respond(tid, result);
    }

    // ---- session commands ------------------------------------------------

    async fn session_start(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: SessionStartData = parse(data)?;
        let mut config = SessionConfig::new(self.shared.service.clone(), data.session_type)
            .with_register(Registration::new(self.link()));
        config.backend = data.backend;
        config.offer = data.offer;
        config.sdp_type = data.sdp_type;
        config.type_ext = TypeExt {
            room_id: data.room_id,
            room_type: data.room_type,
            peer_id: data.peer_id,
            publisher_id: data.publisher_id,
            dest: data.dest,
            ..TypeExt::default()
        };

        let started = self.shared.manager.start_session(config).await?;
        if data.subscribe {
            self.subscribe(ObjClass::Session, started.id.as_str(), data.events_body);
        }
        Ok(Some(json!({
            "session_id": started.id,
            "offer": started.offer,
            "answer": started.answer,
        })))
    }

    async fn session_stop(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: SessionRefData = parse(data)?;
        let handle = self
            .shared
            .manager
            .session(&data.session_id)
            .ok_or(CoreError::SessionNotFound(data.session_id))?;
        handle.stop(StopReason::ApiStop);
        Ok(None)
    }

    async fn session_set_answer(
        &mut self,
        data: Value,
    ) -> mediahub_session_core::Result<Option<Value>> {
        let data: SetAnswerData = parse(data)?;
        let handle = self
            .shared
            .manager
            .session(&data.session_id)
            .ok_or_else(|| CoreError::SessionNotFound(data.session_id.clone()))?;
        handle.set_answer(data.answer).await?;
        Ok(None)
    }

    async fn session_set_candidate(
        &mut self,
        data: Value,
    ) -> mediahub_session_core::Result<Option<Value>> {
        let data: SetCandidateData = parse(data)?;
        let handle = self
            .shared
            .manager
            .session(&data.session_id)
            .ok_or_else(|| CoreError::SessionNotFound(data.session_id.clone()))?;
        handle
            .candidate(Candidate::Item(IceCandidate {
                m_id: data.m_id,
                m_index: data.m_index,
                candidate: data.candidate,
            }))
            .await?;
        Ok(None)
    }

    async fn session_candidate_end(
        &mut self,
        data: Value,
    ) -> mediahub_session_core::Result<Option<Value>> {
        let data: SessionRefData = parse(data)?;
        let handle = self
            .shared
            .manager
            .session(&data.session_id)
            .ok_or(CoreError::SessionNotFound(data.session_id))?;
        handle.candidate_end().await?;
        Ok(None)
    }

    async fn session_update(
        &mut self,
        data: Value,
    ) -> mediahub_session_core::Result<Option<Value>> {
        let data: UpdateData = parse(data)?;
        let handle = self
            .shared
            .manager
            .session(&data.session_id)
            .ok_or_else(|| CoreError::SessionNotFound(data.session_id.clone()))?;
        let reply = handle.update(data.update).await?;
        Ok(Some(reply))
    }

    async fn session_info(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: SessionRefData = parse(data)?;
        let info = self.shared.manager.session_info(&data.session_id).await?;
        Ok(Some(serde_json::to_value(info).unwrap_or(Value::Null)))
    }

    async fn session_list(&mut self) -> mediahub_session_core::Result<Option<Value>> {
        let ids = self.shared.manager.list_sessions();
        Ok(Some(json!({ "sessions": ids })))
    }

    // ---- call commands ---------------------------------------------------

    async fn call_start(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: CallStartData = parse(data)?;
        let mut config = CallConfig::new(self.shared.service.clone(), data.callee)
            .with_register(Registration::new(self.link()));
        config.offer = data.offer;
        config.meta = data.meta;

        if let Some(session_id) = data.session_id {
            let session = self
                .shared
                .manager
                .session(&session_id)
                .ok_or_else(|| CoreError::SessionNotFound(session_id.clone()))?;
            config.caller_session = Some(session_id);
            // The linked session observes the call: its answer and hangup
            // propagate automatically.
            let started = self.shared.calls.start_call(config);
            let _ = started
                .handle
                .register(Registration::new(session.link()))
                .await;
            if data.subscribe {
                self.subscribe(ObjClass::Call, started.id.as_str(), data.events_body);
            }
            return Ok(Some(json!({ "call_id": started.id })));
        }

        let started = self.shared.calls.start_call(config);
        if data.subscribe {
            self.subscribe(ObjClass::Call, started.id.as_str(), data.events_body);
        }
        Ok(Some(json!({ "call_id": started.id })))
    }

    fn call_key(&self) -> mediahub_session_core::LinkKey {
        mediahub_session_core::LinkKey::Api(self.conn_id.clone())
    }

    async fn call_ringing(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: CallRingingData = parse(data)?;
        let call = self
            .shared
            .calls
            .call(&data.call_id)
            .ok_or_else(|| CoreError::CallNotFound(data.call_id.clone()))?;
        call.ringing(self.call_key(), data.answer).await?;
        Ok(None)
    }

    async fn call_answered(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: CallAnswerData = parse(data)?;
        let call = self
            .shared
            .calls
            .call(&data.call_id)
            .ok_or_else(|| CoreError::CallNotFound(data.call_id.clone()))?;
        call.answered(self.call_key(), data.answer).await?;
        self.shared
            .pending_invites
            .remove(&(data.call_id, self.conn_id.clone()));
        Ok(None)
    }

    async fn call_rejected(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: CallRefData = parse(data)?;
        let call = self
            .shared
            .calls
            .call(&data.call_id)
            .ok_or_else(|| CoreError::CallNotFound(data.call_id.clone()))?;
        call.rejected(self.call_key()).await?;
        self.shared
            .pending_invites
            .remove(&(data.call_id, self.conn_id.clone()));
        Ok(None)
    }

    async fn call_hangup(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: CallHangupData = parse(data)?;
        let call = self
            .shared
            .calls
            .call(&data.call_id)
            .ok_or_else(|| CoreError::CallNotFound(data.call_id.clone()))?;
        call.hangup(data.reason.unwrap_or(StopReason::UserStop));
        Ok(None)
    }

    // ---- room commands ---------------------------------------------------

    fn room_create(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: RoomCreateData = parse(data)?;
        let room_id = self.shared.manager.rooms().create(
            &self.shared.service,
            data.room_id,
            data.room_type,
            data.backend,
        )?;
        if data.subscribe {
            self.subscribe(ObjClass::Room, room_id.as_str(), data.events_body);
        }
        Ok(Some(json!({ "room_id": room_id })))
    }

    fn room_destroy(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: RoomRefData = parse(data)?;
        self.shared.manager.rooms().destroy(&data.room_id)?;
        Ok(None)
    }

    fn room_list(&mut self) -> mediahub_session_core::Result<Option<Value>> {
        let rooms = self.shared.manager.rooms().list(&self.shared.service);
        Ok(Some(json!({ "rooms": rooms })))
    }

    fn room_info(&mut self, data: Value) -> mediahub_session_core::Result<Option<Value>> {
        let data: RoomRefData = parse(data)?;
        let info = self.shared.manager.rooms().info(&data.room_id)?;
        Ok(Some(serde_json::to_value(info).unwrap_or(Value::Null)))
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: Value) -> mediahub_session_core::Result<T> {
    serde_json::from_value(data)
        .map_err(|e| CoreError::SessionError(format!("bad command data: {e}")))
}

/// Out-leg plugin for API-bound users.
pub struct ApiPlugin {
    shared: Arc<ApiShared>,
}

#[async_trait]
impl CallPlugin for ApiPlugin {
    async fn invite(
        &self,
        call_id: &CallId,
        dest: &Destination,
        offer: Option<&Sdp>,
        _meta: &Value,
    ) -> InviteReply {
        let DestToken::Api { user } = &dest.dest else {
            return InviteReply::Pass;
        };
        let Some(conn_id) = self.shared.handlers.get(user).map(|c| c.clone()) else {
            return InviteReply::Remove;
        };
        let Some(conn) = self.shared.conns.get(&conn_id).map(|h| h.clone()) else {
            return InviteReply::Remove;
        };

        debug!(call_id = %call_id, user, conn_id = %conn_id, "api out-leg invited");
        self.shared
            .pending_invites
            .insert((call_id.clone(), conn_id.clone()), ());
        let _ = conn.tx.send(ApiConnCmd::Invite {
            call: call_id.clone(),
            user: user.clone(),
            offer: offer.cloned(),
        });
        InviteReply::Ok {
            link: conn.leg_link(),
        }
    }

    async fn cancel(&self, call_id: &CallId, link: &Link) {
        let Link::Api { conn, .. } = link else {
            return;
        };
        if self
            .shared
            .pending_invites
            .remove(&(call_id.clone(), conn.clone()))
            .is_none()
        {
            return;
        }
        if let Some(handle) = self.shared.conns.get(conn).map(|h| h.clone()) {
            let _ = handle.tx.send(ApiConnCmd::CancelInvite {
                call: call_id.clone(),
            });
        } else {
            warn!(call_id = %call_id, conn_id = %conn, "cancel for a vanished api client");
        }
    }
}
