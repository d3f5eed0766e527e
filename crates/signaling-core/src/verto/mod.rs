//! Verto endpoint.
//!
//! JSON-RPC 2.0 signaling for WebRTC clients. One actor per connection;
//! the WebSocket transport itself is an external collaborator that feeds
//! frames in and drains the outbound mailbox. A connection that stays idle
//! for an hour is closed, taking its sessions down with it.

pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mediahub_call_engine::{CallEngine, CallPlugin, InviteReply, Resolver};
use mediahub_infra_common::{Lifetime, LifetimeGuard};
use mediahub_session_core::{
    error_code, BackendId, CallId, ConnId, CoreError, CoreEvent, CoreEventKind, Destination,
    DestToken, EventSink, Link, LinkKey, Registration, Sdp, ServiceId,
    SessionConfig, SessionHandle, SessionId, SessionManager, SessionType, StopReason, TypeExt,
    UpdateKind, VertoError,
};

use crate::dest::{parse_dest, DestSpec};

use protocol::{ByeParams, InfoParams, LoginParams, SdpParams, VertoFrame};

/// Idle timeout of a Verto connection.
pub const VERTO_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Login hook: `None` rejects, `Some` returns the (possibly normalized)
/// user name.
#[async_trait]
pub trait VertoLoginHook: Send + Sync {
    async fn login(&self, user: &str, passwd: &str) -> Option<String>;
}

/// Accept every login as-is.
pub struct AllowAllLogin;

#[async_trait]
impl VertoLoginHook for AllowAllLogin {
    async fn login(&self, user: &str, _passwd: &str) -> Option<String> {
        Some(user.to_string())
    }
}

struct VertoShared {
    service: ServiceId,
    manager: SessionManager,
    calls: CallEngine,
    login: Arc<dyn VertoLoginHook>,
    conns: DashMap<ConnId, VertoConnHandle>,
    users: DashMap<String, ConnId>,
    /// Out-leg sessions the plugin created, for targeted cancel.
    owned_sessions: DashMap<SessionId, ConnId>,
}

/// The Verto endpoint adapter.
#[derive(Clone)]
pub struct VertoAdapter {
    shared: Arc<VertoShared>,
}

impl VertoAdapter {
    pub fn new(
        service: ServiceId,
        manager: SessionManager,
        calls: CallEngine,
        login: Arc<dyn VertoLoginHook>,
    ) -> Self {
        Self {
            shared: Arc::new(VertoShared {
                service,
                manager,
                calls,
                login,
                conns: DashMap::new(),
                users: DashMap::new(),
                owned_sessions: DashMap::new(),
            }),
        }
    }

    /// Plugin launching out-legs toward connected Verto users. Register it
    /// on the call engine.
    pub fn plugin(&self) -> Arc<VertoPlugin> {
        Arc::new(VertoPlugin {
            shared: self.shared.clone(),
        })
    }

    /// Resolver mapping logged-in users to Verto destinations. Register it
    /// on the call engine.
    pub fn resolver(&self) -> Arc<VertoResolver> {
        Arc::new(VertoResolver {
            shared: self.shared.clone(),
        })
    }

    /// Accept a new client connection. The transport feeds frames through
    /// the returned [`VertoConn`] and drains `outbound`.
    pub fn connect(&self) -> VertoConn {
        let conn_id = ConnId::new();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (core_tx, mut core_rx) = mpsc::unbounded_channel::<CoreEvent>();
        let guard = LifetimeGuard::new();

        let handle = VertoConnHandle {
            conn_id: conn_id.clone(),
            tx: cmd_tx.clone(),
            core_tx,
            lifetime: guard.watcher(),
        };
        self.shared.conns.insert(conn_id.clone(), handle.clone());

        // Session events funnel into the connection mailbox.
        let event_tx = cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = core_rx.recv().await {
                if event_tx.send(ConnCmd::SessionEvent(event)).is_err() {
                    break;
                }
            }
        });

        let idle_tx = cmd_tx.clone();
        let idle_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(IDLE_CHECK_PERIOD);
            loop {
                tick.tick().await;
                if idle_tx.send(ConnCmd::IdleTick).is_err() {
                    break;
                }
            }
        });

        let actor = ConnActor {
            conn_id: conn_id.clone(),
            shared: self.shared.clone(),
            cmd_rx,
            out_tx,
            _guard: guard,
            user: None,
            bindings: HashMap::new(),
            last_activity: Instant::now(),
            next_request_id: 1,
            idle_task,
        };
        info!(conn_id = %conn_id, "verto connection");
        tokio::spawn(actor.run());

        VertoConn {
            conn_id,
            tx: cmd_tx,
            outbound: out_rx,
        }
    }
}

/// Transport-side face of one connection.
pub struct VertoConn {
    pub conn_id: ConnId,
    tx: mpsc::UnboundedSender<ConnCmd>,
    /// Frames for the wire.
    pub outbound: mpsc::UnboundedReceiver<VertoFrame>,
}

impl VertoConn {
    pub fn handle_frame(&self, frame: VertoFrame) {
        let _ = self.tx.send(ConnCmd::Frame(frame));
    }

    /// Transport closed; tears down every session of this connection.
    pub fn close(&self) {
        let _ = self.tx.send(ConnCmd::Close);
    }
}

#[derive(Clone)]
struct VertoConnHandle {
    conn_id: ConnId,
    tx: mpsc::UnboundedSender<ConnCmd>,
    core_tx: mpsc::UnboundedSender<CoreEvent>,
    lifetime: Lifetime,
}

impl VertoConnHandle {
    fn link(&self, client_call_id: &str) -> Link {
        Link::Verto {
            conn: self.conn_id.clone(),
            call_id: client_call_id.to_string(),
            lifetime: self.lifetime.clone(),
            sink: EventSink::from_sender(self.core_tx.clone()),
        }
    }
}

enum ConnCmd {
    Frame(VertoFrame),
    /// Plugin asks this connection to invite its client.
    OutInvite {
        client_call_id: String,
        session: SessionHandle,
        call: CallId,
        key: LinkKey,
        offer_sdp: String,
    },
    SessionEvent(CoreEvent),
    IdleTick,
    Close,
}

struct CallBinding {
    session: SessionHandle,
    /// Set on legs we invited on behalf of a call.
    outgoing: Option<(CallId, LinkKey)>,
    answered: bool,
}

struct ConnActor {
    conn_id: ConnId,
    shared: Arc<VertoShared>,
    cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    out_tx: mpsc::UnboundedSender<VertoFrame>,
    _guard: LifetimeGuard,
    user: Option<String>,
    bindings: HashMap<String, CallBinding>,
    last_activity: Instant,
    next_request_id: u64,
    idle_task: tokio::task::JoinHandle<()>,
}

impl ConnActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                ConnCmd::Frame(frame) => {
                    self.last_activity = Instant::now();
                    self.handle_frame(frame).await;
                }
                ConnCmd::OutInvite {
                    client_call_id,
                    session,
                    call,
                    key,
                    offer_sdp,
                } => {
                    self.bindings.insert(
                        client_call_id.clone(),
                        CallBinding {
                            session,
                            outgoing: Some((call, key)),
                            answered: false,
                        },
                    );
                    let id = self.next_request_id;
                    self.next_request_id += 1;
                    self.send(VertoFrame::request(
                        id,
                        "verto.invite",
                        json!({
                            "dialogParams": { "callID": client_call_id },
                            "sdp": offer_sdp,
                        }),
                    ));
                }
                ConnCmd::SessionEvent(event) => self.on_session_event(event),
                ConnCmd::IdleTick => {
                    if self.last_activity.elapsed() >= VERTO_IDLE_TIMEOUT {
                        info!(conn_id = %self.conn_id, "verto connection idle, closing");
                        break;
                    }
                }
                ConnCmd::Close => break,
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(user) = self.user.take() {
            self.shared.users.remove(&user);
        }
        self.shared.conns.remove(&self.conn_id);
        self.idle_task.abort();
        debug!(conn_id = %self.conn_id, "verto connection closed");
        // Dropping the guard ends the connection lifetime; every session
        // holding this connection as an observer stops on its own.
    }

    fn send(&self, frame: VertoFrame) {
        let _ = self.out_tx.send(frame);
    }

    fn send_error(&self, id: Option<u64>, err: &CoreError) {
        let (code, text) = error_code(err);
        self.send(VertoFrame::error(id, code, text));
    }

    fn handle_link(&self, client_call_id: &str) -> Link {
        self.shared
            .conns
            .get(&self.conn_id)
            .map(|h| h.link(client_call_id))
            .expect("own connection is registered")
    }

    async fn handle_frame(&mut self, mut frame: VertoFrame) {
        let id = frame.id;
        let method = frame.method.take();
        let params = frame.params.take();
        match method.as_deref() {
            Some("login") => self.on_login(id, params).await,
            Some("verto.invite") => self.on_invite(id, params).await,
            Some("verto.answer") => self.on_answer(id, params).await,
            Some("verto.bye") => self.on_bye(id, params).await,
            Some("verto.info") => self.on_info(id, params).await,
            Some(other) => {
                self.send_error(id, &CoreError::UnknownCommand(other.to_string()));
            }
            // Responses to our own requests need no bookkeeping.
            None => {}
        }
    }

    async fn on_login(&mut self, id: Option<u64>, params: Option<Value>) {
        let Some(params) = params
            .and_then(|p| serde_json::from_value::<LoginParams>(p).ok())
        else {
            self.send_error(id, &CoreError::Verto(VertoError::LoginRejected));
            return;
        };
        match self.shared.login.login(&params.login, &params.passwd).await {
            Some(user) => {
                info!(conn_id = %self.conn_id, user, "verto login");
                self.shared.users.insert(user.clone(), self.conn_id.clone());
                self.user = Some(user);
                if let Some(id) = id {
                    self.send(VertoFrame::response(
                        id,
                        json!({ "sessid": self.conn_id.as_str() }),
                    ));
                }
            }
            None => {
                self.send_error(id, &CoreError::Verto(VertoError::LoginRejected));
            }
        }
    }

    async fn on_invite(&mut self, id: Option<u64>, params: Option<Value>) {
        if self.user.is_none() {
            self.send_error(id, &CoreError::Verto(VertoError::LoginRejected));
            return;
        }
        let Some(params) = params.and_then(|p| serde_json::from_value::<SdpParams>(p).ok())
        else {
            self.send_error(id, &CoreError::SessionError("bad invite params".into()));
            return;
        };
        let Some(dest) = params.dialog_params.destination_number.clone() else {
            self.send_error(id, &CoreError::SessionError("no destination".into()));
            return;
        };
        let client_call_id = params.dialog_params.call_id.clone();
        let offer = Sdp::webrtc(params.sdp);

        let registration = Registration::new(self.handle_link(&client_call_id))
            .with_payload(json!({ "callID": client_call_id }));
        let service = self.shared.service.clone();
        let config = match parse_dest(&dest) {
            DestSpec::Echo { backend } => SessionConfig::new(service, SessionType::Echo)
                .with_backend(backend)
                .with_offer(offer)
                .with_register(registration),
            DestSpec::Park => SessionConfig::new(service, SessionType::Park)
                .with_backend(BackendId::fs())
                .with_offer(offer)
                .with_register(registration),
            DestSpec::Mcu { room } => SessionConfig::new(service, SessionType::Mcu)
                .with_backend(BackendId::fs())
                .with_offer(offer)
                .with_ext(TypeExt {
                    room_id: Some(room),
                    ..TypeExt::default()
                })
                .with_register(registration),
            DestSpec::BridgeTo { session } => SessionConfig::new(service, SessionType::Call)
                .with_backend(BackendId::fs())
                .with_offer(offer)
                .with_ext(TypeExt {
                    peer_id: Some(session),
                    ..TypeExt::default()
                })
                .with_register(registration),
            DestSpec::Call { callee } => SessionConfig::new(service, SessionType::Call)
                .with_offer(offer)
                .with_ext(TypeExt {
                    dest: Some(callee),
                    ..TypeExt::default()
                })
                .with_register(registration),
        };

        match self.shared.manager.start_session(config).await {
            Ok(started) => {
                debug!(
                    conn_id = %self.conn_id,
                    session_id = %started.id,
                    call_id = %client_call_id,
                    dest,
                    "verto invite"
                );
                self.bindings.insert(
                    client_call_id.clone(),
                    CallBinding {
                        session: started.handle,
                        outgoing: None,
                        answered: false,
                    },
                );
                if let Some(id) = id {
                    self.send(VertoFrame::response(
                        id,
                        json!({
                            "callID": client_call_id,
                            "session_id": started.id.as_str(),
                        }),
                    ));
                }
            }
            Err(e) => self.send_error(id, &e),
        }
    }

    async fn on_answer(&mut self, id: Option<u64>, params: Option<Value>) {
        let Some(params) = params.and_then(|p| serde_json::from_value::<SdpParams>(p).ok())
        else {
            self.send_error(id, &CoreError::SessionError("bad answer params".into()));
            return;
        };
        let client_call_id = params.dialog_params.call_id.clone();
        let Some(binding) = self.bindings.get_mut(&client_call_id) else {
            self.send_error(id, &CoreError::Verto(VertoError::UnknownCall(client_call_id)));
            return;
        };
        let answer = Sdp::webrtc(params.sdp);
        binding.answered = true;
        let session = binding.session.clone();
        let outgoing = binding.outgoing.clone();

        if let Err(e) = session.set_answer(answer.clone()).await {
            self.send_error(id, &e);
            return;
        }
        if let Some((call_id, key)) = outgoing {
            if let Some(call) = self.shared.calls.call(&call_id) {
                if let Err(e) = call.answered(key, answer).await {
                    debug!(call_id = %call_id, error = %e, "verto answer lost the race");
                }
            }
        }
        if let Some(id) = id {
            self.send(VertoFrame::response(id, json!({})));
        }
    }

    async fn on_bye(&mut self, id: Option<u64>, params: Option<Value>) {
        let Some(params) = params.and_then(|p| serde_json::from_value::<ByeParams>(p).ok())
        else {
            self.send_error(id, &CoreError::SessionError("bad bye params".into()));
            return;
        };
        let client_call_id = params.dialog_params.call_id;
        let Some(binding) = self.bindings.remove(&client_call_id) else {
            self.send_error(id, &CoreError::Verto(VertoError::UnknownCall(client_call_id)));
            return;
        };
        if let Some((call_id, key)) = &binding.outgoing {
            if !binding.answered {
                if let Some(call) = self.shared.calls.call(call_id) {
                    let _ = call.rejected(key.clone()).await;
                }
            }
        }
        binding.session.stop(StopReason::VertoBye);
        if let Some(id) = id {
            self.send(VertoFrame::response(id, json!({})));
        }
    }

    async fn on_info(&mut self, id: Option<u64>, params: Option<Value>) {
        let Some(params) = params.and_then(|p| serde_json::from_value::<InfoParams>(p).ok())
        else {
            self.send_error(id, &CoreError::SessionError("bad info params".into()));
            return;
        };
        let Some(binding) = self.bindings.get(&params.dialog_params.call_id) else {
            self.send_error(
                id,
                &CoreError::Verto(VertoError::UnknownCall(params.dialog_params.call_id)),
            );
            return;
        };
        let result = binding
            .session
            .update(UpdateKind::Media {
                mute_audio: None,
                mute_video: None,
                bitrate: None,
                dtmf: Some(params.dtmf),
            })
            .await;
        match result {
            Ok(_) => {
                if let Some(id) = id {
                    self.send(VertoFrame::response(id, json!({})));
                }
            }
            Err(e) => self.send_error(id, &e),
        }
    }

    fn on_session_event(&mut self, event: CoreEvent) {
        let Some(client_call_id) = event
            .payload
            .as_ref()
            .and_then(|p| p.get("callID"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return;
        };
        match event.kind {
            CoreEventKind::Answer { answer, .. } => {
                let Some(binding) = self.bindings.get_mut(&client_call_id) else {
                    return;
                };
                // Answers on legs we invited came from this client; no echo.
                if binding.outgoing.is_some() || binding.answered {
                    return;
                }
                binding.answered = true;
                if let Some(answer) = answer {
                    self.send(VertoFrame::notification(
                        "verto.answer",
                        json!({
                            "dialogParams": { "callID": client_call_id },
                            "sdp": answer.sdp,
                        }),
                    ));
                }
            }
            CoreEventKind::Stop { reason } | CoreEventKind::Hangup { reason } => {
                if self.bindings.remove(&client_call_id).is_some() {
                    self.send(VertoFrame::notification(
                        "verto.bye",
                        json!({
                            "dialogParams": { "callID": client_call_id },
                            "cause": reason.to_string(),
                        }),
                    ));
                }
            }
            _ => {}
        }
    }
}

/// Out-leg plugin for Verto destinations.
pub struct VertoPlugin {
    shared: Arc<VertoShared>,
}

#[async_trait]
impl CallPlugin for VertoPlugin {
    async fn invite(
        &self,
        call_id: &CallId,
        dest: &Destination,
        offer: Option<&Sdp>,
        meta: &Value,
    ) -> InviteReply {
        let DestToken::Verto { user } = &dest.dest else {
            return InviteReply::Pass;
        };
        let Some(conn_id) = self.shared.users.get(user).map(|c| c.clone()) else {
            return InviteReply::Remove;
        };
        let Some(conn) = self.shared.conns.get(&conn_id).map(|h| h.clone()) else {
            return InviteReply::Remove;
        };
        let Some(offer) = offer else {
            return InviteReply::Remove;
        };

        let client_call_id = Uuid::new_v4().to_string();
        let master = meta
            .get("caller_session")
            .and_then(|v| v.as_str())
            .and_then(|id| self.shared.manager.session(&SessionId(id.to_string())))
            .map(|h| h.link());

        let mut config = SessionConfig::new(self.shared.service.clone(), SessionType::Call)
            .with_offer(offer.clone())
            .with_register(
                Registration::new(conn.link(&client_call_id))
                    .with_payload(json!({ "callID": client_call_id })),
            );
        config.master_peer = master;

        let started = match self.shared.manager.start_session(config).await {
            Ok(started) => started,
            Err(e) => {
                warn!(call_id = %call_id, user, error = %e, "verto out-leg failed");
                return InviteReply::Remove;
            }
        };
        debug!(call_id = %call_id, user, session_id = %started.id, "verto out-leg invited");
        self.shared
            .owned_sessions
            .insert(started.id.clone(), conn_id);

        let link = started.handle.link();
        let _ = conn.tx.send(ConnCmd::OutInvite {
            client_call_id,
            session: started.handle,
            call: call_id.clone(),
            key: link.key(),
            offer_sdp: offer.sdp.clone(),
        });
        InviteReply::Ok { link }
    }

    async fn cancel(&self, _call_id: &CallId, link: &Link) {
        let Link::Session { id, .. } = link else {
            return;
        };
        if self.shared.owned_sessions.remove(id).is_none() {
            return;
        }
        if let Some(handle) = self.shared.manager.session(id) {
            handle.stop(StopReason::OriginatorCancel);
        }
    }
}

/// Resolver mapping logged-in Verto users to destinations.
pub struct VertoResolver {
    shared: Arc<VertoShared>,
}

#[async_trait]
impl Resolver for VertoResolver {
    async fn resolve(&self, _service: &ServiceId, callee: &str) -> Vec<Destination> {
        if self.shared.users.contains_key(callee) {
            vec![Destination::new(DestToken::Verto {
                user: callee.to_string(),
            })]
        } else {
            Vec::new()
        }
    }
}
