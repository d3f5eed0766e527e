//! Session actor.
//!
//! One task per session. The mailbox serializes every state mutation:
//! operations from handles, engine events routed by the manager, peer
//! coordination for bridged pairs, observer deaths, and timer fires.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use mediahub_infra_common::{EventFrame, LifetimeGuard, ObjClass, ObserverEntry};

use crate::backend::{BackendCtx, BackendSession, EngineEvent, ExtOps, Outcome};
use crate::config::{PARKED_WAIT, STOP_EVENT_GRACE, TRICKLE_DEADLINE};
use crate::errors::{CoreError, Result};
use crate::manager::{CallSpawn, SessionConfig, SessionShared};
use crate::rooms::RoomRole;
use crate::sdp;
use crate::session::handle::{SessionCmd, SessionHandle};
use crate::session::state::{Phase, SessionState};
use crate::types::{
    CallId, Candidate, CoreEvent, CoreEventKind, IceCandidate, Link, LinkKey, ObserverRole,
    Registration, RoomId, Sdp, SessionId, SessionType, StopReason, Subject, TypeExt, UpdateKind,
};

/// What `start_session` hands back once the backend came up.
#[derive(Debug)]
pub(crate) struct StartOutput {
    pub offer: Option<Sdp>,
    pub answer: Option<Sdp>,
}

type StartReply = oneshot::Sender<Result<StartOutput>>;

pub(crate) struct SessionActor {
    state: SessionState,
    backend: Option<Box<dyn BackendSession>>,
    needs_full_offer: bool,
    shared: Arc<SessionShared>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    self_tx: mpsc::UnboundedSender<SessionCmd>,
    link_rx: mpsc::UnboundedReceiver<CoreEvent>,
    self_handle: SessionHandle,
    _guard: LifetimeGuard,

    offer_waiters: Vec<oneshot::Sender<Result<Sdp>>>,
    answer_waiters: Vec<oneshot::Sender<Result<Sdp>>>,

    /// Held start for a trickle offer against a full-SDP backend.
    pending_start: Option<(Sdp, StartReply)>,
    trickle_buf: Vec<IceCandidate>,

    /// Call launched on behalf of a `call`-type session.
    call_id: Option<CallId>,

    wait_timer: Option<JoinHandle<()>>,
    ready_timer: Option<JoinHandle<()>>,
    trickle_timer: Option<JoinHandle<()>>,
    watchers: Vec<JoinHandle<()>>,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        config: &SessionConfig,
        shared: Arc<SessionShared>,
        cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
        self_tx: mpsc::UnboundedSender<SessionCmd>,
        link_rx: mpsc::UnboundedReceiver<CoreEvent>,
        guard: LifetimeGuard,
        self_handle: SessionHandle,
    ) -> Self {
        let wait_timeout = config
            .wait_timeout
            .unwrap_or_else(|| shared.config.wait_timeout());
        let ready_timeout = config
            .ready_timeout
            .unwrap_or_else(|| shared.config.ready_timeout());
        let state = SessionState::new(
            id,
            config.service.clone(),
            config.session_type,
            wait_timeout,
            ready_timeout,
        );
        Self {
            state,
            backend: None,
            needs_full_offer: false,
            shared,
            cmd_rx,
            self_tx,
            link_rx,
            self_handle,
            _guard: guard,
            offer_waiters: Vec::new(),
            answer_waiters: Vec::new(),
            pending_start: None,
            trickle_buf: Vec::new(),
            call_id: None,
            wait_timer: None,
            ready_timer: None,
            trickle_timer: None,
            watchers: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, config: SessionConfig, start_reply: StartReply) {
        if let Err(()) = self.startup(config, start_reply).await {
            return;
        }
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => break,
                },
                ev = self.link_rx.recv() => {
                    if let Some(ev) = ev {
                        self.handle_link_event(ev).await;
                    }
                }
            }
            if self.state.phase == Phase::Stopped {
                break;
            }
        }
        debug!(session_id = %self.state.session_id, "session actor finished");
    }

    // ---- startup ---------------------------------------------------------

    async fn startup(&mut self, config: SessionConfig, reply: StartReply) -> std::result::Result<(), ()> {
        self.state.type_ext = config.type_ext.clone();
        self.state.sdp_type = config
            .sdp_type
            .or_else(|| config.offer.as_ref().map(|o| o.sdp_type))
            .unwrap_or(crate::types::SdpType::Webrtc);

        if let Some(registration) = config.register.clone() {
            self.do_register(registration);
        }
        if let Some(master) = config.master_peer.clone() {
            if let Link::Session { ref id, .. } = master {
                self.state.master_peer = Some(id.clone());
            }
            self.do_register(Registration::new(master).with_role(ObserverRole::MasterPeer));
        }

        // Backend selection: an explicit id must support the type; otherwise
        // the first registered factory that does wins.
        let session_type = self.state.session_type;
        let factory = match &config.backend {
            Some(id) => self
                .shared
                .backends
                .get(id)
                .filter(|f| f.supports(session_type)),
            None => self.shared.backends.select(session_type),
        };
        let factory = match factory {
            Some(f) => f,
            None => {
                let err = CoreError::SessionError(format!(
                    "no backend for session type {session_type}"
                ));
                return self.fail_start(reply, err).await;
            }
        };
        self.state.backend = Some(factory.id());
        self.needs_full_offer = factory.needs_full_offer();

        let ctx = self.ctx();
        match factory.init(&ctx).await {
            Ok(backend) => self.backend = Some(backend),
            Err(e) => return self.fail_start(reply, e).await,
        }

        match config.offer {
            Some(offer) if offer.trickle_ice && self.needs_full_offer => {
                // Hold the start until end-of-candidates, preserving the
                // original reply channel.
                debug!(session_id = %self.state.session_id, "holding start for trickle candidates");
                self.state.transition_to(Phase::WaitOffer);
                self.pending_start = Some((offer, reply));
                self.arm_trickle_timer();
                Ok(())
            }
            Some(offer) => {
                match self.begin_with_offer(offer).await {
                    Ok(output) => {
                        let _ = reply.send(Ok(output));
                        self.after_start().await;
                        Ok(())
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        Err(())
                    }
                }
            }
            None => match self.begin_without_offer().await {
                Ok(output) => {
                    let _ = reply.send(Ok(output));
                    self.after_start().await;
                    Ok(())
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                    Err(())
                }
            },
        }
    }

    async fn fail_start(&mut self, reply: StartReply, err: CoreError) -> std::result::Result<(), ()> {
        self.stop(StopReason::Backend {
            detail: err.to_string(),
        })
        .await;
        let _ = reply.send(Err(err));
        Err(())
    }

    /// Answering path: the offer came from a signaling peer.
    async fn begin_with_offer(&mut self, offer: Sdp) -> Result<StartOutput> {
        self.state.offer = Some(offer);
        self.state.transition_to(Phase::WaitAnswer);
        self.arm_ready_timer();
        self.disarm(TimerKind::Wait);
        self.flush_offer_waiters();

        let ctx = self.ctx();
        let outcome = self
            .backend
            .as_mut()
            .expect("backend set at startup")
            .start(&ctx)
            .await;
        match outcome {
            Outcome::Ok { ops, .. } => {
                self.apply_ops(ops).await;
                self.sync_rooms(None);
                Ok(StartOutput {
                    offer: None,
                    answer: self.state.answer.clone(),
                })
            }
            Outcome::Pass => Ok(StartOutput {
                offer: None,
                answer: None,
            }),
            Outcome::Err(e) => {
                self.stop(StopReason::Backend {
                    detail: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    /// Offering path: the backend generates the offer.
    async fn begin_without_offer(&mut self) -> Result<StartOutput> {
        self.state.transition_to(Phase::WaitOffer);
        self.arm_wait_timer();

        let ctx = self.ctx();
        let outcome = self
            .backend
            .as_mut()
            .expect("backend set at startup")
            .start(&ctx)
            .await;
        match outcome {
            Outcome::Ok { ops, .. } => {
                self.apply_ops(ops).await;
                Ok(StartOutput {
                    offer: self.state.offer.clone(),
                    answer: None,
                })
            }
            Outcome::Pass => Ok(StartOutput {
                offer: None,
                answer: None,
            }),
            Outcome::Err(e) => {
                self.stop(StopReason::Backend {
                    detail: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    /// Post-start work for `call`-type sessions.
    async fn after_start(&mut self) {
        if self.state.session_type != SessionType::Call || self.state.is_terminal() {
            return;
        }
        if self.state.type_ext.peer_id.is_some() {
            // Bridge-to-session form: park is done, bridge to the peer leg.
            let ext = TypeExt {
                peer_id: self.state.type_ext.peer_id.clone(),
                ..TypeExt::default()
            };
            let (tx, _rx) = oneshot::channel();
            let _ = self.self_tx.send(SessionCmd::Update {
                update: UpdateKind::SessionType {
                    session_type: SessionType::Bridge,
                    ext,
                },
                reply: tx,
            });
            return;
        }
        if let Some(callee) = self.state.type_ext.dest.clone() {
            let launcher = match self.shared.launcher.get() {
                Some(l) => l.clone(),
                None => {
                    self.stop(StopReason::CallError {
                        detail: "no call layer installed".into(),
                    })
                    .await;
                    return;
                }
            };
            let spawn = CallSpawn {
                service: self.state.service.clone(),
                callee,
                offer: self.state.offer.clone(),
                caller_session: Some(self.state.session_id.clone()),
                link: Some(self.self_handle.link()),
                meta: Value::Null,
            };
            match launcher.launch(spawn).await {
                Ok(call_id) => {
                    debug!(session_id = %self.state.session_id, call_id = %call_id, "launched call");
                    self.call_id = Some(call_id);
                }
                Err(e) => {
                    self.stop(StopReason::CallError {
                        detail: e.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    // ---- command dispatch ------------------------------------------------

    async fn handle_cmd(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::SetOffer { offer, reply } => {
                let _ = reply.send(self.op_set_offer(offer).await);
            }
            SessionCmd::SetAnswer { answer, reply } => {
                let _ = reply.send(self.op_set_answer(answer, false).await);
            }
            SessionCmd::Update { update, reply } => {
                let _ = reply.send(self.op_update(update).await);
            }
            SessionCmd::Candidate { candidate, reply } => {
                let _ = reply.send(self.op_candidate(candidate).await);
            }
            SessionCmd::Register { registration, reply } => {
                let _ = reply.send(if self.state.is_terminal() {
                    Err(CoreError::SessionError("session is stopping".into()))
                } else {
                    self.do_register(registration);
                    Ok(())
                });
            }
            SessionCmd::Unregister { key, reply } => {
                self.shared
                    .fabric
                    .remove(self.state.session_id.as_str(), &key);
                let _ = reply.send(Ok(()));
            }
            SessionCmd::Stop { reason } => {
                self.stop(reason).await;
            }
            SessionCmd::GetOffer { reply } => match &self.state.offer {
                Some(offer) => {
                    let _ = reply.send(Ok(offer.clone()));
                }
                None if self.state.is_terminal() => {
                    let _ = reply.send(Err(CoreError::NotYet));
                }
                None => self.offer_waiters.push(reply),
            },
            SessionCmd::GetAnswer { reply } => match &self.state.answer {
                Some(answer) => {
                    let _ = reply.send(Ok(answer.clone()));
                }
                None if self.state.is_terminal() => {
                    let _ = reply.send(Err(CoreError::NotYet));
                }
                None => self.answer_waiters.push(reply),
            },
            SessionCmd::GetInfo { reply } => {
                let _ = reply.send(self.state.info());
            }
            SessionCmd::EngineEvent { event } => {
                self.on_engine_event(event).await;
            }
            SessionCmd::PeerBridge { from, reply } => {
                let _ = reply.send(if self.state.is_terminal() {
                    Err(CoreError::SessionNotFound(self.state.session_id.clone()))
                } else {
                    self.state.park_after_bridge = true;
                    self.state.master_peer = Some(from);
                    Ok(())
                });
            }
            SessionCmd::PeerBridgeStop { from } => {
                self.on_peer_bridge_stop(from).await;
            }
            SessionCmd::PeerCandidate { candidate } => {
                if !self.state.is_terminal() {
                    self.emit(CoreEventKind::Candidate { candidate });
                }
            }
            SessionCmd::ObserverDown { key } => {
                self.on_observer_down(key).await;
            }
            SessionCmd::WaitTimeout => {
                if self.state.phase == Phase::WaitOffer {
                    self.stop(StopReason::SessionTimeout).await;
                }
            }
            SessionCmd::ReadyTimeout => {
                if self.state.phase == Phase::WaitAnswer {
                    self.stop(StopReason::SessionTimeout).await;
                }
            }
            SessionCmd::TrickleTimeout => {
                if self.pending_start.is_some() {
                    debug!(session_id = %self.state.session_id, "trickle deadline, resuming start");
                    self.resume_held_start().await;
                }
            }
        }
    }

    // ---- operations ------------------------------------------------------

    async fn op_set_offer(&mut self, offer: Sdp) -> Result<()> {
        if self.state.is_terminal() {
            return Err(CoreError::SessionError("session is stopping".into()));
        }
        if self.state.offer.is_some() || self.state.phase != Phase::WaitOffer {
            return Err(CoreError::SessionError("offer already set".into()));
        }

        self.state.offer = Some(offer.clone());
        self.state.transition_to(Phase::WaitAnswer);
        self.disarm(TimerKind::Wait);
        self.arm_ready_timer();
        self.flush_offer_waiters();

        let ctx = self.ctx();
        match self.backend.as_mut().expect("backend").set_offer(&offer, &ctx).await {
            Outcome::Ok { ops, .. } => {
                self.apply_ops(ops).await;
                Ok(())
            }
            Outcome::Pass => Ok(()),
            Outcome::Err(e) => {
                self.stop(StopReason::Backend {
                    detail: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    /// `from_ops` marks answers the backend produced itself; those skip the
    /// backend round-trip.
    async fn op_set_answer(&mut self, answer: Sdp, from_ops: bool) -> Result<()> {
        if self.state.answer.is_some() {
            return Err(CoreError::AlreadyAnswered);
        }
        if self.state.phase != Phase::WaitAnswer {
            return Err(CoreError::SessionError("session has no offer yet".into()));
        }

        let mut final_answer = answer.clone();
        if !from_ops {
            let ctx = self.ctx();
            match self
                .backend
                .as_mut()
                .expect("backend")
                .set_answer(&answer, &ctx)
                .await
            {
                Outcome::Ok { ops, .. } => {
                    if let Some(a) = ops.answer.clone() {
                        final_answer = a;
                    }
                    let rest = ExtOps {
                        answer: None,
                        ..ops
                    };
                    Box::pin(self.apply_ops(rest)).await;
                }
                Outcome::Pass => {}
                Outcome::Err(e) => {
                    self.stop(StopReason::Backend {
                        detail: e.to_string(),
                    })
                    .await;
                    return Err(e);
                }
            }
        }

        self.state.answer = Some(final_answer.clone());
        self.state.transition_to(Phase::Ready);
        self.disarm(TimerKind::Ready);
        self.flush_answer_waiters();
        self.sync_rooms(None);
        info!(session_id = %self.state.session_id, "session answered");
        self.emit(CoreEventKind::Answer {
            answer: Some(final_answer.clone()),
            winner: None,
        });

        // A call-type leg propagates its answer to the master leg.
        if self.state.session_type == SessionType::Call {
            if let Some(master) = self.state.master_peer.clone() {
                if let Some(handle) = self.shared.session(&master) {
                    let answer = final_answer;
                    tokio::spawn(async move {
                        if let Err(e) = handle.set_answer(answer).await {
                            debug!(master = %master, error = %e, "master answer propagation failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    async fn op_update(&mut self, update: UpdateKind) -> Result<Value> {
        if self.state.is_terminal() {
            return Err(CoreError::SessionError("session is stopping".into()));
        }

        // Bridge is coordinated here: the initiating (master) leg pins
        // park_after_bridge on both sides before the backend does the work.
        if let UpdateKind::SessionType {
            session_type: SessionType::Bridge,
            ext,
        } = &update
        {
            if let Some(peer) = ext.peer_id.clone() {
                return self.op_bridge(peer).await;
            }
        }

        let ctx = self.ctx();
        match self.backend.as_mut().expect("backend").update(&update, &ctx).await {
            Outcome::Ok { reply, ops } => {
                self.apply_ops(ops).await;
                Ok(reply)
            }
            Outcome::Pass => Err(CoreError::SessionError(
                "update not supported by backend".into(),
            )),
            // Update failures return to the caller; they do not stop the
            // session.
            Outcome::Err(e) => Err(e),
        }
    }

    async fn op_bridge(&mut self, peer: SessionId) -> Result<Value> {
        let peer_handle = self
            .shared
            .session(&peer)
            .ok_or_else(|| CoreError::SessionNotFound(peer.clone()))?;

        self.state.park_after_bridge = true;
        match timeout(
            PARKED_WAIT,
            peer_handle.peer_bridge(self.state.session_id.clone()),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(CoreError::Timeout("bridge peer handshake".into())),
        }

        let update = UpdateKind::SessionType {
            session_type: SessionType::Bridge,
            ext: TypeExt {
                peer_id: Some(peer.clone()),
                ..TypeExt::default()
            },
        };
        let ctx = self.ctx();
        match self.backend.as_mut().expect("backend").update(&update, &ctx).await {
            Outcome::Ok { reply, ops } => {
                self.apply_ops(ops).await;
                self.state.slave_peer = Some(peer);
                Ok(reply)
            }
            Outcome::Pass => Err(CoreError::SessionError(
                "bridge not supported by backend".into(),
            )),
            Outcome::Err(e) => Err(e),
        }
    }

    async fn op_candidate(&mut self, candidate: Candidate) -> Result<()> {
        if self.state.is_terminal() {
            return Err(CoreError::SessionError("session is stopping".into()));
        }

        // Trickle-held start: buffer until end-of-candidates, then fold the
        // candidates into the offer and resume.
        if self.pending_start.is_some() {
            match candidate {
                Candidate::Item(item) => {
                    self.trickle_buf.push(item);
                    return Ok(());
                }
                Candidate::End => {
                    self.resume_held_start().await;
                    return Ok(());
                }
            }
        }

        let ctx = self.ctx();
        match self
            .backend
            .as_mut()
            .expect("backend")
            .candidate(&candidate, &ctx)
            .await
        {
            Outcome::Ok { ops, .. } => {
                self.apply_ops(ops).await;
                Ok(())
            }
            Outcome::Pass => {
                // Signaling-only leg: forward toward the linked peer leg,
                // buffering until the peer is known.
                let peer = self
                    .state
                    .master_peer
                    .clone()
                    .or_else(|| self.state.slave_peer.clone());
                match peer.and_then(|p| self.shared.session(&p)) {
                    Some(handle) => handle.peer_candidate(candidate),
                    None => self.state.candidate_buf.push(candidate),
                }
                Ok(())
            }
            Outcome::Err(e) => Err(e),
        }
    }

    async fn resume_held_start(&mut self) {
        let Some((mut offer, reply)) = self.pending_start.take() else {
            return;
        };
        self.disarm(TimerKind::Trickle);
        let candidates: Vec<IceCandidate> = self.trickle_buf.drain(..).collect();
        offer.sdp = sdp::add_candidates(&offer.sdp, &candidates);
        offer.trickle_ice = false;

        match self.begin_with_offer(offer).await {
            Ok(output) => {
                let _ = reply.send(Ok(output));
                self.after_start().await;
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    // ---- engine + peer events --------------------------------------------

    async fn on_engine_event(&mut self, event: EngineEvent) {
        if self.state.is_terminal() {
            return;
        }
        let ctx = self.ctx();
        let was_bridged = self.state.session_type == SessionType::Bridge;
        match self
            .backend
            .as_mut()
            .expect("backend")
            .engine_event(event.clone(), &ctx)
            .await
        {
            Outcome::Ok { ops, .. } => {
                let reset_to_park = was_bridged
                    && ops.session_type == Some(SessionType::Park);
                self.apply_ops(ops).await;
                if reset_to_park {
                    self.state.master_peer = None;
                    self.state.slave_peer = None;
                }
            }
            Outcome::Pass => match event {
                EngineEvent::Candidate { candidate } => {
                    self.emit(CoreEventKind::Candidate { candidate });
                }
                EngineEvent::Hangup { code } => {
                    let detail = match code {
                        Some(code) => format!("hangup {code}"),
                        None => "hangup".to_string(),
                    };
                    self.stop(StopReason::Backend { detail }).await;
                }
                EngineEvent::Destroyed => {
                    self.stop(StopReason::Backend {
                        detail: "channel destroyed".into(),
                    })
                    .await;
                }
                _ => {}
            },
            Outcome::Err(e) => {
                self.stop(StopReason::Backend {
                    detail: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn on_peer_bridge_stop(&mut self, from: SessionId) {
        if self.state.is_terminal() || self.state.session_type != SessionType::Bridge {
            return;
        }
        let is_peer = self.state.master_peer.as_ref() == Some(&from)
            || self.state.slave_peer.as_ref() == Some(&from);
        if !is_peer {
            return;
        }
        info!(session_id = %self.state.session_id, peer = %from, "bridge peer gone, back to park");
        self.state.master_peer = None;
        self.state.slave_peer = None;

        let update = UpdateKind::SessionType {
            session_type: SessionType::Park,
            ext: TypeExt::default(),
        };
        let ctx = self.ctx();
        match self.backend.as_mut().expect("backend").update(&update, &ctx).await {
            Outcome::Ok { ops, .. } => self.apply_ops(ops).await,
            _ => {
                // Backend could not park; reflect the reset locally anyway.
                self.state.session_type = SessionType::Park;
                self.state.type_ext = TypeExt::default();
                self.emit(CoreEventKind::UpdatedType {
                    session_type: SessionType::Park,
                    ext: TypeExt::default(),
                });
            }
        }
    }

    async fn on_observer_down(&mut self, key: LinkKey) {
        if self.state.is_terminal() {
            return;
        }
        let Some(entry) = self
            .shared
            .fabric
            .get(self.state.session_id.as_str(), &key)
        else {
            return; // already unregistered
        };
        let reason = entry
            .payload
            .as_ref()
            .map(|r| r.stop_reason())
            .unwrap_or(StopReason::RegisteredStop);
        info!(session_id = %self.state.session_id, observer = %key, reason = %reason, "observer died");
        self.stop(reason).await;
    }

    async fn handle_link_event(&mut self, event: CoreEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event.subject {
            // Events from the launched call, or from a call this session was
            // linked to by an adapter.
            Subject::Call(ref call_id)
                if self.call_id.as_ref().map_or(true, |id| id == call_id) =>
            {
                match event.kind {
                    CoreEventKind::Ringing { answer } => {
                        self.emit(CoreEventKind::Ringing { answer });
                    }
                    CoreEventKind::Answer { answer, winner } => {
                        if let Some(LinkKey::Session(peer)) = winner {
                            self.state.slave_peer = Some(peer.clone());
                            self.flush_candidate_buf(&peer);
                        }
                        if let Some(answer) = answer {
                            if let Err(e) = self.op_set_answer(answer, false).await {
                                debug!(
                                    session_id = %self.state.session_id,
                                    error = %e,
                                    "call answer not applied"
                                );
                            }
                        }
                    }
                    CoreEventKind::Hangup { reason } => {
                        self.stop(reason).await;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    // ---- registration & events -------------------------------------------

    fn do_register(&mut self, registration: Registration) {
        let key = registration.link.key();
        let lifetime = registration.link.lifetime().clone();
        debug!(session_id = %self.state.session_id, observer = %key, "observer registered");
        self.shared.fabric.add(
            self.state.session_id.as_str(),
            ObserverEntry {
                key: key.clone(),
                lifetime: lifetime.clone(),
                payload: Some(registration),
            },
        );
        let tx = self.self_tx.clone();
        self.watchers.push(tokio::spawn(async move {
            lifetime.ended().await;
            let _ = tx.send(SessionCmd::ObserverDown { key });
        }));
    }

    fn emit(&mut self, kind: CoreEventKind) {
        if matches!(kind, CoreEventKind::Stop { .. }) {
            if self.state.stop_sent {
                return;
            }
            self.state.stop_sent = true;
        }
        let subject = Subject::Session(self.state.session_id.clone());
        for entry in self
            .shared
            .fabric
            .entries(self.state.session_id.as_str())
        {
            if let Some(registration) = entry.payload {
                registration.link.sink().send(CoreEvent {
                    subject: subject.clone(),
                    kind: kind.clone(),
                    payload: registration.payload.clone(),
                });
            }
        }
        self.shared.bus.publish(EventFrame::new(
            self.state.service.as_str(),
            "media",
            ObjClass::Session,
            kind.tag(),
            self.state.session_id.as_str(),
            kind.body(),
        ));
    }

    async fn apply_ops(&mut self, ops: ExtOps) {
        if let Some(offer) = ops.offer {
            if self.state.offer.is_none() {
                self.state.offer = Some(offer);
                if self.state.phase == Phase::WaitOffer {
                    self.state.transition_to(Phase::WaitAnswer);
                    self.disarm(TimerKind::Wait);
                    self.arm_ready_timer();
                }
                self.flush_offer_waiters();
            }
        }

        if ops.session_type.is_some() || ops.type_ext.is_some() {
            let old_type = self.state.session_type;
            let old_ext = self.state.type_ext.clone();
            let old_room = self.roomy_membership();
            if let Some(t) = ops.session_type {
                self.state.session_type = t;
            }
            if let Some(ext) = ops.type_ext {
                self.state.type_ext = ext;
            }
            // Only an actual change is a transition worth announcing.
            if old_type != self.state.session_type || old_ext != self.state.type_ext {
                if old_type == SessionType::Bridge
                    && self.state.session_type != SessionType::Bridge
                {
                    self.state.master_peer = None;
                    self.state.slave_peer = None;
                }
                self.sync_rooms(old_room);
                self.emit(CoreEventKind::UpdatedType {
                    session_type: self.state.session_type,
                    ext: self.state.type_ext.clone(),
                });
            }
        }

        if let Some(answer) = ops.answer {
            if let Err(e) = self.op_set_answer(answer, true).await {
                debug!(session_id = %self.state.session_id, error = %e, "backend answer dropped");
            }
        }
    }

    fn roomy_membership(&self) -> Option<(RoomId, RoomRole)> {
        let room = self.state.type_ext.room_id.clone()?;
        let role = match self.state.session_type {
            SessionType::Mcu => RoomRole::Member,
            SessionType::Publish => RoomRole::Publisher,
            SessionType::Listen => RoomRole::Listener,
            _ => return None,
        };
        Some((room, role))
    }

    fn sync_rooms(&mut self, old: Option<(RoomId, RoomRole)>) {
        let new = self.roomy_membership();
        if old == new {
            return;
        }
        if let Some((room, _)) = old {
            self.shared.rooms.leave(&room, &self.state.session_id);
        }
        if let Some((room, role)) = new {
            self.shared.rooms.ensure(
                &self.state.service,
                &room,
                self.state.type_ext.room_type.clone(),
                self.state.backend.clone(),
            );
            self.shared.rooms.join(&room, &self.state.session_id, role);
        }
    }

    fn flush_candidate_buf(&mut self, peer: &SessionId) {
        if self.state.candidate_buf.is_empty() {
            return;
        }
        if let Some(handle) = self.shared.session(peer) {
            for candidate in self.state.candidate_buf.drain(..) {
                handle.peer_candidate(candidate);
            }
        }
    }

    fn flush_offer_waiters(&mut self) {
        if let Some(offer) = self.state.offer.clone() {
            for waiter in self.offer_waiters.drain(..) {
                let _ = waiter.send(Ok(offer.clone()));
            }
        }
    }

    fn flush_answer_waiters(&mut self) {
        if let Some(answer) = self.state.answer.clone() {
            for waiter in self.answer_waiters.drain(..) {
                let _ = waiter.send(Ok(answer.clone()));
            }
        }
    }

    // ---- teardown --------------------------------------------------------

    async fn stop(&mut self, reason: StopReason) {
        if self.state.is_terminal() {
            return;
        }
        info!(session_id = %self.state.session_id, reason = %reason, "stopping session");
        self.state.transition_to(Phase::Stopping);
        self.disarm(TimerKind::Wait);
        self.disarm(TimerKind::Ready);
        self.disarm(TimerKind::Trickle);

        // A bridged peer survives us by resetting to park.
        if self.state.session_type == SessionType::Bridge {
            let peer = self
                .state
                .slave_peer
                .clone()
                .or_else(|| self.state.master_peer.clone());
            if let Some(peer) = peer {
                if let Some(handle) = self.shared.session(&peer) {
                    handle.peer_bridge_stop(self.state.session_id.clone());
                }
            }
        }

        if let Some((room, _)) = self.roomy_membership() {
            self.shared.rooms.leave(&room, &self.state.session_id);
        }

        if let Some(backend) = self.backend.as_mut() {
            let ctx = BackendCtx {
                session_id: self.state.session_id.clone(),
                service: self.state.service.clone(),
                session_type: self.state.session_type,
                type_ext: self.state.type_ext.clone(),
                offer: self.state.offer.clone(),
                answer: self.state.answer.clone(),
                sdp_type: self.state.sdp_type,
            };
            backend.stop(&reason, &ctx).await;
        }

        for waiter in self.offer_waiters.drain(..) {
            let _ = waiter.send(Err(CoreError::NotYet));
        }
        for waiter in self.answer_waiters.drain(..) {
            let _ = waiter.send(Err(CoreError::NotYet));
        }
        if let Some((_, reply)) = self.pending_start.take() {
            let _ = reply.send(Err(CoreError::SessionError("session stopped".into())));
        }

        self.emit(CoreEventKind::Stop { reason });

        // Let fire-and-forget observers drain before registrations vanish.
        tokio::time::sleep(STOP_EVENT_GRACE).await;

        self.shared
            .fabric
            .remove_subject(self.state.session_id.as_str());
        self.shared.sessions.remove(&self.state.session_id);
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        self.state.transition_to(Phase::Stopped);
    }

    // ---- helpers ---------------------------------------------------------

    fn ctx(&self) -> BackendCtx {
        BackendCtx {
            session_id: self.state.session_id.clone(),
            service: self.state.service.clone(),
            session_type: self.state.session_type,
            type_ext: self.state.type_ext.clone(),
            offer: self.state.offer.clone(),
            answer: self.state.answer.clone(),
            sdp_type: self.state.sdp_type,
        }
    }

    fn arm_wait_timer(&mut self) {
        let tx = self.self_tx.clone();
        let after = self.state.wait_timeout;
        self.wait_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(SessionCmd::WaitTimeout);
        }));
    }

    fn arm_ready_timer(&mut self) {
        let tx = self.self_tx.clone();
        let after = self.state.ready_timeout;
        self.ready_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(SessionCmd::ReadyTimeout);
        }));
    }

    fn arm_trickle_timer(&mut self) {
        let tx = self.self_tx.clone();
        self.trickle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(TRICKLE_DEADLINE).await;
            let _ = tx.send(SessionCmd::TrickleTimeout);
        }));
    }

    fn disarm(&mut self, kind: TimerKind) {
        let slot = match kind {
            TimerKind::Wait => &mut self.wait_timer,
            TimerKind::Ready => &mut self.ready_timer,
            TimerKind::Trickle => &mut self.trickle_timer,
        };
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

enum TimerKind {
    Wait,
    Ready,
    Trickle,
}

impl Drop for SessionActor {
    fn drop(&mut self) {
        // Safety net if the actor is dropped without a clean stop.
        self.shared.sessions.remove(&self.state.session_id);
        self.shared
            .fabric
            .remove_subject(self.state.session_id.as_str());
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        if let Some(w) = self.wait_timer.take() {
            w.abort();
        }
        if let Some(w) = self.ready_timer.take() {
            w.abort();
        }
        if let Some(w) = self.trickle_timer.take() {
            w.abort();
        }
    }
}
