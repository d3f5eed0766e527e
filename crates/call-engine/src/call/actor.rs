//! Call actor.
//!
//! One task per call. Resolves the callee, fans out invites with per-
//! destination wait and ring timers, applies first-answer-wins, cancels the
//! losers, and tears everything down atomically on hangup.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use mediahub_infra_common::{EventFrame, LifetimeGuard, ObjClass, ObserverEntry};

use mediahub_session_core::config::STOP_EVENT_GRACE;
use mediahub_session_core::{
    CoreError, CoreEvent, CoreEventKind, LinkKey, ObserverRole, Registration, Result, Sdp,
    StopReason, Subject,
};

use crate::engine::CallEngineShared;
use crate::invite::{ring_duration, Invite, InviteReply};

use super::handle::{CallCmd, CallHandle};
use super::state::{CallPhase, CallState};

pub(crate) struct CallActor {
    state: CallState,
    invites: Vec<Invite>,
    shared: Arc<CallEngineShared>,
    cmd_rx: mpsc::UnboundedReceiver<CallCmd>,
    self_tx: mpsc::UnboundedSender<CallCmd>,
    /// Caller-provided meta with the caller session injected, as handed to
    /// invite plugins.
    plugin_meta: serde_json::Value,
    _guard: LifetimeGuard,
    watchers: Vec<tokio::task::JoinHandle<()>>,
}

impl CallActor {
    pub(crate) fn new(
        state: CallState,
        shared: Arc<CallEngineShared>,
        cmd_rx: mpsc::UnboundedReceiver<CallCmd>,
        self_tx: mpsc::UnboundedSender<CallCmd>,
        guard: LifetimeGuard,
    ) -> Self {
        let mut plugin_meta = match state.meta.clone() {
            serde_json::Value::Null => serde_json::json!({}),
            serde_json::Value::Object(map) => serde_json::Value::Object(map),
            other => serde_json::json!({ "meta": other }),
        };
        if let Some(caller) = &state.caller_session {
            plugin_meta["caller_session"] = serde_json::Value::String(caller.as_str().to_string());
        }
        Self {
            state,
            invites: Vec::new(),
            shared,
            cmd_rx,
            self_tx,
            plugin_meta,
            _guard: guard,
            watchers: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, register: Option<Registration>) {
        // Registration happens before the first await so the initiating
        // adapter cannot miss the no-destination hangup.
        if let Some(registration) = register {
            self.do_register(registration);
        }

        let destinations = self
            .shared
            .resolvers
            .resolve(&self.state.service, &self.state.callee)
            .await;
        debug!(
            call_id = %self.state.call_id,
            callee = %self.state.callee,
            destinations = destinations.len(),
            "callee resolved"
        );

        if destinations.is_empty() {
            // Grace first, so just-registered observers get the event.
            tokio::time::sleep(STOP_EVENT_GRACE).await;
            self.hangup(StopReason::NoDestination).await;
            return;
        }

        self.state.phase = CallPhase::Inviting;
        for (pos, dest) in destinations.into_iter().enumerate() {
            let wait = Duration::from_secs(dest.wait_secs);
            let mut invite = Invite::new(dest);
            if wait.is_zero() {
                let _ = self.self_tx.send(CallCmd::LaunchOut { pos });
            } else {
                let tx = self.self_tx.clone();
                invite.wait_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let _ = tx.send(CallCmd::LaunchOut { pos });
                }));
            }
            self.invites.push(invite);
        }

        while let Some(cmd) = self.cmd_rx.recv().await {
            self.handle_cmd(cmd).await;
            if self.state.phase == CallPhase::Stopped {
                break;
            }
        }
        debug!(call_id = %self.state.call_id, "call actor finished");
    }

    async fn handle_cmd(&mut self, cmd: CallCmd) {
        match cmd {
            CallCmd::Ringing { key, answer, reply } => {
                let _ = reply.send(self.on_ringing(key, answer));
            }
            CallCmd::Answered { key, answer, reply } => {
                let _ = reply.send(self.on_answered(key, answer).await);
            }
            CallCmd::Rejected { key, reply } => {
                let _ = reply.send(self.on_rejected(key).await);
            }
            CallCmd::Hangup { reason } => {
                self.hangup(reason).await;
            }
            CallCmd::Register { registration, reply } => {
                let _ = reply.send(if self.state.is_terminal() {
                    Err(CoreError::CallError("call is stopping".into()))
                } else {
                    self.do_register(registration);
                    Ok(())
                });
            }
            CallCmd::Unregister { key, reply } => {
                self.shared.fabric.remove(self.state.call_id.as_str(), &key);
                let _ = reply.send(Ok(()));
            }
            CallCmd::GetInfo { reply } => {
                let launched = self.invites.iter().filter(|i| i.launched).count();
                let _ = reply.send(self.state.info(self.invites.len(), launched));
            }
            CallCmd::LaunchOut { pos } => {
                self.launch_out(pos).await;
            }
            CallCmd::RingTimeout { pos } => {
                self.on_ring_timeout(pos).await;
            }
            CallCmd::InviteDown { pos } => {
                self.on_invite_down(pos).await;
            }
            CallCmd::ObserverDown { key } => {
                self.on_observer_down(key).await;
            }
        }
    }

    // ---- invite fan-out --------------------------------------------------

    async fn launch_out(&mut self, pos: usize) {
        if self.state.is_terminal() || self.state.phase == CallPhase::Answered {
            return;
        }
        let Some(invite) = self.invites.get(pos) else {
            return;
        };
        if invite.removed || invite.launched {
            return;
        }
        let dest = invite.dest.clone();

        debug!(call_id = %self.state.call_id, pos, dest = %dest.dest, "launching invite");
        let reply = self
            .shared
            .plugins
            .invite(
                &self.state.call_id,
                &dest,
                self.state.offer.as_ref(),
                &self.plugin_meta,
            )
            .await;

        match reply {
            InviteReply::Ok { link } => {
                let key = link.key();
                let lifetime = link.lifetime().clone();
                let invite = &mut self.invites[pos];
                invite.launched = true;
                invite.link = Some(link);

                // Leg death before answer counts as a rejection.
                let tx = self.self_tx.clone();
                self.watchers.push(tokio::spawn(async move {
                    lifetime.ended().await;
                    let _ = tx.send(CallCmd::InviteDown { pos });
                }));

                let ring = ring_duration(self.invites[pos].dest.ring_secs);
                let tx = self.self_tx.clone();
                self.invites[pos].ring_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(ring).await;
                    let _ = tx.send(CallCmd::RingTimeout { pos });
                }));
                debug!(call_id = %self.state.call_id, pos, key = %key, "invite launched");
            }
            InviteReply::Retry { secs } => {
                debug!(call_id = %self.state.call_id, pos, secs, "invite retry scheduled");
                let tx = self.self_tx.clone();
                self.invites[pos].wait_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    let _ = tx.send(CallCmd::LaunchOut { pos });
                }));
            }
            InviteReply::Remove | InviteReply::Pass => {
                debug!(call_id = %self.state.call_id, pos, "invite dropped by dispatch");
                self.drop_invite(pos).await;
            }
        }
    }

    fn find_invite(&self, key: &LinkKey) -> Option<usize> {
        self.invites.iter().position(|i| {
            i.launched
                && !i.removed
                && i.link.as_ref().map(|l| l.key()) == Some(key.clone())
        })
    }

    fn on_ringing(&mut self, key: LinkKey, answer: Option<Sdp>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(CoreError::CallError("call is stopping".into()));
        }
        let _pos = self.find_invite(&key).ok_or(CoreError::InviteNotFound)?;
        debug!(call_id = %self.state.call_id, key = %key, "leg ringing");
        self.emit(CoreEventKind::Ringing { answer });
        Ok(())
    }

    async fn on_answered(&mut self, key: LinkKey, answer: Sdp) -> Result<()> {
        if self.state.is_terminal() {
            return Err(CoreError::CallError("call is stopping".into()));
        }
        if self.state.phase == CallPhase::Answered {
            return Err(CoreError::AlreadyAnswered);
        }
        let pos = self.find_invite(&key).ok_or(CoreError::InviteNotFound)?;

        info!(call_id = %self.state.call_id, key = %key, "call answered");
        self.state.phase = CallPhase::Answered;
        let winner_link = self.invites[pos].link.clone().expect("launched invite has link");
        self.state.callee_link = Some(winner_link.clone());
        self.invites[pos].abort_timers();

        // Cancel every loser before the answer event goes out.
        for pos_other in 0..self.invites.len() {
            if pos_other == pos {
                continue;
            }
            self.cancel_invite(pos_other).await;
        }

        // The winner becomes an observer: its death hangs the call up with
        // `callee_stop`, and it receives the call's hangup to tear down the
        // wire leg.
        self.do_register(Registration::new(winner_link).with_role(ObserverRole::Callee));

        self.emit(CoreEventKind::Answer {
            answer: Some(answer),
            winner: Some(key),
        });
        Ok(())
    }

    async fn on_rejected(&mut self, key: LinkKey) -> Result<()> {
        if self.state.is_terminal() {
            return Err(CoreError::CallError("call is stopping".into()));
        }
        let pos = self.find_invite(&key).ok_or(CoreError::InviteNotFound)?;
        debug!(call_id = %self.state.call_id, key = %key, "leg rejected");
        self.drop_invite_quiet(pos);
        self.check_any_left().await;
        Ok(())
    }

    async fn on_ring_timeout(&mut self, pos: usize) {
        if self.state.is_terminal() || self.state.phase == CallPhase::Answered {
            return;
        }
        let Some(invite) = self.invites.get(pos) else {
            return;
        };
        if invite.removed || !invite.launched {
            return;
        }
        debug!(call_id = %self.state.call_id, pos, "ring timeout");
        self.cancel_invite(pos).await;
        self.check_any_left().await;
    }

    async fn on_invite_down(&mut self, pos: usize) {
        if self.state.is_terminal() || self.state.phase == CallPhase::Answered {
            return;
        }
        let Some(invite) = self.invites.get(pos) else {
            return;
        };
        if invite.removed {
            return;
        }
        debug!(call_id = %self.state.call_id, pos, "invite link died");
        self.drop_invite_quiet(pos);
        self.check_any_left().await;
    }

    /// Drop an invite without sending a cancel (the leg is already gone).
    fn drop_invite_quiet(&mut self, pos: usize) {
        if let Some(invite) = self.invites.get_mut(pos) {
            invite.removed = true;
            invite.abort_timers();
        }
    }

    /// Cancel a launched invite through its plugin, then drop it.
    async fn cancel_invite(&mut self, pos: usize) {
        let link = match self.invites.get_mut(pos) {
            Some(invite) if !invite.removed => {
                invite.removed = true;
                invite.abort_timers();
                invite.link.clone()
            }
            _ => return,
        };
        if let Some(link) = link {
            self.shared.plugins.cancel(&self.state.call_id, &link).await;
        }
    }

    async fn drop_invite(&mut self, pos: usize) {
        self.drop_invite_quiet(pos);
        self.check_any_left().await;
    }

    async fn check_any_left(&mut self) {
        if self.state.phase == CallPhase::Answered || self.state.is_terminal() {
            return;
        }
        if self.invites.iter().any(|i| i.live()) {
            return;
        }
        info!(call_id = %self.state.call_id, "no invites left");
        self.hangup(StopReason::NoAnswer).await;
    }

    // ---- observers -------------------------------------------------------

    fn do_register(&mut self, registration: Registration) {
        let key = registration.link.key();
        let lifetime = registration.link.lifetime().clone();
        debug!(call_id = %self.state.call_id, observer = %key, "observer registered");
        self.shared.fabric.add(
            self.state.call_id.as_str(),
            ObserverEntry {
                key: key.clone(),
                lifetime: lifetime.clone(),
                payload: Some(registration),
            },
        );
        let tx = self.self_tx.clone();
        self.watchers.push(tokio::spawn(async move {
            lifetime.ended().await;
            let _ = tx.send(CallCmd::ObserverDown { key });
        }));
    }

    async fn on_observer_down(&mut self, key: LinkKey) {
        if self.state.is_terminal() {
            return;
        }
        let Some(entry) = self.shared.fabric.get(self.state.call_id.as_str(), &key) else {
            return;
        };
        let reason = entry
            .payload
            .as_ref()
            .map(|r| r.stop_reason())
            .unwrap_or(StopReason::RegisteredStop);
        info!(call_id = %self.state.call_id, observer = %key, reason = %reason, "observer died");
        self.hangup(reason).await;
    }

    fn emit(&mut self, kind: CoreEventKind) {
        if matches!(kind, CoreEventKind::Hangup { .. }) {
            if self.state.stop_sent {
                return;
            }
            self.state.stop_sent = true;
        }
        let subject = Subject::Call(self.state.call_id.clone());
        for entry in self.shared.fabric.entries(self.state.call_id.as_str()) {
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
            ObjClass::Call,
            kind.tag(),
            self.state.call_id.as_str(),
            kind.body(),
        ));
    }

    // ---- teardown --------------------------------------------------------

    async fn hangup(&mut self, reason: StopReason) {
        if self.state.is_terminal() {
            return;
        }
        if self.state.stop_sent {
            warn!(call_id = %self.state.call_id, "hangup after stop already sent");
            return;
        }
        info!(call_id = %self.state.call_id, reason = %reason, "call hangup");
        self.state.phase = CallPhase::Stopping;

        // Losers get a cancel; the winner learns through the hangup event.
        let winner_key = self.state.callee_link.as_ref().map(|l| l.key());
        for pos in 0..self.invites.len() {
            let is_winner = self.invites[pos]
                .link
                .as_ref()
                .map(|l| Some(l.key()) == winner_key)
                .unwrap_or(false);
            if is_winner {
                self.invites[pos].abort_timers();
                self.invites[pos].removed = true;
            } else {
                self.cancel_invite(pos).await;
            }
        }

        self.emit(CoreEventKind::Hangup { reason });

        tokio::time::sleep(STOP_EVENT_GRACE).await;

        self.shared.fabric.remove_subject(self.state.call_id.as_str());
        self.shared.calls.remove(&self.state.call_id);
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
        self.state.phase = CallPhase::Stopped;
    }
}

impl Drop for CallActor {
    fn drop(&mut self) {
        self.shared.calls.remove(&self.state.call_id);
        self.shared.fabric.remove_subject(self.state.call_id.as_str());
        for invite in &mut self.invites {
            invite.abort_timers();
        }
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
    }
}
