//! FS backend adapter.
//!
//! Park, echo, and MCU are dialplan-inline transfers; bridge connects two
//! parked channels and pins `park_after_bridge` on both legs through the
//! session layer. The adapter keeps the channel↔session maps and routes
//! engine events to the owning sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, warn};

use mediahub_session_core::backend::{
    BackendCtx, BackendFactory, BackendSession, EngineEvent, ExtOps, Outcome, SessionEventRouter,
};
use mediahub_session_core::config::PARKED_WAIT;
use mediahub_session_core::{
    BackendId, Candidate, CoreError, FsError, Result, Sdp, SessionId, SessionType, StopReason,
    TypeExt, UpdateKind,
};

use crate::engine::{ChannelId, FsEngine, FsEvent, FsEventKind};

const DEFAULT_ROOM_TYPE: &str = "video-mcu-stereo";

struct FsShared {
    engine: Arc<dyn FsEngine>,
    channels: DashMap<ChannelId, SessionId>,
    by_session: DashMap<SessionId, ChannelId>,
}

impl FsShared {
    fn register(&self, channel: ChannelId, session: SessionId) {
        self.channels.insert(channel.clone(), session.clone());
        self.by_session.insert(session, channel);
    }

    fn unregister(&self, session: &SessionId) {
        if let Some((_, channel)) = self.by_session.remove(session) {
            self.channels.remove(&channel);
        }
    }

    fn channel_of(&self, session: &SessionId) -> Option<ChannelId> {
        self.by_session.get(session).map(|c| c.clone())
    }

    fn session_of(&self, channel: &ChannelId) -> Option<SessionId> {
        self.channels.get(channel).map(|s| s.clone())
    }
}

/// Factory for the FS backend.
pub struct FsBackend {
    shared: Arc<FsShared>,
}

impl FsBackend {
    /// Build against an engine handle. Spawns the event router that
    /// translates engine notifications into session-bound events.
    pub fn new(engine: Arc<dyn FsEngine>, router: Arc<dyn SessionEventRouter>) -> Self {
        let shared = Arc::new(FsShared {
            engine: engine.clone(),
            channels: DashMap::new(),
            by_session: DashMap::new(),
        });

        let events = engine.subscribe();
        tokio::spawn(route_events(events, shared.clone(), router));

        Self { shared }
    }
}

async fn route_events(
    mut events: broadcast::Receiver<FsEvent>,
    shared: Arc<FsShared>,
    router: Arc<dyn SessionEventRouter>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "fs event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(session) = shared.session_of(&event.channel) else {
            continue;
        };
        let translated = match event.kind {
            FsEventKind::Parked => EngineEvent::Parked,
            FsEventKind::Bridged { peer } => EngineEvent::Bridged {
                peer_session: shared.session_of(&peer),
            },
            FsEventKind::Hangup { code } => EngineEvent::Hangup { code },
            FsEventKind::Destroyed => {
                shared.unregister(&session);
                EngineEvent::Destroyed
            }
            FsEventKind::ConferenceInfo { body } => EngineEvent::Info { body },
        };
        router.route(&session, translated);
    }
}

#[async_trait]
impl BackendFactory for FsBackend {
    fn id(&self) -> BackendId {
        BackendId::fs()
    }

    fn supports(&self, session_type: SessionType) -> bool {
        matches!(
            session_type,
            SessionType::Park
                | SessionType::Echo
                | SessionType::Mcu
                | SessionType::Bridge
                | SessionType::Call
        )
    }

    // FS transfers need the complete SDP; trickle offers are aggregated
    // by the session before start.
    fn needs_full_offer(&self) -> bool {
        true
    }

    async fn init(&self, _ctx: &BackendCtx) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(FsSession {
            shared: self.shared.clone(),
            events: self.shared.engine.subscribe(),
            channel: None,
            outbound: false,
        }))
    }
}

struct FsSession {
    shared: Arc<FsShared>,
    events: broadcast::Receiver<FsEvent>,
    channel: Option<ChannelId>,
    /// Leg where the engine generated the offer; completed on set_answer.
    outbound: bool,
}

impl FsSession {
    fn channel(&self) -> Result<&ChannelId> {
        self.channel
            .as_ref()
            .ok_or_else(|| CoreError::Fs(FsError::ChannelNotFound))
    }

    fn engine(&self) -> &Arc<dyn FsEngine> {
        &self.shared.engine
    }

    /// Dialplan target for the initial media state of a session type.
    fn dialplan_for(session_type: SessionType, ext: &TypeExt) -> Result<String> {
        match session_type {
            SessionType::Park | SessionType::Call | SessionType::Bridge => Ok("park".to_string()),
            SessionType::Echo => Ok("echo".to_string()),
            SessionType::Mcu => {
                let room = ext
                    .room_id
                    .clone()
                    .ok_or_else(|| CoreError::Fs(FsError::ConferenceError("no room_id".into())))?;
                let room_type = ext.room_type.as_deref().unwrap_or(DEFAULT_ROOM_TYPE);
                Ok(format!("conference:{room}@{room_type}"))
            }
            other => Err(CoreError::SessionError(format!(
                "fs cannot host session type {other}"
            ))),
        }
    }

    /// Type ext as it should look after the initial transfer.
    fn ext_after(session_type: SessionType, ext: &TypeExt) -> TypeExt {
        match session_type {
            SessionType::Mcu => TypeExt {
                room_id: ext.room_id.clone(),
                room_type: Some(
                    ext.room_type
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ROOM_TYPE.to_string()),
                ),
                mcu_layout: ext.mcu_layout.clone(),
                ..TypeExt::default()
            },
            _ => ext.clone(),
        }
    }

    async fn transfer(&mut self, dialplan: &str) -> Result<()> {
        let channel = self.channel()?.clone();
        debug!(channel = %channel, dialplan, "inline transfer");
        self.engine()
            .transfer_inline(&channel, dialplan)
            .await
            .map_err(|e| CoreError::Fs(FsError::TransferError(e.to_string())))?;
        if dialplan == "park" {
            self.wait_for(|kind| matches!(kind, FsEventKind::Parked), PARKED_WAIT)
                .await
                .map_err(|_| CoreError::Fs(FsError::ParkTimeout))?;
        }
        Ok(())
    }

    /// Wait for an event on our channel matching the predicate.
    async fn wait_for(
        &mut self,
        mut matches: impl FnMut(&FsEventKind) -> bool,
        within: Duration,
    ) -> std::result::Result<FsEventKind, ()> {
        let channel = self.channel.clone().ok_or(())?;
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) if event.channel == channel && matches(&event.kind) => {
                        break Some(event.kind)
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break None,
                }
            }
        };
        match timeout(within, wait).await {
            Ok(Some(kind)) => Ok(kind),
            _ => Err(()),
        }
    }

    /// Move a leg into its initial media state after negotiation.
    async fn enter_type(&mut self, session_type: SessionType, ext: &TypeExt) -> Result<TypeExt> {
        let dialplan = Self::dialplan_for(session_type, ext)?;
        self.transfer(&dialplan).await?;
        Ok(Self::ext_after(session_type, ext))
    }
}

#[async_trait]
impl BackendSession for FsSession {
    async fn start(&mut self, ctx: &BackendCtx) -> Outcome {
        match &ctx.offer {
            Some(offer) => {
                let (channel, answer) =
                    match self.engine().start_inbound(&ctx.service, offer).await {
                        Ok(started) => started,
                        Err(e) => {
                            return Outcome::err(FsError::StartError(e.to_string()));
                        }
                    };
                self.channel = Some(channel.clone());
                self.shared.register(channel, ctx.session_id.clone());

                if let Err(e) = self.enter_type(ctx.session_type, &ctx.type_ext).await {
                    return Outcome::Err(e);
                }
                Outcome::with_ops(ExtOps {
                    answer: Some(answer),
                    type_ext: Some(Self::ext_after(ctx.session_type, &ctx.type_ext)),
                    ..ExtOps::default()
                })
            }
            None => {
                let (channel, offer) = match self
                    .engine()
                    .start_outbound(&ctx.service, ctx.sdp_type)
                    .await
                {
                    Ok(started) => started,
                    Err(e) => {
                        return Outcome::err(FsError::OfferError(e.to_string()));
                    }
                };
                self.channel = Some(channel.clone());
                self.shared.register(channel, ctx.session_id.clone());
                self.outbound = true;
                Outcome::with_ops(ExtOps::offer(offer))
            }
        }
    }

    async fn set_offer(&mut self, _offer: &Sdp, _ctx: &BackendCtx) -> Outcome {
        Outcome::Pass
    }

    async fn set_answer(&mut self, answer: &Sdp, ctx: &BackendCtx) -> Outcome {
        if !self.outbound {
            return Outcome::Pass;
        }
        let channel = match self.channel() {
            Ok(c) => c.clone(),
            Err(e) => return Outcome::Err(e),
        };
        if let Err(e) = self.engine().answer_outbound(&channel, answer).await {
            return Outcome::err(FsError::AnswerError(e.to_string()));
        }
        match self.enter_type(ctx.session_type, &ctx.type_ext).await {
            Ok(ext) => Outcome::with_ops(ExtOps {
                type_ext: Some(ext),
                ..ExtOps::default()
            }),
            Err(e) => Outcome::Err(e),
        }
    }

    async fn update(&mut self, update: &UpdateKind, ctx: &BackendCtx) -> Outcome {
        match update {
            UpdateKind::SessionType { session_type, ext } => match session_type {
                SessionType::Park | SessionType::Echo | SessionType::Mcu => {
                    match self.enter_type(*session_type, ext).await {
                        Ok(new_ext) => {
                            Outcome::with_ops(ExtOps::retype(*session_type, new_ext))
                        }
                        Err(e) => Outcome::Err(e),
                    }
                }
                SessionType::Bridge => self.bridge(ext, ctx).await,
                other => Outcome::err(CoreError::SessionError(format!(
                    "fs cannot update to session type {other}"
                ))),
            },
            UpdateKind::McuLayout { layout } => {
                if ctx.session_type != SessionType::Mcu {
                    return Outcome::err(FsError::LayoutError("session is not in an mcu".into()));
                }
                let Some(room) = ctx.type_ext.room_id.clone() else {
                    return Outcome::err(FsError::LayoutError("no room_id".into()));
                };
                if let Err(e) = self.engine().conf_layout(&room, layout).await {
                    return Outcome::err(FsError::LayoutError(e.to_string()));
                }
                let ext = TypeExt {
                    mcu_layout: Some(layout.clone()),
                    ..ctx.type_ext.clone()
                };
                Outcome::with_ops(ExtOps::retype(SessionType::Mcu, ext))
            }
            UpdateKind::Media { dtmf: Some(digits), .. } => {
                let channel = match self.channel() {
                    Ok(c) => c.clone(),
                    Err(e) => return Outcome::Err(e),
                };
                match self.engine().send_dtmf(&channel, digits).await {
                    Ok(()) => Outcome::ok(),
                    Err(e) => Outcome::err(FsError::TransferError(e.to_string())),
                }
            }
            UpdateKind::Media { .. } => Outcome::ok(),
            UpdateKind::ListenSwitch { .. } => Outcome::Pass,
        }
    }

    async fn candidate(&mut self, _candidate: &Candidate, _ctx: &BackendCtx) -> Outcome {
        // Complete SDP was required up front; late candidates carry nothing
        // the engine still needs.
        Outcome::ok()
    }

    async fn engine_event(&mut self, event: EngineEvent, ctx: &BackendCtx) -> Outcome {
        match event {
            EngineEvent::Parked => {
                if ctx.session_type == SessionType::Bridge {
                    // The engine dropped us out of the bridge; fall back to
                    // park.
                    Outcome::with_ops(ExtOps::retype(SessionType::Park, TypeExt::default()))
                } else {
                    Outcome::ok()
                }
            }
            EngineEvent::Bridged { peer_session } => {
                if ctx.session_type == SessionType::Bridge {
                    Outcome::ok()
                } else {
                    // Peer leg learning it was pulled into a bridge.
                    Outcome::with_ops(ExtOps::retype(
                        SessionType::Bridge,
                        TypeExt {
                            peer_id: peer_session,
                            ..TypeExt::default()
                        },
                    ))
                }
            }
            EngineEvent::Hangup { code } => Outcome::err(FsError::Hangup(code.unwrap_or(0))),
            EngineEvent::Destroyed => Outcome::err(FsError::ChannelStop),
            _ => Outcome::Pass,
        }
    }

    async fn stop(&mut self, _reason: &StopReason, ctx: &BackendCtx) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = self.engine().hangup(&channel).await {
                debug!(channel = %channel, error = %e, "fs hangup on stop failed");
            }
        }
        self.shared.unregister(&ctx.session_id);
    }
}

impl FsSession {
    async fn bridge(&mut self, ext: &TypeExt, _ctx: &BackendCtx) -> Outcome {
        let Some(peer) = ext.peer_id.clone() else {
            return Outcome::err(FsError::BridgeError("no peer_id".into()));
        };
        let own = match self.channel() {
            Ok(c) => c.clone(),
            Err(e) => return Outcome::Err(e),
        };
        let Some(peer_channel) = self.shared.channel_of(&peer) else {
            return Outcome::err(FsError::ChannelNotFound);
        };

        if let Err(e) = self.engine().bridge(&own, &peer_channel).await {
            return Outcome::err(FsError::BridgeError(e.to_string()));
        }
        if self
            .wait_for(|kind| matches!(kind, FsEventKind::Bridged { .. }), PARKED_WAIT)
            .await
            .is_err()
        {
            return Outcome::err(FsError::BridgeError("no bridged event".into()));
        }

        Outcome::with_ops(ExtOps::retype(
            SessionType::Bridge,
            TypeExt {
                peer_id: Some(peer),
                ..TypeExt::default()
            },
        ))
    }
}
