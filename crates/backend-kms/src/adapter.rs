//! KMS backend adapter.
//!
//! Everything is asynchronous: the answer comes back from `process_offer`,
//! but the endpoint only accepts candidates once the engine signals
//! readiness. Client candidates submitted before that are buffered and
//! flushed in arrival order; end-of-candidates is idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use mediahub_session_core::backend::{
    BackendCtx, BackendFactory, BackendSession, EngineEvent, ExtOps, Outcome, SessionEventRouter,
};
use mediahub_session_core::{
    BackendId, Candidate, CoreError, IceCandidate, KmsError, Result, Sdp, SessionId, SessionType,
    StopReason, TypeExt, UpdateKind,
};

use crate::engine::{EndpointId, KmsEngine, KmsEvent, KmsEventKind};

struct KmsShared {
    engine: Arc<dyn KmsEngine>,
    endpoints: DashMap<EndpointId, SessionId>,
    by_session: DashMap<SessionId, EndpointId>,
}

impl KmsShared {
    fn register(&self, endpoint: EndpointId, session: SessionId) {
        self.endpoints.insert(endpoint.clone(), session.clone());
        self.by_session.insert(session, endpoint);
    }

    fn unregister(&self, session: &SessionId) {
        if let Some((_, endpoint)) = self.by_session.remove(session) {
            self.endpoints.remove(&endpoint);
        }
    }

    fn endpoint_of(&self, session: &SessionId) -> Option<EndpointId> {
        self.by_session.get(session).map(|e| e.clone())
    }
}

/// Factory for the KMS backend.
pub struct KmsBackend {
    shared: Arc<KmsShared>,
}

impl KmsBackend {
    /// Build against an engine handle. Spawns the event router that
    /// translates engine notifications into session-bound events.
    pub fn new(engine: Arc<dyn KmsEngine>, router: Arc<dyn SessionEventRouter>) -> Self {
        let shared = Arc::new(KmsShared {
            engine: engine.clone(),
            endpoints: DashMap::new(),
            by_session: DashMap::new(),
        });

        let events = engine.subscribe();
        tokio::spawn(route_events(events, shared.clone(), router));

        Self { shared }
    }
}

async fn route_events(
    mut events: broadcast::Receiver<KmsEvent>,
    shared: Arc<KmsShared>,
    router: Arc<dyn SessionEventRouter>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "kms event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(session) = shared
            .endpoints
            .get(&event.endpoint)
            .map(|s| s.clone())
        else {
            continue;
        };
        let translated = match event.kind {
            KmsEventKind::Ready => EngineEvent::EndpointReady,
            KmsEventKind::IceCandidate { candidate } => EngineEvent::Candidate {
                candidate: Candidate::Item(candidate),
            },
            KmsEventKind::GatheringDone => EngineEvent::Candidate {
                candidate: Candidate::End,
            },
            KmsEventKind::Error { detail } => {
                warn!(session_id = %session, detail = %detail, "kms endpoint error");
                EngineEvent::Hangup { code: None }
            }
            KmsEventKind::Disconnected => EngineEvent::Destroyed,
        };
        router.route(&session, translated);
    }
}

#[async_trait]
impl BackendFactory for KmsBackend {
    fn id(&self) -> BackendId {
        BackendId::kms()
    }

    fn supports(&self, session_type: SessionType) -> bool {
        matches!(
            session_type,
            SessionType::Park
                | SessionType::Echo
                | SessionType::Proxy
                | SessionType::Publish
                | SessionType::Listen
        )
    }

    async fn init(&self, _ctx: &BackendCtx) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(KmsSession {
            shared: self.shared.clone(),
            endpoint: None,
            endpoint_ready: false,
            pending: Vec::new(),
            end_seen: false,
            end_forwarded: false,
        }))
    }
}

struct KmsSession {
    shared: Arc<KmsShared>,
    endpoint: Option<EndpointId>,
    /// Set by the engine's Ready event; gates candidate forwarding.
    endpoint_ready: bool,
    /// Client candidates buffered until the endpoint is ready.
    pending: Vec<IceCandidate>,
    end_seen: bool,
    end_forwarded: bool,
}

impl KmsSession {
    fn endpoint(&self) -> Result<&EndpointId> {
        self.endpoint
            .as_ref()
            .ok_or_else(|| CoreError::Kms(KmsError::EndpointError("no endpoint".into())))
    }

    fn engine(&self) -> &Arc<dyn KmsEngine> {
        &self.shared.engine
    }

    /// Media wiring for the session type, once SDP negotiation is done.
    async fn connect_for_type(&self, ctx: &BackendCtx) -> Result<()> {
        let endpoint = self.endpoint()?;
        match ctx.session_type {
            SessionType::Echo => self
                .engine()
                .connect(endpoint, endpoint)
                .await
                .map_err(|e| CoreError::Kms(KmsError::ConnectError(e.to_string()))),
            SessionType::Listen => {
                let publisher = ctx
                    .type_ext
                    .publisher_id
                    .clone()
                    .ok_or_else(|| CoreError::Kms(KmsError::RoomError("no publisher_id".into())))?;
                let publisher_ep = self
                    .shared
                    .endpoint_of(&publisher)
                    .ok_or(CoreError::Kms(KmsError::PublisherNotFound(publisher)))?;
                self.engine()
                    .connect(&publisher_ep, endpoint)
                    .await
                    .map_err(|e| CoreError::Kms(KmsError::ConnectError(e.to_string())))
            }
            // Park, proxy, and publish legs carry no extra wiring here;
            // listeners connect to publishers on their own.
            _ => Ok(()),
        }
    }

    async fn flush_pending(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let pending: Vec<IceCandidate> = self.pending.drain(..).collect();
        for candidate in pending {
            if let Err(e) = self.engine().add_candidate(&endpoint, &candidate).await {
                debug!(endpoint = %endpoint, error = %e, "buffered candidate dropped");
            }
        }
        if self.end_seen && !self.end_forwarded {
            self.end_forwarded = true;
            if let Err(e) = self.engine().end_of_candidates(&endpoint).await {
                debug!(endpoint = %endpoint, error = %e, "end-of-candidates dropped");
            }
        }
    }
}

#[async_trait]
impl BackendSession for KmsSession {
    async fn start(&mut self, ctx: &BackendCtx) -> Outcome {
        let endpoint = match self.engine().create_endpoint(&ctx.service).await {
            Ok(ep) => ep,
            Err(e) => return Outcome::err(KmsError::EndpointError(e.to_string())),
        };
        self.endpoint = Some(endpoint.clone());
        self.shared.register(endpoint.clone(), ctx.session_id.clone());

        let ops = match &ctx.offer {
            Some(offer) => {
                let answer = match self.engine().process_offer(&endpoint, offer).await {
                    Ok(answer) => answer,
                    Err(e) => return Outcome::err(KmsError::AnswerError(e.to_string())),
                };
                if let Err(e) = self.connect_for_type(ctx).await {
                    return Outcome::Err(e);
                }
                ExtOps::answer(answer)
            }
            None => {
                let offer = match self.engine().generate_offer(&endpoint).await {
                    Ok(offer) => offer,
                    Err(e) => return Outcome::err(KmsError::OfferError(e.to_string())),
                };
                ExtOps::offer(offer)
            }
        };

        if let Err(e) = self.engine().gather_candidates(&endpoint).await {
            return Outcome::err(KmsError::IceError(e.to_string()));
        }
        Outcome::with_ops(ops)
    }

    async fn set_offer(&mut self, offer: &Sdp, ctx: &BackendCtx) -> Outcome {
        let endpoint = match self.endpoint() {
            Ok(ep) => ep.clone(),
            Err(e) => return Outcome::Err(e),
        };
        match self.engine().process_offer(&endpoint, offer).await {
            Ok(answer) => {
                if let Err(e) = self.connect_for_type(ctx).await {
                    return Outcome::Err(e);
                }
                Outcome::with_ops(ExtOps::answer(answer))
            }
            Err(e) => Outcome::err(KmsError::AnswerError(e.to_string())),
        }
    }

    async fn set_answer(&mut self, answer: &Sdp, ctx: &BackendCtx) -> Outcome {
        let endpoint = match self.endpoint() {
            Ok(ep) => ep.clone(),
            Err(e) => return Outcome::Err(e),
        };
        if let Err(e) = self.engine().process_answer(&endpoint, answer).await {
            return Outcome::err(KmsError::AnswerError(e.to_string()));
        }
        if let Err(e) = self.connect_for_type(ctx).await {
            return Outcome::Err(e);
        }
        Outcome::ok()
    }

    async fn update(&mut self, update: &UpdateKind, ctx: &BackendCtx) -> Outcome {
        match update {
            UpdateKind::SessionType { session_type, ext } => match session_type {
                SessionType::Park => {
                    let endpoint = match self.endpoint() {
                        Ok(ep) => ep.clone(),
                        Err(e) => return Outcome::Err(e),
                    };
                    if let Err(e) = self.engine().disconnect_all(&endpoint).await {
                        return Outcome::err(KmsError::ConnectError(e.to_string()));
                    }
                    Outcome::with_ops(ExtOps::retype(SessionType::Park, TypeExt::default()))
                }
                SessionType::Echo => {
                    let endpoint = match self.endpoint() {
                        Ok(ep) => ep.clone(),
                        Err(e) => return Outcome::Err(e),
                    };
                    if let Err(e) = self.engine().connect(&endpoint, &endpoint).await {
                        return Outcome::err(KmsError::ConnectError(e.to_string()));
                    }
                    Outcome::with_ops(ExtOps::retype(SessionType::Echo, ext.clone()))
                }
                _ => Outcome::Pass,
            },
            UpdateKind::ListenSwitch { publisher_id } => {
                if ctx.session_type != SessionType::Listen {
                    return Outcome::err(KmsError::RoomError("session is not a listener".into()));
                }
                let endpoint = match self.endpoint() {
                    Ok(ep) => ep.clone(),
                    Err(e) => return Outcome::Err(e),
                };
                let Some(publisher_ep) = self.shared.endpoint_of(publisher_id) else {
                    return Outcome::err(KmsError::PublisherNotFound(publisher_id.clone()));
                };
                if let Err(e) = self.engine().disconnect_all(&endpoint).await {
                    return Outcome::err(KmsError::ConnectError(e.to_string()));
                }
                if let Err(e) = self.engine().connect(&publisher_ep, &endpoint).await {
                    return Outcome::err(KmsError::ConnectError(e.to_string()));
                }
                let ext = TypeExt {
                    publisher_id: Some(publisher_id.clone()),
                    ..ctx.type_ext.clone()
                };
                Outcome::with_ops(ExtOps::retype(SessionType::Listen, ext))
            }
            UpdateKind::Media { .. } => Outcome::ok(),
            UpdateKind::McuLayout { .. } => Outcome::Pass,
        }
    }

    async fn candidate(&mut self, candidate: &Candidate, _ctx: &BackendCtx) -> Outcome {
        match candidate {
            Candidate::Item(item) => {
                if !self.endpoint_ready {
                    self.pending.push(item.clone());
                    return Outcome::ok();
                }
                let endpoint = match self.endpoint() {
                    Ok(ep) => ep.clone(),
                    Err(e) => return Outcome::Err(e),
                };
                match self.engine().add_candidate(&endpoint, item).await {
                    Ok(()) => Outcome::ok(),
                    Err(e) => Outcome::err(KmsError::CandidateError(e.to_string())),
                }
            }
            Candidate::End => {
                if self.end_seen {
                    return Outcome::ok();
                }
                self.end_seen = true;
                if !self.endpoint_ready {
                    return Outcome::ok();
                }
                self.end_forwarded = true;
                let endpoint = match self.endpoint() {
                    Ok(ep) => ep.clone(),
                    Err(e) => return Outcome::Err(e),
                };
                match self.engine().end_of_candidates(&endpoint).await {
                    Ok(()) => Outcome::ok(),
                    Err(e) => Outcome::err(KmsError::CandidateError(e.to_string())),
                }
            }
        }
    }

    async fn engine_event(&mut self, event: EngineEvent, _ctx: &BackendCtx) -> Outcome {
        match event {
            EngineEvent::EndpointReady => {
                self.endpoint_ready = true;
                self.flush_pending().await;
                Outcome::ok()
            }
            EngineEvent::Destroyed => Outcome::err(KmsError::Disconnected),
            // Gathered candidates and end-of-gathering pass through to the
            // client via the session's observers.
            _ => Outcome::Pass,
        }
    }

    async fn stop(&mut self, _reason: &StopReason, ctx: &BackendCtx) {
        if let Some(endpoint) = self.endpoint.take() {
            if let Err(e) = self.engine().release(&endpoint).await {
                debug!(endpoint = %endpoint, error = %e, "kms release on stop failed");
            }
        }
        self.shared.unregister(&ctx.session_id);
    }
}
