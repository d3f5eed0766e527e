//! SIP endpoint.
//!
//! Only the contract toward the core lives here: the SIP parser and
//! transport are external collaborators that hand us typed requests with
//! opaque handles and take responses back through [`SipOutput`]. Incoming
//! INVITEs become sessions through the pluggable [`SipInviteHook`];
//! outbound INVITEs are launched by the [`SipPlugin`] on behalf of calls.

pub mod registrar;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mediahub_call_engine::{CallEngine, CallPlugin, InviteReply, Resolver};
use mediahub_infra_common::LifetimeGuard;
use mediahub_session_core::{
    error_code, CallId, CoreError, CoreEvent, CoreEventKind, Destination, DestToken,
    DialogHandle, EventSink, HubConfig, Link, LinkKey, Registration, RequestHandle, Result, Sdp,
    SdpType, ServiceId, SessionConfig, SessionId, SessionManager, SessionType, SipError,
    StopReason, TypeExt,
};

use crate::dest::{parse_sip_dest, DestSpec};

pub use registrar::Registrar;

/// Incoming REGISTER, as surfaced by the SIP stack.
#[derive(Debug, Clone)]
pub struct IncomingRegister {
    pub request: RequestHandle,
    pub from_user: String,
    pub to_domain: String,
    pub contact: String,
    pub expires_secs: u64,
}

/// Reply to a REGISTER. `to_domain` reflects forced-domain rewriting.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterReply {
    pub code: u16,
    pub to_domain: String,
}

/// Incoming INVITE, as surfaced by the SIP stack.
#[derive(Debug, Clone)]
pub struct IncomingInvite {
    pub request: RequestHandle,
    pub dialog: DialogHandle,
    pub from: String,
    /// User part of the request URI.
    pub to_user: String,
    pub to_domain: String,
    /// SDP body; empty when the INVITE had none.
    pub body: String,
}

/// Callbacks into the external SIP stack.
pub trait SipOutput: Send + Sync {
    fn ringing(&self, request: &RequestHandle);
    fn respond(&self, request: &RequestHandle, code: u16, sdp: Option<String>);
    fn bye(&self, dialog: &DialogHandle);
    /// Send an outbound INVITE; returns the transaction handle.
    fn invite(&self, uri: &str, sdp: String) -> RequestHandle;
    fn cancel_outbound(&self, request: &RequestHandle);
}

/// Hook mapping an accepted INVITE to a session. The default
/// implementation applies the SIP destination grammar.
#[async_trait]
pub trait SipInviteHook: Send + Sync {
    async fn sip_invite(
        &self,
        service: &ServiceId,
        dest: &str,
        offer: Sdp,
        link: Link,
        request: &RequestHandle,
    ) -> Result<SessionId>;
}

/// Default invite hook: `mcu*` joins the MCU room of that name on FS,
/// anything else fans out as a call.
pub struct DefaultSipInvite {
    manager: SessionManager,
}

impl DefaultSipInvite {
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl SipInviteHook for DefaultSipInvite {
    async fn sip_invite(
        &self,
        service: &ServiceId,
        dest: &str,
        offer: Sdp,
        link: Link,
        _request: &RequestHandle,
    ) -> Result<SessionId> {
        let config = match parse_sip_dest(dest) {
            DestSpec::Mcu { room } => SessionConfig::new(service.clone(), SessionType::Mcu)
                .with_backend(mediahub_session_core::BackendId::fs())
                .with_offer(offer)
                .with_ext(TypeExt {
                    room_id: Some(room),
                    ..TypeExt::default()
                })
                .with_register(Registration::new(link)),
            DestSpec::Call { callee } => SessionConfig::new(service.clone(), SessionType::Call)
                .with_offer(offer)
                .with_ext(TypeExt {
                    dest: Some(callee),
                    ..TypeExt::default()
                })
                .with_register(Registration::new(link)),
            // The reduced SIP grammar never produces the other forms.
            _ => return Err(CoreError::Sip(SipError::InviteRejected)),
        };
        let started = self.manager.start_session(config).await?;
        Ok(started.id)
    }
}

struct InDialog {
    session: SessionId,
    dialog: DialogHandle,
    _guard: LifetimeGuard,
}

struct OutboundLeg {
    call: CallId,
    key: LinkKey,
    _guard: LifetimeGuard,
}

struct SipShared {
    service: ServiceId,
    config: HubConfig,
    manager: SessionManager,
    calls: CallEngine,
    output: Arc<dyn SipOutput>,
    hook: Arc<dyn SipInviteHook>,
    registrar: Registrar,
    by_request: DashMap<RequestHandle, InDialog>,
    by_dialog: DashMap<DialogHandle, RequestHandle>,
    outbound: DashMap<RequestHandle, OutboundLeg>,
}

/// The SIP endpoint adapter.
#[derive(Clone)]
pub struct SipAdapter {
    shared: Arc<SipShared>,
}

impl SipAdapter {
    pub fn new(
        service: ServiceId,
        manager: SessionManager,
        calls: CallEngine,
        output: Arc<dyn SipOutput>,
        hook: Arc<dyn SipInviteHook>,
    ) -> Self {
        let config = manager.config().clone();
        Self {
            shared: Arc::new(SipShared {
                service,
                config,
                manager,
                calls,
                output,
                hook,
                registrar: Registrar::new(),
                by_request: DashMap::new(),
                by_dialog: DashMap::new(),
                outbound: DashMap::new(),
            }),
        }
    }

    pub fn registrar(&self) -> &Registrar {
        &self.shared.registrar
    }

    /// Plugin launching outbound SIP legs for calls. Register it on the
    /// call engine.
    pub fn plugin(&self) -> Arc<SipPlugin> {
        Arc::new(SipPlugin {
            shared: self.shared.clone(),
        })
    }

    /// Resolver expanding registered users and `sip:` URIs. Register it on
    /// the call engine.
    pub fn resolver(&self) -> Arc<SipResolver> {
        Arc::new(SipResolver {
            shared: self.shared.clone(),
        })
    }

    /// Handle an incoming REGISTER.
    pub fn on_register(&self, register: IncomingRegister) -> RegisterReply {
        let shared = &self.shared;
        if !shared.config.sip_registrar {
            let (code, text) = error_code(&CoreError::Sip(SipError::RegistrarDisabled));
            debug!(code, text, "register refused");
            return RegisterReply {
                code: 403,
                to_domain: register.to_domain,
            };
        }

        let mut domain = register.to_domain.clone();
        if let Some(configured) = &shared.config.sip_domain {
            if shared.config.sip_registrar_force_domain {
                domain = configured.clone();
            } else if &domain != configured {
                let (code, text) =
                    error_code(&CoreError::Sip(SipError::DomainNotAllowed(domain.clone())));
                debug!(code, text, "register refused");
                return RegisterReply {
                    code: 403,
                    to_domain: domain,
                };
            }
        }

        let aor = format!("{}@{}", register.from_user, domain);
        shared
            .registrar
            .register(&aor, &register.contact, register.expires_secs);
        RegisterReply {
            code: 200,
            to_domain: domain,
        }
    }

    /// Handle an incoming INVITE. Responses go out through [`SipOutput`].
    pub async fn on_invite(&self, invite: IncomingInvite) {
        let shared = &self.shared;
        if invite.body.is_empty() {
            let (code, text) = error_code(&CoreError::Sip(SipError::NoSdp));
            warn!(code, text, "invite without sdp");
            shared.output.respond(&invite.request, 488, None);
            return;
        }
        if !shared.config.sip_invite_not_registered {
            let aor = format!("{}@{}", invite.to_user, invite.to_domain);
            if !shared.registrar.is_registered(&aor)
                && !matches!(parse_sip_dest(&invite.to_user), DestSpec::Mcu { .. })
            {
                shared.output.respond(&invite.request, 404, None);
                return;
            }
        }

        let offer = Sdp::rtp(invite.body.clone());
        let guard = LifetimeGuard::new();
        let (sink, events) = EventSink::channel();
        let link = Link::SipIn {
            request: invite.request.clone(),
            dialog: invite.dialog.clone(),
            lifetime: guard.watcher(),
            sink,
        };

        // Event pump: core lifecycle → wire responses.
        tokio::spawn(pump_in_dialog(
            shared.output.clone(),
            invite.request.clone(),
            invite.dialog.clone(),
            events,
        ));

        match shared
            .hook
            .sip_invite(
                &shared.service,
                &invite.to_user,
                offer,
                link,
                &invite.request,
            )
            .await
        {
            Ok(session) => {
                info!(session_id = %session, request = %invite.request, "sip invite accepted");
                shared.by_dialog.insert(invite.dialog.clone(), invite.request.clone());
                shared.by_request.insert(
                    invite.request,
                    InDialog {
                        session,
                        dialog: invite.dialog,
                        _guard: guard,
                    },
                );
            }
            Err(e) => {
                let code = match e {
                    CoreError::UserNotFound(_) | CoreError::NoDestination => 404,
                    CoreError::Sip(_) => 403,
                    _ => 500,
                };
                let (num, text) = error_code(&e);
                warn!(code, num, text, "sip invite rejected");
                shared.output.respond(&invite.request, code, None);
            }
        }
    }

    /// CANCEL correlates by transaction.
    pub fn on_cancel(&self, request: &RequestHandle) {
        if let Some((_, entry)) = self.shared.by_request.remove(request) {
            self.shared.by_dialog.remove(&entry.dialog);
            if let Some(handle) = self.shared.manager.session(&entry.session) {
                handle.stop(StopReason::SipCancel);
            }
        }
    }

    /// BYE correlates by dialog.
    pub fn on_bye(&self, dialog: &DialogHandle) {
        if let Some((_, request)) = self.shared.by_dialog.remove(dialog) {
            if let Some((_, entry)) = self.shared.by_request.remove(&request) {
                if let Some(handle) = self.shared.manager.session(&entry.session) {
                    handle.stop(StopReason::SipBye);
                }
            }
        }
    }

    /// reINVITE renegotiation is refused.
    pub fn on_reinvite(&self, request: &RequestHandle) {
        self.shared.output.respond(request, 603, None);
    }

    /// Response to an outbound INVITE this adapter launched.
    pub async fn on_outbound_response(
        &self,
        request: &RequestHandle,
        code: u16,
        sdp: Option<String>,
    ) {
        let Some(leg) = self.shared.outbound.get(request).map(|l| {
            (l.call.clone(), l.key.clone())
        }) else {
            return;
        };
        let (call_id, key) = leg;
        let Some(call) = self.shared.calls.call(&call_id) else {
            self.shared.outbound.remove(request);
            return;
        };
        match code {
            180 | 183 => {
                let _ = call.ringing(key, None).await;
            }
            200..=299 => {
                let answer = Sdp::rtp(sdp.unwrap_or_default());
                if let Err(e) = call.answered(key, answer).await {
                    debug!(request = %request, error = %e, "late sip answer");
                }
                self.shared.outbound.remove(request);
            }
            300.. => {
                let _ = call.rejected(key).await;
                self.shared.outbound.remove(request);
            }
            _ => {}
        }
    }
}

async fn pump_in_dialog(
    output: Arc<dyn SipOutput>,
    request: RequestHandle,
    dialog: DialogHandle,
    mut events: mpsc::UnboundedReceiver<CoreEvent>,
) {
    let mut answered = false;
    while let Some(event) = events.recv().await {
        match event.kind {
            CoreEventKind::Ringing { .. } => output.ringing(&request),
            CoreEventKind::Answer { answer, .. } => {
                if !answered {
                    answered = true;
                    output.respond(&request, 200, answer.map(|a| a.sdp));
                }
            }
            CoreEventKind::Stop { .. } | CoreEventKind::Hangup { .. } => {
                if answered {
                    output.bye(&dialog);
                } else {
                    output.respond(&request, 487, None);
                }
                break;
            }
            _ => {}
        }
    }
}

/// Outbound-leg plugin for `sip:` destinations.
pub struct SipPlugin {
    shared: Arc<SipShared>,
}

#[async_trait]
impl CallPlugin for SipPlugin {
    async fn invite(
        &self,
        call_id: &CallId,
        dest: &Destination,
        offer: Option<&Sdp>,
        _meta: &Value,
    ) -> InviteReply {
        let DestToken::Sip { uri } = &dest.dest else {
            return InviteReply::Pass;
        };
        let Some(offer) = offer else {
            // No shared offer, nothing to put on the wire.
            return InviteReply::Remove;
        };

        let request = self.shared.output.invite(uri, offer.sdp.clone());
        debug!(call_id = %call_id, uri, request = %request, "outbound sip invite");
        let guard = LifetimeGuard::new();
        let (sink, _events) = EventSink::channel();
        let link = Link::SipOut {
            dest: uri.clone(),
            lifetime: guard.watcher(),
            sink,
        };
        self.shared.outbound.insert(
            request,
            OutboundLeg {
                call: call_id.clone(),
                key: link.key(),
                _guard: guard,
            },
        );
        InviteReply::Ok { link }
    }

    async fn cancel(&self, call_id: &CallId, link: &Link) {
        let Link::SipOut { dest, .. } = link else {
            return;
        };
        let key = link.key();
        let request = self.shared.outbound.iter().find_map(|entry| {
            (entry.call == *call_id && entry.key == key).then(|| entry.key().clone())
        });
        if let Some(request) = request {
            debug!(call_id = %call_id, dest, request = %request, "cancelling outbound sip invite");
            self.shared.output.cancel_outbound(&request);
            self.shared.outbound.remove(&request);
        }
    }
}

/// Resolver for SIP destinations: explicit `sip:` URIs and registered
/// users.
pub struct SipResolver {
    shared: Arc<SipShared>,
}

#[async_trait]
impl Resolver for SipResolver {
    async fn resolve(&self, _service: &ServiceId, callee: &str) -> Vec<Destination> {
        if callee.starts_with("sip:") || callee.starts_with("sips:") {
            let mut dest = Destination::new(DestToken::Sip {
                uri: callee.to_string(),
            });
            dest.sdp_type = Some(SdpType::Rtp);
            return vec![dest];
        }
        // A bare user resolves through the registrar within the configured
        // domain, or any domain the user registered under.
        let contact = self.shared.registrar.lookup(callee).or_else(|| {
            self.shared
                .config
                .sip_domain
                .as_ref()
                .and_then(|domain| self.shared.registrar.lookup(&format!("{callee}@{domain}")))
        });
        match contact {
            Some(contact) => {
                let mut dest = Destination::new(DestToken::Sip { uri: contact });
                dest.sdp_type = Some(SdpType::Rtp);
                vec![dest]
            }
            None => Vec::new(),
        }
    }
}
