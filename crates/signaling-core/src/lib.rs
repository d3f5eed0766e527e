//! # Signaling Core
//!
//! The three signaling endpoints of mediahub, to the extent of the
//! contract they present to the core:
//!
//! - **SIP**: registrar with realm policy, INVITE → session through a
//!   pluggable hook, CANCEL/BYE correlation, outbound legs for calls.
//! - **Verto**: JSON-RPC 2.0 over WebSocket for WebRTC clients, with a
//!   login hook and answer-async signaling.
//! - **External API**: `{class, subclass, cmd, data, tid}` command frames
//!   over any transport, with auto-subscription to lifecycle topics.
//!
//! The wire transports themselves (SIP parser, WebSocket listeners) are
//! external collaborators; each adapter exposes typed ingress methods and
//! an outbound mailbox.

pub mod api;
pub mod dest;
pub mod sip;
pub mod verto;

pub use api::{ApiAdapter, ApiConn, ApiPlugin};
pub use dest::{parse_dest, parse_sip_dest, DestSpec};
pub use sip::{
    DefaultSipInvite, IncomingInvite, IncomingRegister, RegisterReply, Registrar, SipAdapter,
    SipInviteHook, SipOutput, SipPlugin, SipResolver,
};
pub use verto::{
    AllowAllLogin, VertoAdapter, VertoConn, VertoLoginHook, VertoPlugin, VertoResolver,
    VERTO_IDLE_TIMEOUT,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
