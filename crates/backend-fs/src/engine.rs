//! FS engine contract.
//!
//! The low-level RPC to the conferencing engine is out of scope; this trait
//! is what the adapter invokes. Leg creation is profile-aware: webrtc legs
//! go through the engine's Verto profile, rtp legs through its SIP profile,
//! selected by the SDP type of the leg.

use async_trait::async_trait;
use tokio::sync::broadcast;

use mediahub_session_core::{Result, RoomId, Sdp, SdpType, ServiceId};

/// Engine-side channel identifier of one leg.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ChannelId(pub String);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asynchronous engine notification about one channel.
#[derive(Debug, Clone)]
pub struct FsEvent {
    pub channel: ChannelId,
    pub kind: FsEventKind,
}

#[derive(Debug, Clone)]
pub enum FsEventKind {
    /// Channel reached the neutral parked state.
    Parked,
    /// Channel was bridged to another channel.
    Bridged { peer: ChannelId },
    /// Channel hung up with the given cause code.
    Hangup { code: Option<u16> },
    /// Channel destroyed.
    Destroyed,
    /// Conference composition info.
    ConferenceInfo { body: serde_json::Value },
}

/// Operations the adapter needs from the engine.
#[async_trait]
pub trait FsEngine: Send + Sync {
    /// Create an inbound leg from a client offer; returns the channel and
    /// the engine's answer. The profile is chosen by `offer.sdp_type`.
    async fn start_inbound(&self, service: &ServiceId, offer: &Sdp) -> Result<(ChannelId, Sdp)>;

    /// Create an outbound leg; the engine generates the offer.
    async fn start_outbound(
        &self,
        service: &ServiceId,
        sdp_type: SdpType,
    ) -> Result<(ChannelId, Sdp)>;

    /// Complete an outbound leg with the remote answer.
    async fn answer_outbound(&self, channel: &ChannelId, answer: &Sdp) -> Result<()>;

    /// Dialplan-inline transfer: `"park"`, `"echo"`, or
    /// `"conference:ROOM@TYPE"`.
    async fn transfer_inline(&self, channel: &ChannelId, dialplan: &str) -> Result<()>;

    /// Bridge two parked channels.
    async fn bridge(&self, a: &ChannelId, b: &ChannelId) -> Result<()>;

    /// Online layout command against a running conference.
    async fn conf_layout(&self, room: &RoomId, layout: &str) -> Result<()>;

    /// Send DTMF digits down a channel.
    async fn send_dtmf(&self, channel: &ChannelId, digits: &str) -> Result<()>;

    /// Hang a channel up.
    async fn hangup(&self, channel: &ChannelId) -> Result<()>;

    /// Event stream for all channels of this engine.
    fn subscribe(&self) -> broadcast::Receiver<FsEvent>;
}
