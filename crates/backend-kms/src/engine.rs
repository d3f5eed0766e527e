//! KMS engine contract.
//!
//! The engine is fully asynchronous: offers and answers can be produced at
//! any time and ICE candidates stream in both directions. The RPC itself is
//! out of scope; this trait is what the adapter invokes.

use async_trait::async_trait;
use tokio::sync::broadcast;

use mediahub_session_core::{IceCandidate, Result, Sdp, ServiceId};

/// Engine-side endpoint identifier of one leg.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct EndpointId(pub String);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asynchronous engine notification about one endpoint.
#[derive(Debug, Clone)]
pub struct KmsEvent {
    pub endpoint: EndpointId,
    pub kind: KmsEventKind,
}

#[derive(Debug, Clone)]
pub enum KmsEventKind {
    /// Endpoint is ready to take client candidates.
    Ready,
    /// Engine-gathered candidate for the client.
    IceCandidate { candidate: IceCandidate },
    /// Engine finished gathering candidates.
    GatheringDone,
    /// Endpoint failed on the engine side.
    Error { detail: String },
    /// Engine connection lost.
    Disconnected,
}

/// Operations the adapter needs from the engine.
#[async_trait]
pub trait KmsEngine: Send + Sync {
    async fn create_endpoint(&self, service: &ServiceId) -> Result<EndpointId>;

    /// Process a client offer, returning the engine's answer.
    async fn process_offer(&self, endpoint: &EndpointId, offer: &Sdp) -> Result<Sdp>;

    /// Generate an offer for a leg where the engine is the offerer.
    async fn generate_offer(&self, endpoint: &EndpointId) -> Result<Sdp>;

    /// Complete an engine-offered leg with the remote answer.
    async fn process_answer(&self, endpoint: &EndpointId, answer: &Sdp) -> Result<()>;

    /// Start ICE gathering; gathered candidates arrive as events.
    async fn gather_candidates(&self, endpoint: &EndpointId) -> Result<()>;

    async fn add_candidate(&self, endpoint: &EndpointId, candidate: &IceCandidate) -> Result<()>;

    async fn end_of_candidates(&self, endpoint: &EndpointId) -> Result<()>;

    /// Connect media from one endpoint to another. Echo is a self-loop.
    async fn connect(&self, from: &EndpointId, to: &EndpointId) -> Result<()>;

    /// Tear down every media connection of an endpoint.
    async fn disconnect_all(&self, endpoint: &EndpointId) -> Result<()>;

    async fn release(&self, endpoint: &EndpointId) -> Result<()>;

    /// Event stream for all endpoints of this engine.
    fn subscribe(&self) -> broadcast::Receiver<KmsEvent>;
}
