//! # KMS Backend
//!
//! Adapter for the KMS WebRTC media engine: echo, SFU publish/listen, and
//! neutral parked endpoints, with fully asynchronous offer/answer and
//! bidirectional trickle ICE. The engine RPC itself is behind the
//! [`KmsEngine`] trait; tests and embedders supply the implementation.

pub mod adapter;
pub mod engine;

pub use adapter::KmsBackend;
pub use engine::{EndpointId, KmsEngine, KmsEvent, KmsEventKind};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
