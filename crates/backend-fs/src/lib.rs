//! # FS Backend
//!
//! Adapter for the FS conferencing engine: park, echo, MCU rooms, and
//! channel bridging, driven through dialplan-inline transfers. The engine
//! RPC itself is behind the [`FsEngine`] trait; tests and embedders supply
//! the implementation.

pub mod adapter;
pub mod engine;

pub use adapter::FsBackend;
pub use engine::{ChannelId, FsEngine, FsEvent, FsEventKind};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
