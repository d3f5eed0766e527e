//! # Call Engine
//!
//! The call layer of mediahub: a call is a multi-leg invite coordinator
//! that resolves a callee to destinations through the resolver chain, fans
//! out invites through the plugin chain with per-destination ring timers,
//! applies first-answer-wins, and cancels the losers.
//!
//! The engine shares the session layer's observer fabric and event bus and
//! installs itself as the session layer's call launcher.

pub mod call;
pub mod engine;
pub mod invite;
pub mod resolver;

pub use call::{CallCmd, CallHandle, CallInfo, CallPhase};
pub use engine::{CallConfig, CallEngine, StartedCall};
pub use invite::{CallPlugin, InviteReply, PluginChain, DEF_RING, MAX_RING};
pub use resolver::{Resolver, ResolverChain};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
