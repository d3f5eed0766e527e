//! # Infra Common
//!
//! Shared infrastructure for the mediahub workspace:
//!
//! - Lifetime tokens: guard/watcher pairs for observer liveness
//! - Observer fabric: the process-wide registry of interest
//! - Event bus: topic broadcast of lifecycle events

pub mod events;
pub mod lifetime;
pub mod registry;

pub use events::{EventBus, EventFrame, ObjClass, SubscriptionId, Topic};
pub use lifetime::{Lifetime, LifetimeGuard, LifetimeId};
pub use registry::{ObserverEntry, ObserverFabric};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
