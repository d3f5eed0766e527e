//! Event bus: typed envelopes fanned out over broadcast topics.

pub mod bus;
pub mod types;

pub use bus::{EventBus, SubscriptionId};
pub use types::{EventFrame, ObjClass, Topic};
