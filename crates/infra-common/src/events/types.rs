//! Event envelope and topic types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Object class of a broadcast topic (the "subclass" of the wire frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjClass {
    Session,
    Call,
    Room,
}

impl std::fmt::Display for ObjClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjClass::Session => write!(f, "session"),
            ObjClass::Call => write!(f, "call"),
            ObjClass::Room => write!(f, "room"),
        }
    }
}

/// Broadcast topic key: (service, class, subclass, instance).
///
/// `obj_id: None` subscribes to every instance of the subclass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub service: String,
    pub class: String,
    pub subclass: ObjClass,
    pub obj_id: Option<String>,
}

impl Topic {
    pub fn new(service: impl Into<String>, class: impl Into<String>, subclass: ObjClass) -> Self {
        Self {
            service: service.into(),
            class: class.into(),
            subclass,
            obj_id: None,
        }
    }

    pub fn instance(mut self, obj_id: impl Into<String>) -> Self {
        self.obj_id = Some(obj_id.into());
        self
    }
}

/// One event as delivered on the broadcast bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub service: String,
    pub class: String,
    pub subclass: ObjClass,
    /// Event tag: `ringing`, `answer`, `hangup`, `stop`, `updated_type`,
    /// `candidate`, room membership events, …
    #[serde(rename = "type")]
    pub event_type: String,
    pub obj_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventFrame {
    pub fn new(
        service: impl Into<String>,
        class: impl Into<String>,
        subclass: ObjClass,
        event_type: impl Into<String>,
        obj_id: impl Into<String>,
        body: Value,
    ) -> Self {
        Self {
            service: service.into(),
            class: class.into(),
            subclass,
            event_type: event_type.into(),
            obj_id: obj_id.into(),
            body,
            timestamp: Utc::now(),
        }
    }

    /// Topic this frame is published under (instance form).
    pub fn topic(&self) -> Topic {
        Topic {
            service: self.service.clone(),
            class: self.class.clone(),
            subclass: self.subclass,
            obj_id: Some(self.obj_id.clone()),
        }
    }
}
