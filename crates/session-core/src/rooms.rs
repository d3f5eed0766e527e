//! Room registry.
//!
//! Rooms back the MCU and publish/listen session types and the external
//! API's `room.*` commands. A room is created explicitly through the API or
//! implicitly when the first member joins; implicitly created rooms are
//! destroyed when their last member leaves.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use mediahub_infra_common::{EventBus, EventFrame, ObjClass};

use crate::errors::{CoreError, Result};
use crate::types::{BackendId, RoomId, ServiceId, SessionId};

/// How a member participates in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomRole {
    /// MCU participant (mixed in and out).
    Member,
    /// SFU publisher.
    Publisher,
    /// SFU listener of one publisher.
    Listener,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub service: ServiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    pub members: Vec<(SessionId, RoomRole)>,
    pub created_at: SystemTime,
}

#[derive(Debug)]
struct Room {
    info: RoomInfo,
    auto_created: bool,
}

/// Process-wide registry of rooms.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<RoomId, Room>>,
    bus: Arc<EventBus>,
}

impl RoomRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            bus,
        }
    }

    /// Explicit creation; fails if the room already exists.
    pub fn create(
        &self,
        service: &ServiceId,
        room_id: Option<RoomId>,
        room_type: Option<String>,
        backend: Option<BackendId>,
    ) -> Result<RoomId> {
        let room_id = room_id.unwrap_or_default();
        if self.rooms.contains_key(&room_id) {
            return Err(CoreError::RoomAlreadyExists(room_id));
        }
        self.insert(service, room_id.clone(), room_type, backend, false);
        Ok(room_id)
    }

    /// Get-or-create used by sessions joining a room.
    pub fn ensure(
        &self,
        service: &ServiceId,
        room_id: &RoomId,
        room_type: Option<String>,
        backend: Option<BackendId>,
    ) {
        if !self.rooms.contains_key(room_id) {
            self.insert(service, room_id.clone(), room_type, backend, true);
        }
    }

    fn insert(
        &self,
        service: &ServiceId,
        room_id: RoomId,
        room_type: Option<String>,
        backend: Option<BackendId>,
        auto_created: bool,
    ) {
        info!(room_id = %room_id, service = %service, auto = auto_created, "room created");
        let info = RoomInfo {
            room_id: room_id.clone(),
            service: service.clone(),
            backend,
            room_type,
            members: Vec::new(),
            created_at: SystemTime::now(),
        };
        self.rooms.insert(room_id.clone(), Room { info, auto_created });
        self.publish(service, &room_id, "room_created", serde_json::Value::Null);
    }

    pub fn destroy(&self, room_id: &RoomId) -> Result<()> {
        let (_, room) = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| CoreError::RoomNotFound(room_id.clone()))?;
        info!(room_id = %room_id, "room destroyed");
        self.publish(
            &room.info.service,
            room_id,
            "room_destroyed",
            serde_json::Value::Null,
        );
        Ok(())
    }

    /// Idempotent: re-joining with the same role is a no-op.
    pub fn join(&self, room_id: &RoomId, session: &SessionId, role: RoomRole) {
        let service = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                if room.info.members.contains(&(session.clone(), role)) {
                    return;
                }
                room.info.members.retain(|(id, _)| id != session);
                room.info.members.push((session.clone(), role));
                room.info.service.clone()
            }
            None => return,
        };
        debug!(room_id = %room_id, session_id = %session, ?role, "member joined");
        self.publish(
            &service,
            room_id,
            "member_joined",
            json!({ "session_id": session, "role": role }),
        );
    }

    pub fn leave(&self, room_id: &RoomId, session: &SessionId) {
        let (service, now_empty, auto) = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                let before = room.info.members.len();
                room.info.members.retain(|(id, _)| id != session);
                if room.info.members.len() == before {
                    return;
                }
                (
                    room.info.service.clone(),
                    room.info.members.is_empty(),
                    room.auto_created,
                )
            }
            None => return,
        };
        debug!(room_id = %room_id, session_id = %session, "member left");
        self.publish(
            &service,
            room_id,
            "member_left",
            json!({ "session_id": session }),
        );
        if now_empty && auto {
            let _ = self.destroy(room_id);
        }
    }

    pub fn list(&self, service: &ServiceId) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|r| &r.info.service == service)
            .map(|r| r.info.room_id.clone())
            .collect()
    }

    pub fn info(&self, room_id: &RoomId) -> Result<RoomInfo> {
        self.rooms
            .get(room_id)
            .map(|r| r.info.clone())
            .ok_or_else(|| CoreError::RoomNotFound(room_id.clone()))
    }

    fn publish(&self, service: &ServiceId, room_id: &RoomId, event: &str, body: serde_json::Value) {
        self.bus.publish(EventFrame::new(
            service.as_str(),
            "media",
            ObjClass::Room,
            event,
            room_id.as_str(),
            body,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediahub_infra_common::Topic;

    fn registry() -> (RoomRegistry, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        (RoomRegistry::new(bus.clone()), bus)
    }

    #[tokio::test]
    async fn explicit_create_rejects_duplicates() {
        let (rooms, _) = registry();
        let service = ServiceId::new("srv1");
        let id = rooms
            .create(&service, Some(RoomId::named("r1")), None, None)
            .unwrap();
        assert_eq!(id, RoomId::named("r1"));
        assert!(matches!(
            rooms.create(&service, Some(RoomId::named("r1")), None, None),
            Err(CoreError::RoomAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn auto_room_dies_with_last_member() {
        let (rooms, bus) = registry();
        let service = ServiceId::new("srv1");
        let (_, mut rx) = bus.subscribe(Topic::new("srv1", "media", ObjClass::Room), None);

        let room = RoomId::named("mcu1");
        rooms.ensure(&service, &room, Some("video-mcu-stereo".into()), None);
        let s1 = SessionId::new();
        rooms.join(&room, &s1, RoomRole::Member);
        rooms.leave(&room, &s1);

        assert!(rooms.info(&room).is_err());
        let tags: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.event_type)
            .collect();
        assert_eq!(
            tags,
            vec!["room_created", "member_joined", "member_left", "room_destroyed"]
        );
    }

    #[tokio::test]
    async fn explicit_room_survives_empty() {
        let (rooms, _) = registry();
        let service = ServiceId::new("srv1");
        let room = rooms
            .create(&service, Some(RoomId::named("keep")), None, None)
            .unwrap();
        let s1 = SessionId::new();
        rooms.join(&room, &s1, RoomRole::Publisher);
        rooms.leave(&room, &s1);
        assert!(rooms.info(&room).is_ok());
    }
}
