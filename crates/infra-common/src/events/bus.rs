//! Topic broadcast bus.
//!
//! Fan-out of [`EventFrame`]s to subscribers keyed by
//! (service, class, subclass, instance). A frame published for one instance
//! is delivered both to that instance's subscribers and to wildcard
//! subscribers of the whole subclass. Delivery is a non-blocking send into
//! each subscriber's mailbox; subscribers whose mailbox has closed are
//! pruned on the next publish.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use super::types::{EventFrame, Topic};

/// Identifies one subscription on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct TopicSub {
    id: SubscriptionId,
    sink: mpsc::UnboundedSender<EventFrame>,
    body: Option<Value>,
}

/// Process-wide event broadcast bus.
pub struct EventBus {
    topics: DashMap<Topic, Vec<TopicSub>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Subscribe to a topic. The optional `body` is merged into every frame
    /// delivered to this subscriber.
    pub fn subscribe(
        &self,
        topic: Topic,
        body: Option<Value>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<EventFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe_with_sink(topic, tx, body);
        (id, rx)
    }

    /// Subscribe delivering into an existing mailbox.
    pub fn subscribe_with_sink(
        &self,
        topic: Topic,
        sink: mpsc::UnboundedSender<EventFrame>,
        body: Option<Value>,
    ) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.topics
            .entry(topic)
            .or_default()
            .push(TopicSub { id, sink, body });
        id
    }

    pub fn unsubscribe(&self, topic: &Topic, id: SubscriptionId) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    /// Publish a frame to its instance topic and the subclass wildcard.
    pub fn publish(&self, frame: EventFrame) {
        trace!(
            service = %frame.service,
            subclass = %frame.subclass,
            obj_id = %frame.obj_id,
            event = %frame.event_type,
            "publishing event"
        );
        let instance = frame.topic();
        let wildcard = Topic {
            obj_id: None,
            ..instance.clone()
        };
        self.dispatch(&instance, &frame);
        self.dispatch(&wildcard, &frame);
    }

    fn dispatch(&self, topic: &Topic, frame: &EventFrame) {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.retain(|sub| {
                let mut delivered = frame.clone();
                delivered.body = merge_body(frame.body.clone(), sub.body.as_ref());
                sub.sink.send(delivered).is_ok()
            });
        }
        self.topics.remove_if(topic, |_, subs| subs.is_empty());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge a subscriber-attached body into the event body. Event keys win on
/// conflict; a null event body is replaced wholesale.
fn merge_body(event_body: Value, sub_body: Option<&Value>) -> Value {
    match (event_body, sub_body) {
        (body, None) => body,
        (Value::Null, Some(extra)) => extra.clone(),
        (Value::Object(event), Some(Value::Object(extra))) => {
            let mut merged = extra.clone();
            for (k, v) in event {
                merged.insert(k, v);
            }
            Value::Object(merged)
        }
        (body, Some(_)) => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::ObjClass;
    use serde_json::json;

    fn frame(obj_id: &str, event: &str, body: Value) -> EventFrame {
        EventFrame::new("srv1", "media", ObjClass::Session, event, obj_id, body)
    }

    #[tokio::test]
    async fn instance_and_wildcard_delivery() {
        let bus = EventBus::new();
        let (_, mut exact) = bus.subscribe(
            Topic::new("srv1", "media", ObjClass::Session).instance("s1"),
            None,
        );
        let (_, mut all) = bus.subscribe(Topic::new("srv1", "media", ObjClass::Session), None);

        bus.publish(frame("s1", "ringing", Value::Null));
        bus.publish(frame("s2", "ringing", Value::Null));

        assert_eq!(exact.recv().await.unwrap().obj_id, "s1");
        assert!(exact.try_recv().is_err());

        assert_eq!(all.recv().await.unwrap().obj_id, "s1");
        assert_eq!(all.recv().await.unwrap().obj_id, "s2");
    }

    #[tokio::test]
    async fn subscriber_body_is_attached() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe(
            Topic::new("srv1", "media", ObjClass::Session).instance("s1"),
            Some(json!({"tag": "mine"})),
        );

        bus.publish(frame("s1", "stop", json!({"reason": "user_stop"})));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.body["tag"], "mine");
        assert_eq!(got.body["reason"], "user_stop");
    }

    #[tokio::test]
    async fn closed_sinks_are_pruned() {
        let bus = EventBus::new();
        let topic = Topic::new("srv1", "media", ObjClass::Call);
        let (_, rx) = bus.subscribe(topic.clone(), None);
        drop(rx);

        bus.publish(EventFrame::new(
            "srv1",
            "media",
            ObjClass::Call,
            "hangup",
            "c1",
            Value::Null,
        ));
        assert!(bus.topics.get(&topic).is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let topic = Topic::new("srv1", "media", ObjClass::Session).instance("s1");
        let (id, mut rx) = bus.subscribe(topic.clone(), None);
        bus.unsubscribe(&topic, id);

        bus.publish(frame("s1", "answer", Value::Null));
        assert!(rx.try_recv().is_err());
    }
}
