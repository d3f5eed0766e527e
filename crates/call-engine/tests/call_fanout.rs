//! Call fan-out tests: first-answer-wins, cancellation, and terminal
//! reasons.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::timeout;

use mediahub_call_engine::{CallConfig, CallEngine, CallPlugin, InviteReply, Resolver};
use mediahub_infra_common::LifetimeGuard;
use mediahub_session_core::{
    CallId, ConnId, CoreError, CoreEvent, CoreEventKind, DestToken, Destination, EventSink,
    HubConfig, Link, LinkKey, Registration, Sdp, ServiceId, SessionManager, StopReason,
};

struct StaticResolver(Vec<Destination>);

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, _service: &ServiceId, _callee: &str) -> Vec<Destination> {
        self.0.clone()
    }
}

/// Plugin serving `api` destinations from a map of prepared links.
struct TestPlugin {
    links: DashMap<String, Link>,
    invites: Mutex<Vec<String>>,
    cancels: Mutex<Vec<LinkKey>>,
    /// Users that answer `Retry` exactly once before launching.
    retry_once: DashMap<String, bool>,
}

impl TestPlugin {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            links: DashMap::new(),
            invites: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            retry_once: DashMap::new(),
        })
    }

    fn add_leg(&self, user: &str) -> (LifetimeGuard, LinkKey) {
        let guard = LifetimeGuard::new();
        let (sink, _rx) = EventSink::channel();
        let link = Link::Api {
            conn: ConnId(format!("conn-{user}")),
            lifetime: guard.watcher(),
            sink,
        };
        let key = link.key();
        self.links.insert(user.to_string(), link);
        (guard, key)
    }

    fn invited(&self) -> Vec<String> {
        self.invites.lock().unwrap().clone()
    }

    fn cancelled(&self) -> Vec<LinkKey> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallPlugin for TestPlugin {
    async fn invite(
        &self,
        _call_id: &CallId,
        dest: &Destination,
        _offer: Option<&Sdp>,
        _meta: &Value,
    ) -> InviteReply {
        let DestToken::Api { user } = &dest.dest else {
            return InviteReply::Pass;
        };
        if user.starts_with("gone") {
            return InviteReply::Remove;
        }
        if let Some(mut pending) = self.retry_once.get_mut(user) {
            if *pending {
                *pending = false;
                return InviteReply::Retry { secs: 0 };
            }
        }
        self.invites.lock().unwrap().push(user.clone());
        match self.links.get(user) {
            Some(link) => InviteReply::Ok { link: link.clone() },
            None => InviteReply::Remove,
        }
    }

    async fn cancel(&self, _call_id: &CallId, link: &Link) {
        if matches!(link, Link::Api { .. }) {
            self.cancels.lock().unwrap().push(link.key());
        }
    }
}

fn engine() -> (SessionManager, CallEngine) {
    let manager = SessionManager::new(HubConfig::default());
    let calls = CallEngine::new(&manager);
    (manager, calls)
}

fn observer() -> (
    LifetimeGuard,
    Registration,
    tokio::sync::mpsc::UnboundedReceiver<CoreEvent>,
) {
    let guard = LifetimeGuard::new();
    let (sink, rx) = EventSink::channel();
    let link = Link::Api {
        conn: ConnId::new(),
        lifetime: guard.watcher(),
        sink,
    };
    (guard, Registration::new(link), rx)
}

fn api_dest(user: &str) -> Destination {
    Destination::new(DestToken::Api {
        user: user.to_string(),
    })
}

async fn next_event(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<CoreEvent>,
) -> CoreEventKind {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
        .kind
}

#[tokio::test]
async fn first_answer_wins_and_losers_are_cancelled() {
    let (_manager, calls) = engine();
    let plugin = TestPlugin::new();
    let (_g1, _k1) = plugin.add_leg("alice-desk");
    let (_g2, k2) = plugin.add_leg("alice-phone");
    let (_g3, _k3) = plugin.add_leg("alice-web");
    calls.register_plugin(plugin.clone());
    calls.register_resolver(Arc::new(StaticResolver(vec![
        api_dest("alice-desk"),
        api_dest("alice-phone"),
        api_dest("alice-web"),
    ])));

    let (_obs_guard, registration, mut events) = observer();
    let started = calls.start_call(
        CallConfig::new(ServiceId::new("test"), "alice")
            .with_offer(Sdp::webrtc("offer"))
            .with_register(registration),
    );

    // Let the three invites launch.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(plugin.invited().len(), 3);

    started
        .handle
        .answered(k2.clone(), Sdp::webrtc("answer"))
        .await
        .unwrap();

    // Both losers were cancelled before the answered() reply came back.
    let cancelled = plugin.cancelled();
    assert_eq!(cancelled.len(), 2);
    assert!(!cancelled.contains(&k2));

    // Exactly one answer event, carrying the winner.
    match next_event(&mut events).await {
        CoreEventKind::Answer { winner, .. } => assert_eq!(winner, Some(k2.clone())),
        other => panic!("expected answer, got {other:?}"),
    }

    // A second answer is refused.
    let err = started
        .handle
        .answered(k2, Sdp::webrtc("answer-2"))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::AlreadyAnswered);
}

#[tokio::test]
async fn empty_resolution_hangs_up_with_no_destination() {
    let (_manager, calls) = engine();
    calls.register_resolver(Arc::new(StaticResolver(Vec::new())));

    let (_obs_guard, registration, mut events) = observer();
    let t0 = Instant::now();
    let started = calls.start_call(
        CallConfig::new(ServiceId::new("test"), "unknown").with_register(registration),
    );

    match next_event(&mut events).await {
        CoreEventKind::Hangup { reason } => assert_eq!(reason, StopReason::NoDestination),
        other => panic!("expected hangup, got {other:?}"),
    }
    assert!(t0.elapsed() < Duration::from_millis(500));

    // The call leaves the registry after its grace window.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(calls.call(&started.id).is_none());
}

#[tokio::test]
async fn all_rejected_ends_with_no_answer() {
    let (_manager, calls) = engine();
    let plugin = TestPlugin::new();
    let (_g1, k1) = plugin.add_leg("bob-a");
    let (_g2, k2) = plugin.add_leg("bob-b");
    calls.register_plugin(plugin.clone());
    calls.register_resolver(Arc::new(StaticResolver(vec![
        api_dest("bob-a"),
        api_dest("bob-b"),
    ])));

    let (_obs_guard, registration, mut events) = observer();
    let started = calls.start_call(
        CallConfig::new(ServiceId::new("test"), "bob").with_register(registration),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    started.handle.rejected(k1).await.unwrap();
    started.handle.rejected(k2).await.unwrap();

    match next_event(&mut events).await {
        CoreEventKind::Hangup { reason } => assert_eq!(reason, StopReason::NoAnswer),
        other => panic!("expected hangup, got {other:?}"),
    }
}

#[tokio::test]
async fn undispatchable_destination_is_removed() {
    let (_manager, calls) = engine();
    let plugin = TestPlugin::new();
    calls.register_plugin(plugin.clone());
    calls.register_resolver(Arc::new(StaticResolver(vec![api_dest("gone-user")])));

    let (_obs_guard, registration, mut events) = observer();
    calls.start_call(CallConfig::new(ServiceId::new("test"), "gone").with_register(registration));

    match next_event(&mut events).await {
        CoreEventKind::Hangup { reason } => assert_eq!(reason, StopReason::NoAnswer),
        other => panic!("expected hangup, got {other:?}"),
    }
}

#[tokio::test]
async fn retry_reschedules_the_invite() {
    let (_manager, calls) = engine();
    let plugin = TestPlugin::new();
    let (_g, k) = plugin.add_leg("carol");
    plugin.retry_once.insert("carol".to_string(), true);
    calls.register_plugin(plugin.clone());
    calls.register_resolver(Arc::new(StaticResolver(vec![api_dest("carol")])));

    let (_obs_guard, registration, mut events) = observer();
    let started = calls.start_call(
        CallConfig::new(ServiceId::new("test"), "carol").with_register(registration),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(plugin.invited(), vec!["carol"]);

    started.handle.answered(k, Sdp::webrtc("answer")).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        CoreEventKind::Answer { .. }
    ));
}

#[tokio::test]
async fn winner_death_hangs_up_with_callee_stop() {
    let (_manager, calls) = engine();
    let plugin = TestPlugin::new();
    let (winner_guard, k) = plugin.add_leg("dave");
    calls.register_plugin(plugin.clone());
    calls.register_resolver(Arc::new(StaticResolver(vec![api_dest("dave")])));

    let (_obs_guard, registration, mut events) = observer();
    let started = calls.start_call(
        CallConfig::new(ServiceId::new("test"), "dave").with_register(registration),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    started.handle.answered(k, Sdp::webrtc("answer")).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        CoreEventKind::Answer { .. }
    ));

    drop(winner_guard);

    match next_event(&mut events).await {
        CoreEventKind::Hangup { reason } => assert_eq!(reason, StopReason::CalleeStop),
        other => panic!("expected hangup, got {other:?}"),
    }
}

#[tokio::test]
async fn observer_death_hangs_up_the_call() {
    let (_manager, calls) = engine();
    let plugin = TestPlugin::new();
    let (_g, _k) = plugin.add_leg("erin");
    calls.register_plugin(plugin.clone());
    calls.register_resolver(Arc::new(StaticResolver(vec![api_dest("erin")])));

    let (obs_guard, registration, _events) = observer();
    let started = calls.start_call(
        CallConfig::new(ServiceId::new("test"), "erin").with_register(registration),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    drop(obs_guard);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(calls.call(&started.id).is_none());

    // The ringing leg got a cancel on the way down.
    assert_eq!(plugin.cancelled().len(), 1);
}
