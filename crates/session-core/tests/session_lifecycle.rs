//! Session lifecycle tests against a mock backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use mediahub_infra_common::{LifetimeGuard, ObjClass, Topic};
use mediahub_session_core::backend::{
    BackendCtx, BackendFactory, BackendSession, EngineEvent, ExtOps, Outcome,
};
use mediahub_session_core::{
    BackendId, Candidate, CoreError, CoreEventKind, EventSink, HubConfig, Link, Registration,
    Result, Sdp, SessionConfig, SessionManager, SessionType, StopReason, UpdateKind,
};
use mediahub_session_core::types::{ConnId, ServiceId};

/// Backend that answers every offered leg immediately.
struct MockBackend {
    stops: Arc<AtomicUsize>,
}

impl MockBackend {
    fn new() -> (Arc<Self>, Arc<AtomicUsize>) {
        let stops = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                stops: stops.clone(),
            }),
            stops,
        )
    }
}

#[async_trait]
impl BackendFactory for MockBackend {
    fn id(&self) -> BackendId {
        BackendId("mock".to_string())
    }

    fn supports(&self, session_type: SessionType) -> bool {
        matches!(
            session_type,
            SessionType::Park | SessionType::Echo | SessionType::Mcu
        )
    }

    async fn init(&self, _ctx: &BackendCtx) -> Result<Box<dyn BackendSession>> {
        Ok(Box::new(MockSession {
            stops: self.stops.clone(),
        }))
    }
}

struct MockSession {
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl BackendSession for MockSession {
    async fn start(&mut self, ctx: &BackendCtx) -> Outcome {
        match &ctx.offer {
            Some(offer) => Outcome::with_ops(ExtOps::answer(Sdp {
                sdp: format!("answer-to[{}]", offer.sdp),
                sdp_type: offer.sdp_type,
                trickle_ice: false,
            })),
            None => Outcome::with_ops(ExtOps::offer(Sdp::webrtc("mock-offer"))),
        }
    }

    async fn set_offer(&mut self, _offer: &Sdp, _ctx: &BackendCtx) -> Outcome {
        Outcome::ok()
    }

    async fn set_answer(&mut self, _answer: &Sdp, _ctx: &BackendCtx) -> Outcome {
        Outcome::ok()
    }

    async fn update(&mut self, _update: &UpdateKind, _ctx: &BackendCtx) -> Outcome {
        Outcome::Pass
    }

    async fn candidate(&mut self, _candidate: &Candidate, _ctx: &BackendCtx) -> Outcome {
        Outcome::ok()
    }

    async fn engine_event(&mut self, _event: EngineEvent, _ctx: &BackendCtx) -> Outcome {
        Outcome::Pass
    }

    async fn stop(&mut self, _reason: &StopReason, _ctx: &BackendCtx) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn manager_with_mock() -> (SessionManager, Arc<AtomicUsize>) {
    let manager = SessionManager::new(HubConfig::default());
    let (factory, stops) = MockBackend::new();
    manager.register_backend(factory);
    (manager, stops)
}

fn service() -> ServiceId {
    ServiceId::new("test")
}

fn api_observer() -> (LifetimeGuard, Link, tokio::sync::mpsc::UnboundedReceiver<mediahub_session_core::CoreEvent>) {
    let guard = LifetimeGuard::new();
    let (sink, rx) = EventSink::channel();
    let link = Link::Api {
        conn: ConnId::new(),
        lifetime: guard.watcher(),
        sink,
    };
    (guard, link, rx)
}

#[tokio::test]
async fn start_with_offer_answers_before_returning() {
    let (manager, _) = manager_with_mock();
    let (_guard, link, mut events) = api_observer();

    let started = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Echo)
                .with_backend(BackendId("mock".to_string()))
                .with_offer(Sdp::webrtc("client-offer"))
                .with_register(Registration::new(link)),
        )
        .await
        .unwrap();

    let answer = started.answer.expect("backend answers synchronously");
    assert!(answer.sdp.contains("client-offer"));
    assert_eq!(started.handle.get_answer().await.unwrap(), answer);

    // The answer event reached the registered observer.
    let ev = timeout(Duration::from_millis(500), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(ev.kind, CoreEventKind::Answer { .. }));
}

#[tokio::test]
async fn duplicate_answer_is_rejected_without_stopping() {
    let (manager, _) = manager_with_mock();

    let started = manager
        .start_session(
            SessionConfig::new(service(), SessionType::P2p).with_offer(Sdp::webrtc("offer")),
        )
        .await
        .unwrap();

    started
        .handle
        .set_answer(Sdp::webrtc("answer-1"))
        .await
        .unwrap();
    let err = started
        .handle
        .set_answer(Sdp::webrtc("answer-2"))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::AlreadyAnswered);

    // Still alive and ready; the answer is immutable.
    let info = started.handle.get_info().await.unwrap();
    assert_eq!(info.phase, "ready");
    assert_eq!(
        started.handle.get_answer().await.unwrap(),
        Sdp::webrtc("answer-1")
    );
}

#[tokio::test]
async fn observer_death_stops_session_with_registered_stop() {
    let (manager, stops) = manager_with_mock();
    let bus = manager.bus();
    let (_, mut topic_rx) = bus.subscribe(Topic::new("test", "media", ObjClass::Session), None);

    let (guard, link, _events) = api_observer();
    let started = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Echo)
                .with_backend(BackendId("mock".to_string()))
                .with_offer(Sdp::webrtc("offer"))
                .with_register(Registration::new(link)),
        )
        .await
        .unwrap();

    drop(guard);

    // The stop event lands on the topic before the subscription vanishes.
    let stop = timeout(Duration::from_secs(1), async {
        loop {
            let frame = topic_rx.recv().await.unwrap();
            if frame.event_type == "stop" {
                break frame;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(stop.obj_id, started.id.as_str());
    assert_eq!(stop.body["reason"], "registered_stop");

    // Session is gone and the backend was released exactly once.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(manager.session(&started.id).is_none());
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stop_event_is_emitted_exactly_once() {
    let (manager, _) = manager_with_mock();
    let (_guard, link, mut events) = api_observer();

    let started = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Echo)
                .with_backend(BackendId("mock".to_string()))
                .with_offer(Sdp::webrtc("offer"))
                .with_register(Registration::new(link)),
        )
        .await
        .unwrap();

    started.handle.stop(StopReason::UserStop);
    started.handle.stop(StopReason::SipBye);
    tokio::time::sleep(Duration::from_millis(250)).await;

    let mut stop_count = 0;
    while let Ok(ev) = events.try_recv() {
        if let CoreEventKind::Stop { reason } = ev.kind {
            assert_eq!(reason, StopReason::UserStop);
            stop_count += 1;
        }
    }
    assert_eq!(stop_count, 1);
}

#[tokio::test]
async fn get_offer_blocks_until_offer_is_set() {
    let (manager, _) = manager_with_mock();

    let started = manager
        .start_session(SessionConfig::new(service(), SessionType::P2p))
        .await
        .unwrap();

    let handle = started.handle.clone();
    let waiter = tokio::spawn(async move { handle.get_offer().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    started.handle.set_offer(Sdp::webrtc("late-offer")).await.unwrap();
    let got = timeout(Duration::from_millis(500), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got.sdp, "late-offer");
}

#[tokio::test]
async fn missing_offer_times_out_the_session() {
    let (manager, _) = manager_with_mock();
    let bus = manager.bus();
    let (_, mut topic_rx) = bus.subscribe(Topic::new("test", "media", ObjClass::Session), None);

    let mut config = SessionConfig::new(service(), SessionType::P2p);
    config.wait_timeout = Some(Duration::from_millis(50));
    let started = manager.start_session(config).await.unwrap();

    let stop = timeout(Duration::from_secs(1), async {
        loop {
            let frame = topic_rx.recv().await.unwrap();
            if frame.event_type == "stop" && frame.obj_id == started.id.as_str() {
                break frame;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(stop.body["reason"], "session_timeout");
}

#[tokio::test]
async fn slave_answer_propagates_to_master() {
    let (manager, _) = manager_with_mock();

    let master = manager
        .start_session(
            SessionConfig::new(service(), SessionType::P2p).with_offer(Sdp::webrtc("offer-a")),
        )
        .await
        .unwrap();

    let slave = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Call)
                .with_offer(Sdp::webrtc("offer-a"))
                .with_master_peer(master.handle.link()),
        )
        .await
        .unwrap();

    slave
        .handle
        .set_answer(Sdp::webrtc("callee-answer"))
        .await
        .unwrap();

    let answer = timeout(Duration::from_secs(1), master.handle.get_answer())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(answer.sdp, "callee-answer");
}

#[tokio::test]
async fn master_death_stops_slave_with_master_peer_stop() {
    let (manager, _) = manager_with_mock();
    let bus = manager.bus();
    let (_, mut topic_rx) = bus.subscribe(Topic::new("test", "media", ObjClass::Session), None);

    let master = manager
        .start_session(
            SessionConfig::new(service(), SessionType::P2p).with_offer(Sdp::webrtc("offer-a")),
        )
        .await
        .unwrap();
    let slave = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Call)
                .with_offer(Sdp::webrtc("offer-a"))
                .with_master_peer(master.handle.link()),
        )
        .await
        .unwrap();

    master.handle.stop(StopReason::UserStop);

    let stop = timeout(Duration::from_secs(1), async {
        loop {
            let frame = topic_rx.recv().await.unwrap();
            if frame.event_type == "stop" && frame.obj_id == slave.id.as_str() {
                break frame;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(stop.body["reason"], "master_peer_stop");
}
