//! KMS adapter tests against a mock engine: candidate buffering order,
//! echo wiring, and SFU publish/listen.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

use mediahub_backend_kms::{EndpointId, KmsBackend, KmsEngine, KmsEvent, KmsEventKind};
use mediahub_session_core::{
    BackendId, Candidate, CoreEventKind, EventSink, HubConfig, IceCandidate, Link, Registration,
    Result, RoomId, Sdp, ServiceId, SessionConfig, SessionManager, SessionType, TypeExt,
    UpdateKind,
};
use mediahub_session_core::types::ConnId;
use mediahub_infra_common::LifetimeGuard;

struct MockKms {
    tx: broadcast::Sender<KmsEvent>,
    counter: AtomicUsize,
    added: Mutex<Vec<(String, String)>>,
    ends: Mutex<Vec<String>>,
    connects: Mutex<Vec<(String, String)>>,
    releases: Mutex<Vec<String>>,
}

impl MockKms {
    fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            tx,
            counter: AtomicUsize::new(0),
            added: Mutex::new(Vec::new()),
            ends: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
        })
    }

    fn emit(&self, endpoint: &EndpointId, kind: KmsEventKind) {
        let _ = self.tx.send(KmsEvent {
            endpoint: endpoint.clone(),
            kind,
        });
    }

    fn added(&self) -> Vec<(String, String)> {
        self.added.lock().unwrap().clone()
    }
}

#[async_trait]
impl KmsEngine for MockKms {
    async fn create_endpoint(&self, _service: &ServiceId) -> Result<EndpointId> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(EndpointId(format!("ep-{n}")))
    }

    async fn process_offer(&self, endpoint: &EndpointId, offer: &Sdp) -> Result<Sdp> {
        Ok(Sdp::webrtc(format!("kms-answer[{endpoint}]-to[{}]", offer.sdp)))
    }

    async fn generate_offer(&self, endpoint: &EndpointId) -> Result<Sdp> {
        Ok(Sdp::webrtc(format!("kms-offer[{endpoint}]")))
    }

    async fn process_answer(&self, _endpoint: &EndpointId, _answer: &Sdp) -> Result<()> {
        Ok(())
    }

    async fn gather_candidates(&self, _endpoint: &EndpointId) -> Result<()> {
        Ok(())
    }

    async fn add_candidate(
        &self,
        endpoint: &EndpointId,
        candidate: &IceCandidate,
    ) -> Result<()> {
        self.added
            .lock()
            .unwrap()
            .push((endpoint.0.clone(), candidate.candidate.clone()));
        Ok(())
    }

    async fn end_of_candidates(&self, endpoint: &EndpointId) -> Result<()> {
        self.ends.lock().unwrap().push(endpoint.0.clone());
        Ok(())
    }

    async fn connect(&self, from: &EndpointId, to: &EndpointId) -> Result<()> {
        self.connects
            .lock()
            .unwrap()
            .push((from.0.clone(), to.0.clone()));
        Ok(())
    }

    async fn disconnect_all(&self, _endpoint: &EndpointId) -> Result<()> {
        Ok(())
    }

    async fn release(&self, endpoint: &EndpointId) -> Result<()> {
        self.releases.lock().unwrap().push(endpoint.0.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<KmsEvent> {
        self.tx.subscribe()
    }
}

fn hub() -> (SessionManager, Arc<MockKms>) {
    let manager = SessionManager::new(HubConfig::default());
    let engine = MockKms::new();
    manager.register_backend(Arc::new(KmsBackend::new(engine.clone(), manager.router())));
    (manager, engine)
}

fn service() -> ServiceId {
    ServiceId::new("test")
}

fn cand(s: &str) -> Candidate {
    Candidate::Item(IceCandidate {
        m_id: Some("0".to_string()),
        m_index: Some(0),
        candidate: s.to_string(),
    })
}

#[tokio::test]
async fn candidates_buffer_until_ready_and_flush_in_order() {
    let (manager, engine) = hub();

    let started = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Echo)
                .with_backend(BackendId::kms())
                .with_offer(Sdp::webrtc("offer").with_trickle()),
        )
        .await
        .unwrap();
    assert!(started.answer.is_some());

    for c in ["c1", "c2", "c3"] {
        started.handle.candidate(cand(c)).await.unwrap();
    }
    started.handle.candidate_end().await.unwrap();

    // Endpoint not ready yet: nothing reached the engine.
    assert!(engine.added().is_empty());
    assert!(engine.ends.lock().unwrap().is_empty());

    engine.emit(&EndpointId("ep-0".to_string()), KmsEventKind::Ready);
    timeout(Duration::from_secs(1), async {
        while engine.ends.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flush after ready");

    let added: Vec<String> = engine.added().into_iter().map(|(_, c)| c).collect();
    assert_eq!(added, vec!["c1", "c2", "c3"]);
    assert_eq!(engine.ends.lock().unwrap().len(), 1);

    // End-of-candidates is idempotent.
    started.handle.candidate_end().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.ends.lock().unwrap().len(), 1);

    // Late candidates go straight through now.
    started.handle.candidate(cand("late")).await.unwrap();
    let added: Vec<String> = engine.added().into_iter().map(|(_, c)| c).collect();
    assert_eq!(added, vec!["c1", "c2", "c3", "late"]);
}

#[tokio::test]
async fn echo_connects_the_endpoint_to_itself() {
    let (manager, engine) = hub();

    manager
        .start_session(
            SessionConfig::new(service(), SessionType::Echo)
                .with_backend(BackendId::kms())
                .with_offer(Sdp::webrtc("offer")),
        )
        .await
        .unwrap();

    assert_eq!(
        engine.connects.lock().unwrap().clone(),
        vec![("ep-0".to_string(), "ep-0".to_string())]
    );
}

#[tokio::test]
async fn engine_candidates_stream_to_observers() {
    let (manager, engine) = hub();

    let guard = LifetimeGuard::new();
    let (sink, mut events) = EventSink::channel();
    let link = Link::Api {
        conn: ConnId::new(),
        lifetime: guard.watcher(),
        sink,
    };

    manager
        .start_session(
            SessionConfig::new(service(), SessionType::Echo)
                .with_backend(BackendId::kms())
                .with_offer(Sdp::webrtc("offer").with_trickle())
                .with_register(Registration::new(link)),
        )
        .await
        .unwrap();

    engine.emit(
        &EndpointId("ep-0".to_string()),
        KmsEventKind::IceCandidate {
            candidate: IceCandidate {
                m_id: Some("0".to_string()),
                m_index: Some(0),
                candidate: "server-cand".to_string(),
            },
        },
    );
    engine.emit(&EndpointId("ep-0".to_string()), KmsEventKind::GatheringDone);

    let first = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    match first.kind {
        CoreEventKind::Candidate {
            candidate: Candidate::Item(item),
        } => assert_eq!(item.candidate, "server-cand"),
        other => panic!("expected candidate, got {other:?}"),
    }
    let second = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        second.kind,
        CoreEventKind::Candidate {
            candidate: Candidate::End
        }
    ));
}

#[tokio::test]
async fn listener_connects_to_its_publisher_and_can_switch() {
    let (manager, engine) = hub();
    let room = RoomId::named("sfu1");

    let publisher_a = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Publish)
                .with_backend(BackendId::kms())
                .with_offer(Sdp::webrtc("pub-a"))
                .with_ext(TypeExt {
                    room_id: Some(room.clone()),
                    ..TypeExt::default()
                }),
        )
        .await
        .unwrap();
    let publisher_b = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Publish)
                .with_backend(BackendId::kms())
                .with_offer(Sdp::webrtc("pub-b"))
                .with_ext(TypeExt {
                    room_id: Some(room.clone()),
                    ..TypeExt::default()
                }),
        )
        .await
        .unwrap();

    let listener = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Listen)
                .with_backend(BackendId::kms())
                .with_offer(Sdp::webrtc("listen"))
                .with_ext(TypeExt {
                    room_id: Some(room.clone()),
                    publisher_id: Some(publisher_a.id.clone()),
                    ..TypeExt::default()
                }),
        )
        .await
        .unwrap();

    // pub-a is ep-0, pub-b is ep-1, listener is ep-2.
    assert_eq!(
        engine.connects.lock().unwrap().clone(),
        vec![("ep-0".to_string(), "ep-2".to_string())]
    );

    // The room tracks both roles.
    let info = manager.rooms().info(&room).unwrap();
    assert_eq!(info.members.len(), 3);

    listener
        .handle
        .update(UpdateKind::ListenSwitch {
            publisher_id: publisher_b.id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        engine.connects.lock().unwrap().last().unwrap(),
        &("ep-1".to_string(), "ep-2".to_string())
    );
    let info = listener.handle.get_info().await.unwrap();
    assert_eq!(info.type_ext.publisher_id, Some(publisher_b.id.clone()));
}
