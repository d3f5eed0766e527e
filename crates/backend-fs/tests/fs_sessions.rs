//! FS adapter tests against a mock engine: park, echo, MCU, bridge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::timeout;

use mediahub_backend_fs::{ChannelId, FsBackend, FsEngine, FsEvent, FsEventKind};
use mediahub_infra_common::{ObjClass, Topic};
use mediahub_session_core::{
    BackendId, HubConfig, Result, RoomId, Sdp, SdpType, ServiceId, SessionConfig, SessionManager,
    SessionType, StopReason, TypeExt, UpdateKind,
};

struct MockFs {
    tx: broadcast::Sender<FsEvent>,
    counter: AtomicUsize,
    transfers: Mutex<Vec<(String, String)>>,
    bridges: Mutex<Vec<(String, String)>>,
    layouts: Mutex<Vec<(String, String)>>,
    hangups: Mutex<Vec<String>>,
}

impl MockFs {
    fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            tx,
            counter: AtomicUsize::new(0),
            transfers: Mutex::new(Vec::new()),
            bridges: Mutex::new(Vec::new()),
            layouts: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
        })
    }

    fn next_channel(&self) -> ChannelId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        ChannelId(format!("ch-{n}"))
    }

    fn transfers(&self) -> Vec<(String, String)> {
        self.transfers.lock().unwrap().clone()
    }

    fn emit(&self, channel: &ChannelId, kind: FsEventKind) {
        let _ = self.tx.send(FsEvent {
            channel: channel.clone(),
            kind,
        });
    }
}

#[async_trait]
impl FsEngine for MockFs {
    async fn start_inbound(&self, _service: &ServiceId, offer: &Sdp) -> Result<(ChannelId, Sdp)> {
        let channel = self.next_channel();
        let answer = Sdp {
            sdp: format!("fs-answer-to[{}]", offer.sdp),
            sdp_type: offer.sdp_type,
            trickle_ice: false,
        };
        Ok((channel, answer))
    }

    async fn start_outbound(
        &self,
        _service: &ServiceId,
        sdp_type: SdpType,
    ) -> Result<(ChannelId, Sdp)> {
        let channel = self.next_channel();
        let offer = Sdp {
            sdp: format!("fs-offer[{channel}]"),
            sdp_type,
            trickle_ice: false,
        };
        Ok((channel, offer))
    }

    async fn answer_outbound(&self, _channel: &ChannelId, _answer: &Sdp) -> Result<()> {
        Ok(())
    }

    async fn transfer_inline(&self, channel: &ChannelId, dialplan: &str) -> Result<()> {
        self.transfers
            .lock()
            .unwrap()
            .push((channel.0.clone(), dialplan.to_string()));
        if dialplan == "park" {
            self.emit(channel, FsEventKind::Parked);
        }
        Ok(())
    }

    async fn bridge(&self, a: &ChannelId, b: &ChannelId) -> Result<()> {
        self.bridges
            .lock()
            .unwrap()
            .push((a.0.clone(), b.0.clone()));
        self.emit(a, FsEventKind::Bridged { peer: b.clone() });
        self.emit(b, FsEventKind::Bridged { peer: a.clone() });
        Ok(())
    }

    async fn conf_layout(&self, room: &RoomId, layout: &str) -> Result<()> {
        self.layouts
            .lock()
            .unwrap()
            .push((room.as_str().to_string(), layout.to_string()));
        Ok(())
    }

    async fn send_dtmf(&self, _channel: &ChannelId, _digits: &str) -> Result<()> {
        Ok(())
    }

    async fn hangup(&self, channel: &ChannelId) -> Result<()> {
        self.hangups.lock().unwrap().push(channel.0.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<FsEvent> {
        self.tx.subscribe()
    }
}

fn hub() -> (SessionManager, Arc<MockFs>) {
    let manager = SessionManager::new(HubConfig::default());
    let engine = MockFs::new();
    manager.register_backend(Arc::new(FsBackend::new(engine.clone(), manager.router())));
    (manager, engine)
}

fn service() -> ServiceId {
    ServiceId::new("test")
}

#[tokio::test]
async fn mcu_join_transfers_into_the_conference() {
    let (manager, engine) = hub();

    let started = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Mcu)
                .with_backend(BackendId::fs())
                .with_offer(Sdp::rtp("sip-offer"))
                .with_ext(TypeExt {
                    room_id: Some(RoomId::named("mcu1")),
                    room_type: Some("video-mcu-stereo".to_string()),
                    ..TypeExt::default()
                }),
        )
        .await
        .unwrap();

    let answer = started.answer.expect("fs answers inbound legs");
    assert_eq!(answer.sdp_type, SdpType::Rtp);
    assert!(answer.sdp.contains("sip-offer"));

    let transfers = engine.transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].1, "conference:mcu1@video-mcu-stereo");

    let info = started.handle.get_info().await.unwrap();
    assert_eq!(info.session_type, SessionType::Mcu);
    assert_eq!(info.type_ext.room_id, Some(RoomId::named("mcu1")));

    // Joining created the room and registered the member.
    let room = manager.rooms().info(&RoomId::named("mcu1")).unwrap();
    assert_eq!(room.members.len(), 1);

    started.handle.stop(StopReason::SipBye);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.rooms().info(&RoomId::named("mcu1")).is_err());
    assert_eq!(engine.hangups.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn echo_session_transfers_to_echo() {
    let (manager, engine) = hub();

    let started = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Echo)
                .with_backend(BackendId::fs())
                .with_offer(Sdp::webrtc("client-offer")),
        )
        .await
        .unwrap();

    assert!(started.answer.is_some());
    assert_eq!(engine.transfers()[0].1, "echo");
}

#[tokio::test]
async fn bridge_is_symmetric_and_survivor_reparks() {
    let (manager, engine) = hub();
    let bus = manager.bus();
    let (_, mut session_events) =
        bus.subscribe(Topic::new("test", "media", ObjClass::Session), None);

    let leg_a = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Park)
                .with_backend(BackendId::fs())
                .with_offer(Sdp::webrtc("offer-a")),
        )
        .await
        .unwrap();
    let leg_b = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Park)
                .with_backend(BackendId::fs())
                .with_offer(Sdp::webrtc("offer-b")),
        )
        .await
        .unwrap();

    // B initiates the bridge toward A.
    leg_b
        .handle
        .update(UpdateKind::SessionType {
            session_type: SessionType::Bridge,
            ext: TypeExt {
                peer_id: Some(leg_a.id.clone()),
                ..TypeExt::default()
            },
        })
        .await
        .unwrap();

    assert_eq!(engine.bridges.lock().unwrap().len(), 1);

    // Both legs report type bridge with peer_id pointing at the other.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let info_b = leg_b.handle.get_info().await.unwrap();
    assert_eq!(info_b.session_type, SessionType::Bridge);
    assert_eq!(info_b.type_ext.peer_id, Some(leg_a.id.clone()));

    let info_a = leg_a.handle.get_info().await.unwrap();
    assert_eq!(info_a.session_type, SessionType::Bridge);
    assert_eq!(info_a.type_ext.peer_id, Some(leg_b.id.clone()));

    // Both sides emitted updated_type(bridge).
    let mut bridge_updates = 0;
    while let Ok(frame) = session_events.try_recv() {
        if frame.event_type == "updated_type" && frame.body["session_type"] == "bridge" {
            bridge_updates += 1;
        }
    }
    assert_eq!(bridge_updates, 2);

    // One leg hangs up; the survivor goes back to park.
    leg_b.handle.stop(StopReason::VertoBye);
    let parked = timeout(Duration::from_secs(2), async {
        loop {
            let info = leg_a.handle.get_info().await.unwrap();
            if info.session_type == SessionType::Park {
                break info;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("survivor reparks");
    assert_eq!(parked.type_ext.peer_id, None);

    // The survivor's channel got a fresh park transfer.
    let parks: Vec<_> = engine
        .transfers()
        .into_iter()
        .filter(|(ch, plan)| plan == "park" && ch == "ch-0")
        .collect();
    assert_eq!(parks.len(), 2);
}

#[tokio::test]
async fn mcu_layout_update_is_an_online_command() {
    let (manager, engine) = hub();

    let started = manager
        .start_session(
            SessionConfig::new(service(), SessionType::Mcu)
                .with_backend(BackendId::fs())
                .with_offer(Sdp::webrtc("offer"))
                .with_ext(TypeExt {
                    room_id: Some(RoomId::named("room9")),
                    ..TypeExt::default()
                }),
        )
        .await
        .unwrap();

    started
        .handle
        .update(UpdateKind::McuLayout {
            layout: "2x2".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        engine.layouts.lock().unwrap().clone(),
        vec![("room9".to_string(), "2x2".to_string())]
    );
    let info = started.handle.get_info().await.unwrap();
    assert_eq!(info.type_ext.mcu_layout, Some("2x2".to_string()));
}
