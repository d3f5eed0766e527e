//! Shared wiring for the endpoint scenario tests: a hub with mock FS and
//! KMS engines and the call engine installed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use mediahub_backend_fs::{ChannelId, FsBackend, FsEngine, FsEvent, FsEventKind};
use mediahub_backend_kms::{EndpointId, KmsBackend, KmsEngine, KmsEvent};
use mediahub_call_engine::CallEngine;
use mediahub_session_core::{
    CallLauncher, HubConfig, IceCandidate, Result, RoomId, Sdp, SdpType, ServiceId,
    SessionManager,
};

pub struct MockFs {
    tx: broadcast::Sender<FsEvent>,
    counter: AtomicUsize,
    pub transfers: Mutex<Vec<(String, String)>>,
    pub bridges: Mutex<Vec<(String, String)>>,
}

impl MockFs {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            tx,
            counter: AtomicUsize::new(0),
            transfers: Mutex::new(Vec::new()),
            bridges: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl FsEngine for MockFs {
    async fn start_inbound(&self, _service: &ServiceId, offer: &Sdp) -> Result<(ChannelId, Sdp)> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let channel = ChannelId(format!("fs-ch-{n}"));
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
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let channel = ChannelId(format!("fs-ch-{n}"));
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
            let _ = self.tx.send(FsEvent {
                channel: channel.clone(),
                kind: FsEventKind::Parked,
            });
        }
        Ok(())
    }

    async fn bridge(&self, a: &ChannelId, b: &ChannelId) -> Result<()> {
        self.bridges
            .lock()
            .unwrap()
            .push((a.0.clone(), b.0.clone()));
        let _ = self.tx.send(FsEvent {
            channel: a.clone(),
            kind: FsEventKind::Bridged { peer: b.clone() },
        });
        let _ = self.tx.send(FsEvent {
            channel: b.clone(),
            kind: FsEventKind::Bridged { peer: a.clone() },
        });
        Ok(())
    }

    async fn conf_layout(&self, _room: &RoomId, _layout: &str) -> Result<()> {
        Ok(())
    }

    async fn send_dtmf(&self, _channel: &ChannelId, _digits: &str) -> Result<()> {
        Ok(())
    }

    async fn hangup(&self, _channel: &ChannelId) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<FsEvent> {
        self.tx.subscribe()
    }
}

pub struct MockKms {
    tx: broadcast::Sender<KmsEvent>,
    counter: AtomicUsize,
    pub connects: Mutex<Vec<(String, String)>>,
}

impl MockKms {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            tx,
            counter: AtomicUsize::new(0),
            connects: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl KmsEngine for MockKms {
    async fn create_endpoint(&self, _service: &ServiceId) -> Result<EndpointId> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(EndpointId(format!("kms-ep-{n}")))
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
        _endpoint: &EndpointId,
        _candidate: &IceCandidate,
    ) -> Result<()> {
        Ok(())
    }

    async fn end_of_candidates(&self, _endpoint: &EndpointId) -> Result<()> {
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

    async fn release(&self, _endpoint: &EndpointId) -> Result<()> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<KmsEvent> {
        self.tx.subscribe()
    }
}

pub struct Hub {
    pub manager: SessionManager,
    pub calls: CallEngine,
    pub fs: Arc<MockFs>,
    pub kms: Arc<MockKms>,
}

/// A hub with both mock engines and the call layer wired in.
pub fn build_hub() -> Hub {
    let manager = SessionManager::new(HubConfig::default());
    let fs = MockFs::new();
    let kms = MockKms::new();
    manager.register_backend(Arc::new(FsBackend::new(fs.clone(), manager.router())));
    manager.register_backend(Arc::new(KmsBackend::new(kms.clone(), manager.router())));
    let calls = CallEngine::new(&manager);
    manager.set_call_launcher(Arc::new(calls.clone()) as Arc<dyn CallLauncher>);
    Hub {
        manager,
        calls,
        fs,
        kms,
    }
}

pub fn service() -> ServiceId {
    ServiceId::new("test")
}
