//! Hub configuration.
//!
//! Plain data; loading from files or the environment is the embedding
//! process's concern.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a session waits for its offer before giving up.
pub const DEF_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a session waits for its answer before giving up.
pub const DEF_READY_TIMEOUT: Duration = Duration::from_secs(86_400);

/// Bound on waiting for the backend to report a neutral (parked) state.
pub const PARKED_WAIT: Duration = Duration::from_secs(2);

/// Grace window between emitting a terminal event and tearing down, so
/// fire-and-forget observers can drain their mailboxes.
pub const STOP_EVENT_GRACE: Duration = Duration::from_millis(100);

/// Deadline for aggregating trickle-ICE candidates into a held offer.
pub const TRICKLE_DEADLINE: Duration = Duration::from_secs(5);

/// Top-level configuration of the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Accept SIP REGISTER at all.
    pub sip_registrar: bool,
    /// Realm / force-domain value.
    pub sip_domain: Option<String>,
    /// Rewrite the To-domain of incoming REGISTERs to `sip_domain`.
    pub sip_registrar_force_domain: bool,
    /// Permit INVITE to URIs that are not registered.
    pub sip_invite_not_registered: bool,
    /// WebSocket bind specs for the Verto endpoint.
    pub verto_listen: Vec<String>,
    /// Backend engine image references, handed to the container supervisor.
    pub fs_docker_image: String,
    pub kms_docker_image: String,
    /// Session timer overrides, in seconds.
    pub session_wait_timeout_secs: u64,
    pub session_ready_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            sip_registrar: true,
            sip_domain: None,
            sip_registrar_force_domain: false,
            sip_invite_not_registered: true,
            verto_listen: vec!["ws://0.0.0.0:8188".to_string()],
            fs_docker_image: "mediahub/fs:latest".to_string(),
            kms_docker_image: "mediahub/kms:latest".to_string(),
            session_wait_timeout_secs: DEF_WAIT_TIMEOUT.as_secs(),
            session_ready_timeout_secs: DEF_READY_TIMEOUT.as_secs(),
        }
    }
}

impl HubConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.session_wait_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.session_ready_timeout_secs)
    }
}
