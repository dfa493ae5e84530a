use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::key::NodeKey;
use crate::state::LifecycleState;

/// Live statistics for one peer, as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerStatus {
    pub node_key: NodeKey,
    /// DNS name from the network map; filled in by the agent, the
    /// engine does not know it.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_handshake: Option<DateTime<Utc>>,
}

/// Snapshot of the data plane, derived from an engine status callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineStatus {
    /// Peers with a live tunnel.
    pub num_live: usize,
    /// Relay connections currently held open.
    pub live_derps: usize,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Local `ip:port` endpoints to advertise to the control plane.
    pub local_addrs: Vec<String>,
    pub peers: Vec<PeerStatus>,
}

/// Overall backend status report, answered to `RequestStatus`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Status {
    pub backend_state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    /// This node's DNS name, when a map is present.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub self_name: String,
    pub peers: Vec<PeerStatus>,
}

/// Accumulates a [`Status`]: the engine contributes peer statistics,
/// the agent contributes everything it knows from its cache.
#[derive(Debug, Default)]
pub struct StatusBuilder {
    status: Status,
}

impl StatusBuilder {
    pub fn set_backend_state(&mut self, state: LifecycleState) {
        self.status.backend_state = state;
    }

    pub fn set_auth_url(&mut self, url: Option<String>) {
        self.status.auth_url = url;
    }

    pub fn set_self_name(&mut self, name: String) {
        self.status.self_name = name;
    }

    pub fn add_peer(&mut self, peer: PeerStatus) {
        self.status.peers.push(peer);
    }

    /// Names peers after the network map entry with the same key.
    pub fn annotate_peer(&mut self, key: &NodeKey, name: &str) {
        for peer in &mut self.status.peers {
            if &peer.node_key == key {
                peer.name = name.to_string();
            }
        }
    }

    pub fn into_status(self) -> Status {
        self.status
    }
}

/// Outcome of a `Ping` command, relayed from the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingResult {
    /// Address that was pinged.
    pub ip: String,
    /// Mesh address of the node that answered.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    pub latency_seconds: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub err: String,
}
