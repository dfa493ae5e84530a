use std::collections::BTreeMap;

use ipnet::IpNet;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Transport protocol of an advertised [`Service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceProto {
    Tcp,
    Udp,
}

/// A listening service discovered on this host and advertised to the
/// control plane (unless shields are up).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub proto: ServiceProto,
    pub port: u16,
    /// Usually the name of the listening process.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Link characteristics measured by the engine's path discovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetInfo {
    /// Whether NAT mappings vary by destination IP (symmetric NAT).
    pub mapping_varies_by_dest_ip: Option<bool>,
    pub hair_pinning: Option<bool>,
    pub working_ipv6: Option<bool>,
    pub working_udp: Option<bool>,
    /// Relay region with the lowest latency; zero when unknown.
    pub preferred_derp: u16,
    pub link_type: String,
    /// Round-trip latency in seconds, keyed by relay region code.
    pub derp_latency: BTreeMap<String, f64>,
}

/// Description of this node, advertised to the control plane.
///
/// Mutated in place only while the agent cache lock is held; everything
/// escaping the lock is a clone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hostinfo {
    pub backend_log_id: String,
    pub frontend_log_id: String,
    pub os: String,
    pub os_version: String,
    pub device_model: String,
    pub hostname: String,
    /// Subnets this node can route for the mesh; mirrors the
    /// `advertise_routes` preference.
    pub routable_ips: Vec<IpNet>,
    /// ACL tags requested for this node.
    pub request_tags: Vec<String>,
    pub services: Vec<Service>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_info: Option<NetInfo>,
}

impl Hostinfo {
    /// A hostinfo for the local machine, before preferences are folded
    /// in.
    pub fn local(backend_log_id: String, frontend_log_id: String) -> Self {
        Self {
            backend_log_id,
            frontend_log_id,
            os: std::env::consts::OS.to_string(),
            ..Default::default()
        }
    }
}
