//! The network map: the control plane's signed snapshot of the mesh as
//! this node is allowed to see it.
//!
//! A map is replaced wholesale whenever the control plane sends a new
//! one and is never mutated in place, so references handed out under
//! the agent lock stay valid after the lock is released.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

use chrono::DateTime;
use chrono::Utc;
use ipnet::IpNet;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::hostinfo::Hostinfo;
use crate::key::NodeKey;

/// Whether the control plane has authorized this machine to join the
/// network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MachineStatus {
    #[default]
    Unknown,
    Unauthorized,
    Authorized,
}

/// Inclusive port range in a packet filter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    /// The whole port space.
    pub const ALL: PortRange = PortRange {
        first: 0,
        last: u16::MAX,
    };
}

/// Destination half of a packet filter rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetPortRange {
    pub net: IpNet,
    pub ports: PortRange,
}

/// One inbound-allow rule from the control plane's packet filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub srcs: Vec<IpNet>,
    pub dsts: Vec<NetPortRange>,
}

/// A relay server inside a [`DerpRegion`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerpNode {
    pub name: String,
    pub host_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    pub stun_port: u16,
    pub derp_port: u16,
}

/// A geographic cluster of relay servers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerpRegion {
    pub region_id: u16,
    pub region_code: String,
    pub nodes: Vec<DerpNode>,
}

/// The relay table pushed to the engine for when direct paths fail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerpMap {
    pub regions: BTreeMap<u16, DerpRegion>,
}

/// DNS settings served with the map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsBlock {
    pub nameservers: Vec<IpAddr>,
    /// Search domains.
    pub domains: Vec<String>,
    /// Route mesh hostnames through the agent's internal resolver.
    pub proxied: bool,
    /// Send only the listed domains to these nameservers.
    pub per_domain: bool,
}

/// Another node in the mesh, as described by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Peer {
    /// DNS name of the peer, e.g. `crocus.example.ts.net.`.
    pub name: String,
    pub key: NodeKey,
    /// Mesh addresses assigned to the peer.
    pub addresses: Vec<IpNet>,
    /// Prefixes this node is allowed to send to the peer.
    pub allowed_ips: Vec<IpNet>,
    /// Candidate `ip:port` endpoints for direct connection.
    pub endpoints: Vec<String>,
    pub user: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostinfo: Option<Box<Hostinfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Keep the tunnel to this peer warm with persistent keepalives.
    pub keep_alive: bool,
}

impl Peer {
    /// The peer's primary mesh address, if it has one.
    pub fn first_addr(&self) -> Option<IpAddr> {
        self.addresses.first().map(|net| net.addr())
    }
}

/// Server-supplied snapshot of the mesh. Immutable once stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkMap {
    /// This node's own DNS name.
    pub name: String,
    pub node_key: NodeKey,
    /// Mesh addresses assigned to this node.
    pub addresses: Vec<IpNet>,
    pub machine_status: MachineStatus,
    /// Key expiry; `None` means the key never expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    pub user: u64,
    pub login_name: String,
    pub peers: Vec<Peer>,
    /// Inbound-allow rules to compile into the engine's packet filter.
    pub packet_filter: Vec<FilterRule>,
    pub dns: DnsBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derp_map: Option<DerpMap>,
}

impl NetworkMap {
    /// This node's primary mesh address, if assigned.
    pub fn first_addr(&self) -> Option<IpAddr> {
        self.addresses.first().map(|net| net.addr())
    }

    /// One line per node, for diff logging when a map is replaced.
    pub fn concise(&self) -> String {
        let mut out = format!(
            "{} [{}] machine={} peers={}\n",
            self.name,
            join_nets(&self.addresses),
            self.machine_status,
            self.peers.len()
        );
        for peer in &self.peers {
            let _ = writeln!(
                out,
                "  {} {} [{}] ep={}",
                peer.key.short(),
                peer.name,
                join_nets(&peer.addresses),
                peer.endpoints.join(",")
            );
        }
        out
    }
}

fn join_nets(nets: &[IpNet]) -> String {
    nets.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
