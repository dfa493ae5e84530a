//! The consumed surface of the data-plane engine.
//!
//! The real engine terminates tunnels, programs routes and the
//! resolver, and reports live peer statistics. The agent only ever
//! talks to this trait; tests and the daemon's bring-up path use
//! [`NullEngine`].

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;

use ipnet::IpNet;
use thiserror::Error;
use tracing::debug;
use trellis_protocol::DerpMap;
use trellis_protocol::DiscoKey;
use trellis_protocol::EngineStatus;
use trellis_protocol::NetInfo;
use trellis_protocol::NetworkMap;
use trellis_protocol::NodeKey;
use trellis_protocol::PingResult;
use trellis_protocol::StatusBuilder;
use trellis_protocol::prefs::NetfilterMode;

use crate::filter::Filter;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The submitted configuration matches what is already programmed.
    /// Callers treat this as success and skip their logging.
    #[error("no config changes")]
    NoChanges,

    #[error("engine is closed")]
    Closed,

    #[error("reconfig failed: {0}")]
    Reconfig(String),
}

/// One peer in the tunnel configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerConfig {
    pub public_key: NodeKey,
    pub allowed_ips: Vec<IpNet>,
    pub endpoints: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

/// Tunnel device configuration handed to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WgConfig {
    pub name: String,
    pub addresses: Vec<IpNet>,
    pub peers: Vec<PeerConfig>,
}

/// Resolver configuration carried inside [`RouterConfig`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DnsConfig {
    pub nameservers: Vec<IpAddr>,
    pub domains: Vec<String>,
    pub per_domain: bool,
    pub proxied: bool,
}

/// Host routing and firewall configuration handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// Addresses to assign to the tunnel device, full-length prefixes.
    pub local_addrs: Vec<IpNet>,
    /// Everything reachable through the tunnel.
    pub routes: Vec<IpNet>,
    /// Subnets this node routes for the mesh.
    pub subnet_routes: Vec<IpNet>,
    pub snat_subnet_routes: bool,
    pub netfilter_mode: NetfilterMode,
    pub dns: DnsConfig,
}

impl RouterConfig {
    /// The configuration of a stopped node: nothing routed, firewall
    /// left alone.
    pub fn empty() -> Self {
        Self {
            local_addrs: Vec::new(),
            routes: Vec::new(),
            subnet_routes: Vec::new(),
            snat_subnet_routes: false,
            netfilter_mode: NetfilterMode::Off,
            dns: DnsConfig::default(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::empty()
    }
}

/// Mesh hostname to address bindings for the internal resolver.
pub type DnsMap = BTreeMap<String, IpAddr>;

pub type StatusCallback = Box<dyn Fn(Result<EngineStatus, EngineError>) + Send + Sync>;
pub type NetInfoCallback = Box<dyn Fn(NetInfo) + Send + Sync>;
pub type PingCallback = Box<dyn FnOnce(PingResult) + Send>;

/// Data-plane engine, as consumed by the agent.
pub trait Engine: Send + Sync {
    /// Installs a packet filter. The agent guarantees it only calls
    /// this when the filter actually changed.
    fn set_filter(&self, filter: Filter);

    fn get_filter(&self) -> Filter;

    /// Hands the engine the latest network map for its own use
    /// (endpoint discovery, peer metadata).
    fn set_network_map(&self, netmap: &Arc<NetworkMap>);

    /// Installs the relay table; `None` disables relaying.
    fn set_derp_map(&self, derp_map: Option<DerpMap>);

    fn set_dns_map(&self, dns_map: DnsMap);

    /// Applies tunnel and router configuration.
    fn reconfig(&self, wg: &WgConfig, router: &RouterConfig) -> Result<(), EngineError>;

    fn ping(&self, ip: IpAddr, callback: PingCallback);

    fn set_status_callback(&self, callback: StatusCallback);

    fn set_net_info_callback(&self, callback: NetInfoCallback);

    /// Asks for a fresh status, delivered via the status callback.
    fn request_status(&self);

    /// Contributes peer statistics to an overall status report.
    fn update_status(&self, builder: &mut StatusBuilder);

    fn disco_public_key(&self) -> DiscoKey;

    fn close(&self);

    /// Blocks until the engine has fully shut down.
    fn wait(&self);
}

#[derive(Default)]
struct NullEngineInner {
    filter: Filter,
    last_config: Option<(WgConfig, RouterConfig)>,
    status_callback: Option<Arc<StatusCallback>>,
    closed: bool,
}

/// An engine that accepts every configuration and reports an empty
/// status. Lets the agent run where no data plane is available.
#[derive(Default)]
pub struct NullEngine {
    inner: Mutex<NullEngineInner>,
}

impl NullEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for NullEngine {
    fn set_filter(&self, filter: Filter) {
        self.inner.lock().unwrap().filter = filter;
    }

    fn get_filter(&self) -> Filter {
        self.inner.lock().unwrap().filter.clone()
    }

    fn set_network_map(&self, netmap: &Arc<NetworkMap>) {
        debug!(peers = netmap.peers.len(), "null engine: network map");
    }

    fn set_derp_map(&self, derp_map: Option<DerpMap>) {
        debug!(enabled = derp_map.is_some(), "null engine: derp map");
    }

    fn set_dns_map(&self, dns_map: DnsMap) {
        debug!(entries = dns_map.len(), "null engine: dns map");
    }

    fn reconfig(&self, wg: &WgConfig, router: &RouterConfig) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(EngineError::Closed);
        }
        let config = (wg.clone(), router.clone());
        if inner.last_config.as_ref() == Some(&config) {
            return Err(EngineError::NoChanges);
        }
        inner.last_config = Some(config);
        Ok(())
    }

    fn ping(&self, ip: IpAddr, callback: PingCallback) {
        callback(PingResult {
            ip: ip.to_string(),
            err: "no live peers".to_string(),
            ..Default::default()
        });
    }

    fn set_status_callback(&self, callback: StatusCallback) {
        self.inner.lock().unwrap().status_callback = Some(Arc::new(callback));
    }

    fn set_net_info_callback(&self, _callback: NetInfoCallback) {}

    fn request_status(&self) {
        let callback = self.inner.lock().unwrap().status_callback.clone();
        if let Some(callback) = callback {
            callback(Ok(EngineStatus::default()));
        }
    }

    fn update_status(&self, _builder: &mut StatusBuilder) {}

    fn disco_public_key(&self) -> DiscoKey {
        DiscoKey("disco:null".to_string())
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }

    fn wait(&self) {}
}
