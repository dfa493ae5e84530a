use ipnet::IpNet;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::key::MachineKey;
use crate::key::NodeKey;

/// Default coordination server when no preference blob exists yet.
pub const DEFAULT_CONTROL_URL: &str = "https://control.trellis.net";

/// How aggressively the router layer manages the host firewall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetfilterMode {
    /// Leave the host firewall alone.
    Off,
    /// Install rules but do not divert existing chains.
    NoDivert,
    #[default]
    On,
}

/// Long-lived node identity owned by the control plane.
///
/// Frontends can read this back out of [`Prefs`] but can never write
/// it: the agent discards any `persist` arriving via `SetPrefs` and
/// only accepts replacements from the control client or the state
/// store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Persist {
    pub private_machine_key: MachineKey,
    pub private_node_key: NodeKey,
    pub login_name: String,
    pub provider: String,
    pub oauth2_refresh_token: String,
}

/// User-controlled preferences for this node.
///
/// Value semantics: the agent hands out clones, never references into
/// its cache. Persisted to the state store through [`Prefs::to_bytes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prefs {
    /// Base URL of the coordination server.
    pub control_url: String,
    /// Whether the user wants the tunnel up at all.
    pub want_running: bool,
    /// Accept default and subnet routes advertised by peers.
    pub route_all: bool,
    /// Accept single-host (/32) routes from peers.
    pub allow_single_hosts: bool,
    /// Use the DNS configuration sent down in the network map.
    pub corp_dns: bool,
    /// Drop all inbound traffic and advertise no services.
    pub shields_up: bool,
    /// Do not fall back to relays when direct paths fail.
    pub disable_derp: bool,
    /// Disable source NAT for advertised subnet routes.
    pub no_snat: bool,
    pub netfilter_mode: NetfilterMode,
    /// Subnets this node offers to route for the rest of the mesh.
    pub advertise_routes: Vec<IpNet>,
    /// ACL tags requested for this node.
    pub advertise_tags: Vec<String>,
    /// Hostname override; empty means use the OS hostname.
    pub hostname: String,
    /// OS version override advertised to the control plane.
    pub os_version: String,
    /// Device model override advertised to the control plane.
    pub device_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist: Option<Persist>,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            control_url: DEFAULT_CONTROL_URL.to_string(),
            want_running: true,
            route_all: true,
            allow_single_hosts: true,
            corp_dns: true,
            shields_up: false,
            disable_derp: false,
            no_snat: false,
            netfilter_mode: NetfilterMode::On,
            advertise_routes: Vec::new(),
            advertise_tags: Vec::new(),
            hostname: String::new(),
            os_version: String::new(),
            device_model: String::new(),
            persist: None,
        }
    }
}

impl Prefs {
    /// Serializes to the self-describing byte encoding used by the
    /// state store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Inverse of [`Prefs::to_bytes`]. Rejects malformed input; fields
    /// absent from the blob fall back to their defaults so old blobs
    /// keep loading.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    #[expect(clippy::unwrap_used)]
    fn bytes_round_trip() {
        let mut prefs = Prefs {
            want_running: false,
            shields_up: true,
            advertise_tags: vec!["tag:server".to_string()],
            hostname: "beehive".to_string(),
            ..Default::default()
        };
        prefs.persist = Some(Persist {
            login_name: "maple@example.com".to_string(),
            ..Default::default()
        });

        let bytes = prefs.to_bytes().unwrap();
        let back = Prefs::from_bytes(&bytes).unwrap();
        assert_eq!(prefs, back);
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        assert!(Prefs::from_bytes(b"not json").is_err());
        assert!(Prefs::from_bytes(b"[1, 2, 3]").is_err());
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn missing_fields_default() {
        let prefs = Prefs::from_bytes(b"{\"want_running\": false}").unwrap();
        assert!(!prefs.want_running);
        assert!(prefs.corp_dns);
        assert_eq!(prefs.control_url, DEFAULT_CONTROL_URL);
        assert_eq!(prefs.netfilter_mode, NetfilterMode::On);
    }
}
