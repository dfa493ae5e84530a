//! Pure derivations from (network map, preferences) to engine
//! configuration. Nothing here touches the agent cache or performs
//! I/O; the agent snapshots its inputs and calls down.

use std::net::Ipv4Addr;

use ipnet::IpNet;
use ipnet::Ipv4Net;
use tracing::warn;
use trellis_protocol::NetworkMap;
use trellis_protocol::Prefs;

use crate::engine::DnsConfig;
use crate::engine::DnsMap;
use crate::engine::PeerConfig;
use crate::engine::RouterConfig;
use crate::engine::WgConfig;
use crate::filter::Filter;
use crate::filter::FilterInput;
use crate::filter::FilterRules;

/// Virtual address of the mesh's internal service endpoint; always
/// routed through the tunnel so it is reachable from every node.
pub const TRELLIS_SERVICE_IP: Ipv4Addr = Ipv4Addr::new(100, 100, 100, 100);

/// Name of the tunnel device.
pub const TUN_NAME: &str = "trellis0";

/// Computes the packet filter for the current map and preferences.
///
/// No map means nothing is admitted. Local nets are IPv4 only; the
/// filter layer does not evaluate IPv6 prefixes, so they are dropped
/// here.
pub fn derive_filter(netmap: Option<&NetworkMap>, prefs: &Prefs) -> Filter {
    let Some(nm) = netmap else {
        return Filter::AllowNone;
    };
    let mut local_nets = v4_nets(&nm.addresses);
    local_nets.extend(v4_nets(&prefs.advertise_routes));
    let matches = if prefs.shields_up {
        Vec::new()
    } else {
        nm.packet_filter.clone()
    };
    Filter::Rules(FilterRules {
        matches,
        local_nets,
    })
}

/// The change-detection inputs matching [`derive_filter`].
pub fn filter_input<'a>(netmap: Option<&'a NetworkMap>, prefs: &'a Prefs) -> FilterInput<'a> {
    match netmap {
        None => FilterInput::none(),
        Some(nm) => FilterInput {
            have_netmap: true,
            addresses: &nm.addresses,
            packet_filter: &nm.packet_filter,
            advertise_routes: &prefs.advertise_routes,
            shields_up: prefs.shields_up,
        },
    }
}

fn v4_nets(nets: &[IpNet]) -> Vec<Ipv4Net> {
    nets.iter()
        .filter_map(|net| match net {
            IpNet::V4(v4) => Some(*v4),
            IpNet::V6(_) => None,
        })
        .collect()
}

/// Route-acceptance knobs for [`derive_wg_config`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WgFlags {
    /// Accept a peer's 0.0.0.0/0 or ::/0 route.
    pub allow_default_route: bool,
    /// Accept peer subnet routes.
    pub allow_subnet_routes: bool,
    /// Take the default route as two half-space routes so the
    /// interface default survives.
    pub hack_default_route: bool,
    /// Accept single-host routes.
    pub allow_single_hosts: bool,
}

impl WgFlags {
    pub fn from_prefs(prefs: &Prefs) -> Self {
        Self {
            allow_default_route: prefs.route_all,
            allow_subnet_routes: prefs.route_all,
            hack_default_route: false,
            allow_single_hosts: prefs.allow_single_hosts,
        }
    }
}

/// Builds the tunnel configuration from the map, filtering each peer's
/// allowed prefixes through `flags`.
pub fn derive_wg_config(nm: &NetworkMap, flags: WgFlags) -> WgConfig {
    let mut peers = Vec::with_capacity(nm.peers.len());
    for peer in &nm.peers {
        let mut allowed_ips = Vec::new();
        for net in &peer.allowed_ips {
            if net.prefix_len() == 0 {
                if flags.allow_default_route {
                    if flags.hack_default_route {
                        allowed_ips.extend(half_space_routes(net));
                    } else {
                        allowed_ips.push(*net);
                    }
                }
            } else if is_single_host(net) {
                if flags.allow_single_hosts {
                    allowed_ips.push(*net);
                }
            } else if flags.allow_subnet_routes {
                allowed_ips.push(*net);
            }
        }
        peers.push(PeerConfig {
            public_key: peer.key.clone(),
            allowed_ips,
            endpoints: peer.endpoints.clone(),
            persistent_keepalive: peer.keep_alive.then_some(25),
        });
    }
    WgConfig {
        name: TUN_NAME.to_string(),
        addresses: nm.addresses.clone(),
        peers,
    }
}

fn is_single_host(net: &IpNet) -> bool {
    net.prefix_len() == net.max_prefix_len()
}

fn half_space_routes(net: &IpNet) -> Vec<IpNet> {
    let (low, high): (std::net::IpAddr, std::net::IpAddr) = match net {
        IpNet::V4(_) => (
            Ipv4Addr::UNSPECIFIED.into(),
            Ipv4Addr::new(128, 0, 0, 0).into(),
        ),
        IpNet::V6(_) => (
            std::net::Ipv6Addr::UNSPECIFIED.into(),
            std::net::Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0).into(),
        ),
    };
    [low, high]
        .into_iter()
        .filter_map(|addr| IpNet::new(addr, 1).ok())
        .collect()
}

/// Builds the host routing configuration from the tunnel config.
pub fn derive_router(wg: &WgConfig, prefs: &Prefs) -> RouterConfig {
    let local_addrs = wg
        .addresses
        .iter()
        .map(|net| IpNet::from(net.addr()))
        .collect();
    let mut routes: Vec<IpNet> = Vec::new();
    for peer in &wg.peers {
        for net in &peer.allowed_ips {
            if !routes.contains(net) {
                routes.push(*net);
            }
        }
    }
    let service = IpNet::V4(Ipv4Net::from(TRELLIS_SERVICE_IP));
    if !routes.contains(&service) {
        routes.push(service);
    }
    RouterConfig {
        local_addrs,
        routes,
        subnet_routes: prefs.advertise_routes.clone(),
        snat_subnet_routes: !prefs.no_snat,
        netfilter_mode: prefs.netfilter_mode,
        dns: DnsConfig::default(),
    }
}

/// Builds the resolver configuration from the map's DNS block.
pub fn derive_dns(nm: &NetworkMap, prefs: &Prefs) -> DnsConfig {
    if !prefs.corp_dns {
        return DnsConfig::default();
    }
    let block = &nm.dns;
    let mut proxied = block.proxied;
    if proxied && block.nameservers.is_empty() {
        warn!("proxied DNS requested with no nameservers; running without proxy");
        proxied = false;
    }
    let mut domains = block.domains.clone();
    if proxied {
        let mut with_mesh = domains_for_proxying(nm);
        with_mesh.extend(domains);
        domains = with_mesh;
    }
    DnsConfig {
        nameservers: block.nameservers.clone(),
        domains,
        per_domain: block.per_domain,
        proxied,
    }
}

/// Domain suffixes of every node in the map, insertion-ordered and
/// deduplicated: the part after the first dot of the self name and of
/// each peer name.
pub fn domains_for_proxying(nm: &NetworkMap) -> Vec<String> {
    let mut domains: Vec<String> = Vec::new();
    let names = std::iter::once(nm.name.as_str()).chain(nm.peers.iter().map(|p| p.name.as_str()));
    for name in names {
        let Some((_, suffix)) = name.split_once('.') else {
            continue;
        };
        if suffix.is_empty() {
            continue;
        }
        if !domains.iter().any(|d| d == suffix) {
            domains.push(suffix.to_string());
        }
    }
    domains
}

/// Hostname bindings for the internal resolver: every named node maps
/// to its first mesh address.
pub fn derive_dns_map(nm: &NetworkMap) -> DnsMap {
    let mut map = DnsMap::new();
    if !nm.name.is_empty()
        && let Some(addr) = nm.first_addr()
    {
        map.insert(nm.name.clone(), addr);
    }
    for peer in &nm.peers {
        if peer.name.is_empty() {
            continue;
        }
        if let Some(addr) = peer.first_addr() {
            map.insert(peer.name.clone(), addr);
        }
    }
    map
}

/// Conservative equality for deciding whether the resolver map needs a
/// rebuild. Compares names and first addresses pairwise at the same
/// index, so a mere reordering of peers reads as "not equal" and
/// triggers a harmless rebuild.
pub fn dns_maps_equal(a: Option<&NetworkMap>, b: Option<&NetworkMap>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if a.peers.len() != b.peers.len()
                || a.name != b.name
                || a.first_addr() != b.first_addr()
            {
                return false;
            }
            a.peers
                .iter()
                .zip(&b.peers)
                .all(|(pa, pb)| pa.name == pb.name && pa.first_addr() == pb.first_addr())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use trellis_protocol::NodeKey;
    use trellis_protocol::Peer;
    use trellis_protocol::netmap::DnsBlock;
    use trellis_protocol::netmap::FilterRule;
    use trellis_protocol::prefs::NetfilterMode;

    use super::*;

    #[expect(clippy::unwrap_used)]
    fn net(cidr: &str) -> IpNet {
        cidr.parse().unwrap()
    }

    fn map_with_peer() -> NetworkMap {
        NetworkMap {
            name: "self.corp.mesh.net.".to_string(),
            addresses: vec![net("100.64.0.1/32"), net("fd7a::1/128")],
            peers: vec![Peer {
                name: "peer.corp.mesh.net.".to_string(),
                key: NodeKey("nkey:peer1".to_string()),
                addresses: vec![net("100.64.0.2/32")],
                allowed_ips: vec![
                    net("100.64.0.2/32"),
                    net("192.168.7.0/24"),
                    net("0.0.0.0/0"),
                ],
                endpoints: vec!["203.0.113.9:41641".to_string()],
                keep_alive: true,
                ..Default::default()
            }],
            packet_filter: vec![FilterRule {
                srcs: vec![net("100.64.0.0/10")],
                dsts: vec![],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn no_map_means_allow_none() {
        assert_eq!(
            derive_filter(None, &Prefs::default()),
            Filter::AllowNone
        );
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn shields_up_keeps_local_nets_but_no_matches() {
        let nm = map_with_peer();
        let prefs = Prefs {
            shields_up: true,
            advertise_routes: vec![net("10.1.0.0/16")],
            ..Default::default()
        };
        match derive_filter(Some(&nm), &prefs) {
            Filter::Rules(rules) => {
                assert!(rules.matches.is_empty());
                // IPv6 self address dropped, advertised route kept.
                assert_eq!(
                    rules.local_nets,
                    vec![
                        "100.64.0.1/32".parse::<Ipv4Net>().unwrap(),
                        "10.1.0.0/16".parse::<Ipv4Net>().unwrap(),
                    ]
                );
            }
            Filter::AllowNone => panic!("expected rules"),
        }
    }

    #[test]
    fn wg_flags_gate_routes() {
        let nm = map_with_peer();

        let open = derive_wg_config(
            &nm,
            WgFlags {
                allow_default_route: true,
                allow_subnet_routes: true,
                hack_default_route: false,
                allow_single_hosts: true,
            },
        );
        assert_eq!(open.peers[0].allowed_ips.len(), 3);
        assert_eq!(open.peers[0].persistent_keepalive, Some(25));

        let closed = derive_wg_config(&nm, WgFlags::default());
        assert!(closed.peers[0].allowed_ips.is_empty());

        let hosts_only = derive_wg_config(
            &nm,
            WgFlags {
                allow_single_hosts: true,
                ..Default::default()
            },
        );
        assert_eq!(hosts_only.peers[0].allowed_ips, vec![net("100.64.0.2/32")]);
    }

    #[test]
    fn default_route_hack_splits_in_half() {
        let nm = map_with_peer();
        let cfg = derive_wg_config(
            &nm,
            WgFlags {
                allow_default_route: true,
                hack_default_route: true,
                allow_subnet_routes: false,
                allow_single_hosts: false,
            },
        );
        assert_eq!(
            cfg.peers[0].allowed_ips,
            vec![net("0.0.0.0/1"), net("128.0.0.0/1")]
        );
    }

    #[test]
    fn router_adds_service_route_and_masks_local_addrs() {
        let nm = map_with_peer();
        let prefs = Prefs {
            advertise_routes: vec![net("10.1.0.0/16")],
            no_snat: true,
            netfilter_mode: NetfilterMode::NoDivert,
            ..Default::default()
        };
        let wg = derive_wg_config(&nm, WgFlags::from_prefs(&prefs));
        let router = derive_router(&wg, &prefs);

        assert!(router.local_addrs.contains(&net("100.64.0.1/32")));
        assert!(router.routes.contains(&IpNet::V4(Ipv4Net::from(TRELLIS_SERVICE_IP))));
        assert_eq!(router.subnet_routes, vec![net("10.1.0.0/16")]);
        assert!(!router.snat_subnet_routes);
        assert_eq!(router.netfilter_mode, NetfilterMode::NoDivert);
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn corp_dns_off_means_zero_config() {
        let mut nm = map_with_peer();
        nm.dns = DnsBlock {
            nameservers: vec!["100.100.100.100".parse().unwrap()],
            ..Default::default()
        };
        let prefs = Prefs {
            corp_dns: false,
            ..Default::default()
        };
        assert_eq!(derive_dns(&nm, &prefs), DnsConfig::default());
    }

    #[test]
    fn proxied_without_nameservers_downgrades() {
        let mut nm = map_with_peer();
        nm.dns = DnsBlock {
            proxied: true,
            ..Default::default()
        };
        let dns = derive_dns(&nm, &Prefs::default());
        assert!(!dns.proxied);
        assert!(dns.domains.is_empty());
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn proxied_prepends_mesh_domains() {
        let mut nm = map_with_peer();
        nm.dns = DnsBlock {
            nameservers: vec!["100.100.100.100".parse().unwrap()],
            domains: vec!["corp.example.com".to_string()],
            proxied: true,
            ..Default::default()
        };
        let dns = derive_dns(&nm, &Prefs::default());
        assert!(dns.proxied);
        assert_eq!(
            dns.domains,
            vec!["corp.mesh.net.".to_string(), "corp.example.com".to_string()]
        );
    }

    #[test]
    fn proxy_domains_deduplicate_in_order() {
        let nm = map_with_peer();
        // Self and the peer share a suffix; it appears once.
        assert_eq!(domains_for_proxying(&nm), vec!["corp.mesh.net.".to_string()]);
    }

    #[test]
    #[expect(clippy::unwrap_used)]
    fn dns_map_binds_self_and_peers() {
        let nm = map_with_peer();
        let map = derive_dns_map(&nm);
        assert_eq!(
            map.get("self.corp.mesh.net."),
            Some(&"100.64.0.1".parse().unwrap())
        );
        assert_eq!(
            map.get("peer.corp.mesh.net."),
            Some(&"100.64.0.2".parse().unwrap())
        );
    }

    #[test]
    fn dns_maps_equal_is_reflexive_but_order_sensitive() {
        let mut nm = map_with_peer();
        nm.peers.push(Peer {
            name: "second.corp.mesh.net.".to_string(),
            addresses: vec![net("100.64.0.3/32")],
            ..Default::default()
        });
        assert!(dns_maps_equal(Some(&nm), Some(&nm)));
        assert!(dns_maps_equal(None, None));
        assert!(!dns_maps_equal(Some(&nm), None));

        let mut reordered = nm.clone();
        reordered.peers.reverse();
        assert!(!dns_maps_equal(Some(&nm), Some(&reordered)));
    }
}
