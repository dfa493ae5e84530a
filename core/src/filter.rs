//! Packet filter model and change detection.
//!
//! The engine is handed a compiled [`Filter`]; the agent decides when
//! a recompile is needed by hashing the inputs that feed the
//! derivation. The hash must be stable across runs, so it is computed
//! over an explicit type-tagged, length-prefixed encoding rather than
//! anything that depends on in-memory layout.

use ipnet::IpNet;
use ipnet::Ipv4Net;
use sha1::Digest;
use sha1::Sha1;
use trellis_protocol::netmap::FilterRule;

/// Compiled packet filter, as installed into the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Filter {
    /// Deny every inbound packet.
    #[default]
    AllowNone,
    /// Admit inbound flows matching `matches`, scoped to traffic
    /// destined for `local_nets`.
    Rules(FilterRules),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterRules {
    pub matches: Vec<FilterRule>,
    /// This node's own networks: mesh addresses plus advertised
    /// routes, IPv4 only.
    pub local_nets: Vec<Ipv4Net>,
}

/// Digest over everything [`crate::derive::derive_filter`] looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterHash([u8; 20]);

/// Inputs to the filter derivation, in hashing order.
pub struct FilterInput<'a> {
    pub have_netmap: bool,
    pub addresses: &'a [IpNet],
    pub packet_filter: &'a [FilterRule],
    pub advertise_routes: &'a [IpNet],
    pub shields_up: bool,
}

impl FilterInput<'_> {
    /// The inputs of a node with no network map.
    pub fn none() -> FilterInput<'static> {
        FilterInput {
            have_netmap: false,
            addresses: &[],
            packet_filter: &[],
            advertise_routes: &[],
            shields_up: false,
        }
    }
}

pub fn filter_hash(input: &FilterInput<'_>) -> FilterHash {
    let mut enc = Encoder::default();
    enc.flag(b'n', input.have_netmap);
    enc.nets(b'a', input.addresses);
    enc.count(b'f', input.packet_filter.len());
    for rule in input.packet_filter {
        enc.nets(b's', &rule.srcs);
        enc.count(b'd', rule.dsts.len());
        for dst in &rule.dsts {
            enc.net(b'D', &dst.net);
            enc.port(dst.ports.first);
            enc.port(dst.ports.last);
        }
    }
    enc.nets(b'r', input.advertise_routes);
    enc.flag(b'u', input.shields_up);
    FilterHash(Sha1::digest(&enc.buf).into())
}

/// Type-tagged, length-prefixed byte encoding feeding the hash.
#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn flag(&mut self, tag: u8, value: bool) {
        self.buf.push(tag);
        self.buf.push(u8::from(value));
    }

    fn count(&mut self, tag: u8, count: usize) {
        self.buf.push(tag);
        self.buf.extend_from_slice(&(count as u32).to_le_bytes());
    }

    fn port(&mut self, port: u16) {
        self.buf.push(b'p');
        self.buf.extend_from_slice(&port.to_le_bytes());
    }

    fn net(&mut self, tag: u8, net: &IpNet) {
        let text = net.to_string();
        self.buf.push(tag);
        self.buf.extend_from_slice(&(text.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(text.as_bytes());
    }

    fn nets(&mut self, tag: u8, nets: &[IpNet]) {
        self.count(tag, nets.len());
        for net in nets {
            self.net(tag, net);
        }
    }
}
