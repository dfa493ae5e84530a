//! Port-list polling.
//!
//! The scanner itself lives behind [`PortLister`]; the agent only
//! cares about receiving changed lists and turning them into the
//! services advertised to the control plane.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use trellis_protocol::Service;
use trellis_protocol::ServiceProto;

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One listening socket on this host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Port {
    pub proto: ServiceProto,
    pub port: u16,
    /// Name of the listening process, when known.
    pub process: String,
}

/// Produces the current set of listening ports.
pub trait PortLister: Send + Sync {
    fn poll(&self) -> io::Result<Vec<Port>>;
}

/// A lister over a fixed, settable port list. The default value lists
/// nothing, which suits hosts where scanning is unavailable.
#[derive(Default)]
pub struct StaticPortLister {
    ports: Mutex<Vec<Port>>,
}

impl StaticPortLister {
    pub fn new(ports: Vec<Port>) -> Self {
        Self {
            ports: Mutex::new(ports),
        }
    }

    pub fn set_ports(&self, ports: Vec<Port>) {
        *self.ports.lock().unwrap() = ports;
    }
}

impl PortLister for StaticPortLister {
    fn poll(&self) -> io::Result<Vec<Port>> {
        Ok(self.ports.lock().unwrap().clone())
    }
}

struct OsPolicy {
    os: &'static str,
    ignore_ports: &'static [u16],
    ignore_processes: &'static [&'static str],
}

// mDNS and LLMNR listeners exist on effectively every host and carry
// no routing value; per-OS entries cover the usual system daemons.
static POLICIES: &[OsPolicy] = &[
    OsPolicy {
        os: "linux",
        ignore_ports: &[5353],
        ignore_processes: &["systemd-resolve", "rpcbind", "avahi-daemon"],
    },
    OsPolicy {
        os: "macos",
        ignore_ports: &[5353, 7000],
        ignore_processes: &["rapportd", "sharingd", "mDNSResponder"],
    },
    OsPolicy {
        os: "windows",
        ignore_ports: &[5353, 5355],
        ignore_processes: &["svchost.exe"],
    },
];

static DEFAULT_POLICY: OsPolicy = OsPolicy {
    os: "",
    ignore_ports: &[5353],
    ignore_processes: &[],
};

/// Filters a polled port list down to the services worth advertising
/// on the given OS.
pub fn interesting_services(ports: &[Port], os: &str) -> Vec<Service> {
    let policy = POLICIES
        .iter()
        .find(|p| p.os == os)
        .unwrap_or(&DEFAULT_POLICY);
    ports
        .iter()
        .filter(|port| port.port != 0)
        .filter(|port| !policy.ignore_ports.contains(&port.port))
        .filter(|port| !policy.ignore_processes.contains(&port.process.as_str()))
        .map(|port| Service {
            proto: port.proto,
            port: port.port,
            description: port.process.clone(),
        })
        .collect()
}

/// Polls `lister` until cancellation, delivering only changed lists.
///
/// Runs as two workers: a producer that owns the poll cadence and a
/// consumer that hands each changed list to `on_change`. Delivery can
/// block on the agent's side effects without stalling the next poll.
pub(crate) fn spawn_poller(
    lister: Arc<dyn PortLister>,
    token: CancellationToken,
    on_change: impl Fn(Vec<Port>) + Send + 'static,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Port>>();

    tokio::spawn({
        let token = token.clone();
        async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            let mut last: Option<Vec<Port>> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let mut ports = match lister.poll() {
                            Ok(ports) => ports,
                            Err(e) => {
                                debug!("port poll failed: {e}");
                                continue;
                            }
                        };
                        ports.sort();
                        if last.as_ref() == Some(&ports) {
                            continue;
                        }
                        last = Some(ports.clone());
                        if tx.send(ports).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("port producer exiting");
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                ports = rx.recv() => {
                    let Some(ports) = ports else {
                        break;
                    };
                    on_change(ports);
                }
            }
        }
        debug!("port consumer exiting");
    });
}
