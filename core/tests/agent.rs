//! End-to-end tests driving a [`LocalAgent`] through fake engine and
//! control-plane implementations.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc;

use pretty_assertions::assert_eq;
use trellis_core::AgentError;
use trellis_core::CommandHandler;
use trellis_core::Handled;
use trellis_core::LocalAgent;
use trellis_core::control::ControlClient;
use trellis_core::control::ControlFactory;
use trellis_core::control::ControlOptions;
use trellis_core::control::ControlStatus;
use trellis_core::control::ControlStatusCallback;
use trellis_core::control::LoginMode;
use trellis_core::engine::DnsMap;
use trellis_core::engine::Engine;
use trellis_core::engine::EngineError;
use trellis_core::engine::NetInfoCallback;
use trellis_core::engine::PingCallback;
use trellis_core::engine::RouterConfig;
use trellis_core::engine::StatusCallback;
use trellis_core::engine::WgConfig;
use trellis_core::filter::Filter;
use trellis_core::portlist::StaticPortLister;
use trellis_core::protocol::Command;
use trellis_core::protocol::CommandOp;
use trellis_core::protocol::DerpMap;
use trellis_core::protocol::EngineStatus;
use trellis_core::protocol::Hostinfo;
use trellis_core::protocol::LifecycleState;
use trellis_core::protocol::NetInfo;
use trellis_core::protocol::NetworkMap;
use trellis_core::protocol::NodeKey;
use trellis_core::protocol::Notify;
use trellis_core::protocol::OauthToken;
use trellis_core::protocol::Persist;
use trellis_core::protocol::PingResult;
use trellis_core::protocol::Prefs;
use trellis_core::protocol::StartOptions;
use trellis_core::protocol::netmap::FilterRule;
use trellis_core::protocol::netmap::MachineStatus;
use trellis_core::protocol::netmap::Peer;
use trellis_core::protocol::status::StatusBuilder;
use trellis_core::protocol::version;
use trellis_core::store::MemoryStore;
use trellis_core::store::StateKey;
use trellis_core::store::StateStore;

#[derive(Default)]
struct FakeEngineInner {
    filters: Vec<Filter>,
    reconfigs: Vec<(WgConfig, RouterConfig)>,
    netmaps_pushed: usize,
    derp_maps: Vec<bool>,
    dns_maps: Vec<DnsMap>,
    status_callback: Option<Arc<StatusCallback>>,
    next_status: EngineStatus,
    closed: bool,
}

#[derive(Default)]
struct FakeEngine {
    inner: Mutex<FakeEngineInner>,
}

impl FakeEngine {
    fn set_next_status(&self, status: EngineStatus) {
        self.inner.lock().unwrap().next_status = status;
    }

    /// Delivers the configured status as if the engine produced it on
    /// its own.
    fn deliver_status(&self) {
        let (callback, status) = {
            let inner = self.inner.lock().unwrap();
            (inner.status_callback.clone(), inner.next_status.clone())
        };
        if let Some(callback) = callback {
            callback(Ok(status));
        }
    }

    fn filters(&self) -> Vec<Filter> {
        self.inner.lock().unwrap().filters.clone()
    }

    fn last_filter(&self) -> Option<Filter> {
        self.inner.lock().unwrap().filters.last().cloned()
    }

    fn reconfig_count(&self) -> usize {
        self.inner.lock().unwrap().reconfigs.len()
    }

    fn derp_maps(&self) -> Vec<bool> {
        self.inner.lock().unwrap().derp_maps.clone()
    }

    fn closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl Engine for FakeEngine {
    fn set_filter(&self, filter: Filter) {
        self.inner.lock().unwrap().filters.push(filter);
    }

    fn get_filter(&self) -> Filter {
        self.last_filter().unwrap_or_default()
    }

    fn set_network_map(&self, _netmap: &Arc<NetworkMap>) {
        self.inner.lock().unwrap().netmaps_pushed += 1;
    }

    fn set_derp_map(&self, derp_map: Option<DerpMap>) {
        self.inner.lock().unwrap().derp_maps.push(derp_map.is_some());
    }

    fn set_dns_map(&self, dns_map: DnsMap) {
        self.inner.lock().unwrap().dns_maps.push(dns_map);
    }

    fn reconfig(&self, wg: &WgConfig, router: &RouterConfig) -> Result<(), EngineError> {
        self.inner
            .lock()
            .unwrap()
            .reconfigs
            .push((wg.clone(), router.clone()));
        Ok(())
    }

    fn ping(&self, ip: IpAddr, callback: PingCallback) {
        callback(PingResult {
            ip: ip.to_string(),
            node_name: "peer.mesh.test.".to_string(),
            latency_seconds: 0.013,
            ..Default::default()
        });
    }

    fn set_status_callback(&self, callback: StatusCallback) {
        self.inner.lock().unwrap().status_callback = Some(Arc::new(callback));
    }

    fn set_net_info_callback(&self, _callback: NetInfoCallback) {}

    fn request_status(&self) {
        self.deliver_status();
    }

    fn update_status(&self, builder: &mut StatusBuilder) {
        let peers = self.inner.lock().unwrap().next_status.peers.clone();
        for peer in peers {
            builder.add_peer(peer);
        }
    }

    fn disco_public_key(&self) -> trellis_core::protocol::DiscoKey {
        trellis_core::protocol::DiscoKey("disco:fake".to_string())
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }

    fn wait(&self) {}
}

#[derive(Default)]
struct FakeControlInner {
    status_callback: Option<Arc<ControlStatusCallback>>,
    logins: Vec<(LoginMode, bool)>,
    logouts: usize,
    shutdowns: usize,
    hostinfos: Vec<Hostinfo>,
    pauses: Vec<bool>,
    endpoint_updates: Vec<Vec<String>>,
    auth_cant_continue: bool,
    options: Vec<ControlOptions>,
}

struct FakeControl {
    inner: Mutex<FakeControlInner>,
}

impl Default for FakeControl {
    fn default() -> Self {
        Self {
            inner: Mutex::new(FakeControlInner {
                auth_cant_continue: true,
                ..Default::default()
            }),
        }
    }
}

impl FakeControl {
    /// Delivers a status as if it came from the coordination server.
    fn push_status(&self, status: ControlStatus) {
        let callback = self.inner.lock().unwrap().status_callback.clone();
        callback.expect("agent registered no status callback")(status);
    }

    fn set_auth_cant_continue(&self, value: bool) {
        self.inner.lock().unwrap().auth_cant_continue = value;
    }

    fn logins(&self) -> Vec<(LoginMode, bool)> {
        self.inner.lock().unwrap().logins.clone()
    }

    fn last_hostinfo(&self) -> Option<Hostinfo> {
        self.inner.lock().unwrap().hostinfos.last().cloned()
    }

    fn logouts(&self) -> usize {
        self.inner.lock().unwrap().logouts
    }

    fn shutdowns(&self) -> usize {
        self.inner.lock().unwrap().shutdowns
    }

    fn endpoint_updates(&self) -> Vec<Vec<String>> {
        self.inner.lock().unwrap().endpoint_updates.clone()
    }
}

impl ControlClient for FakeControl {
    fn set_status_callback(&self, callback: ControlStatusCallback) {
        self.inner.lock().unwrap().status_callback = Some(Arc::new(callback));
    }

    fn login(&self, token: Option<OauthToken>, mode: LoginMode) {
        self.inner.lock().unwrap().logins.push((mode, token.is_some()));
    }

    fn logout(&self) {
        self.inner.lock().unwrap().logouts += 1;
    }

    fn set_paused(&self, paused: bool) {
        self.inner.lock().unwrap().pauses.push(paused);
    }

    fn update_endpoints(&self, _client_version: u32, endpoints: Vec<String>) {
        self.inner.lock().unwrap().endpoint_updates.push(endpoints);
    }

    fn set_hostinfo(&self, hostinfo: &Hostinfo) {
        self.inner.lock().unwrap().hostinfos.push(hostinfo.clone());
    }

    fn set_netinfo(&self, _net_info: &NetInfo) {}

    fn auth_cant_continue(&self) -> bool {
        self.inner.lock().unwrap().auth_cant_continue
    }

    fn shutdown(&self) {
        self.inner.lock().unwrap().shutdowns += 1;
    }
}

struct Harness {
    agent: Arc<LocalAgent>,
    engine: Arc<FakeEngine>,
    control: Arc<FakeControl>,
    store: Arc<MemoryStore>,
    notifications: mpsc::Receiver<Notify>,
}

impl Harness {
    fn new() -> Self {
        let engine = Arc::new(FakeEngine::default());
        let control = Arc::new(FakeControl::default());
        let store = Arc::new(MemoryStore::new());
        let factory: ControlFactory = {
            let control = control.clone();
            Box::new(move |options| {
                control.inner.lock().unwrap().options.push(options);
                Ok(control.clone())
            })
        };
        let agent = LocalAgent::new(
            "test-backend-log".to_string(),
            engine.clone(),
            store.clone(),
            factory,
            Arc::new(StaticPortLister::default()),
        );
        let (tx, notifications) = mpsc::channel();
        agent.set_notify_callback(Some(Box::new(move |notify| {
            let _ = tx.send(notify);
        })));
        Self {
            agent,
            engine,
            control,
            store,
            notifications,
        }
    }

    fn drain(&self) -> Vec<Notify> {
        self.notifications.try_iter().collect()
    }

    fn start(&self, key: &str) {
        self.agent
            .start(StartOptions {
                state_key: key.to_string(),
                ..Default::default()
            })
            .unwrap();
    }

    /// Drives the harness to `Running` with one authorized peer.
    fn run_up(&self) -> NetworkMap {
        self.start("user-1");
        self.control.push_status(ControlStatus::default());
        assert_eq!(self.agent.state(), LifecycleState::NeedsLogin);

        self.control.set_auth_cant_continue(false);
        let map = authorized_map();
        self.control.push_status(ControlStatus {
            login_finished: true,
            persist: Some(test_persist()),
            net_map: Some(map.clone()),
            ..Default::default()
        });
        assert_eq!(self.agent.state(), LifecycleState::Starting);

        self.engine.set_next_status(EngineStatus {
            num_live: 1,
            local_addrs: vec!["203.0.113.5:41641".to_string()],
            ..Default::default()
        });
        self.engine.deliver_status();
        assert_eq!(self.agent.state(), LifecycleState::Running);
        map
    }
}

fn test_persist() -> Persist {
    Persist {
        login_name: "maple@example.com".to_string(),
        provider: "example".to_string(),
        ..Default::default()
    }
}

fn authorized_map() -> NetworkMap {
    NetworkMap {
        name: "self.mesh.test.".to_string(),
        node_key: NodeKey("nkey:self".to_string()),
        addresses: vec!["100.64.0.1/32".parse().unwrap()],
        machine_status: MachineStatus::Authorized,
        peers: vec![Peer {
            name: "peer.mesh.test.".to_string(),
            key: NodeKey("nkey:peer".to_string()),
            addresses: vec!["100.64.0.2/32".parse().unwrap()],
            allowed_ips: vec!["100.64.0.2/32".parse().unwrap()],
            endpoints: vec!["203.0.113.9:41641".to_string()],
            ..Default::default()
        }],
        packet_filter: vec![FilterRule {
            srcs: vec!["100.64.0.0/10".parse().unwrap()],
            dsts: vec![],
        }],
        derp_map: Some(DerpMap::default()),
        ..Default::default()
    }
}

#[test]
fn start_requires_prefs_or_state_key() {
    let h = Harness::new();
    assert!(matches!(
        h.agent.start(StartOptions::default()),
        Err(AgentError::NoStateSource)
    ));
}

#[test]
fn cold_start_fresh_user() {
    let h = Harness::new();
    h.start("user-1");

    let notifications = h.drain();
    assert_eq!(
        notifications[0].backend_log_id.as_deref(),
        Some("test-backend-log")
    );
    let prefs = notifications[1].prefs.as_deref().unwrap();
    assert_eq!(*prefs, Prefs::default());
    // A background login was kicked off without a token.
    assert_eq!(h.control.logins(), vec![(LoginMode::Default, false)]);
    // The control client was built for the default coordination
    // server with this node's hostinfo.
    let options = h.control.inner.lock().unwrap().options.clone();
    assert_eq!(options.len(), 1);
    assert_eq!(
        options[0].server_url,
        trellis_core::protocol::prefs::DEFAULT_CONTROL_URL
    );
    assert_eq!(options[0].hostinfo.backend_log_id, "test-backend-log");

    // First control status: no map, auth stuck on a human.
    h.control.push_status(ControlStatus::default());
    assert_eq!(h.agent.state(), LifecycleState::NeedsLogin);
    let states: Vec<_> = h.drain().into_iter().filter_map(|n| n.state).collect();
    assert_eq!(states, vec![LifecycleState::NeedsLogin]);

    // Interactive login: URL arrives, browser notification goes out.
    h.agent.start_login_interactive();
    assert_eq!(h.control.logins().len(), 2);
    h.control.push_status(ControlStatus {
        url: Some("https://auth.mesh.test/c/abc".to_string()),
        ..Default::default()
    });
    let urls: Vec<_> = h
        .drain()
        .into_iter()
        .filter_map(|n| n.browse_to_url)
        .collect();
    assert_eq!(urls, vec!["https://auth.mesh.test/c/abc".to_string()]);
}

#[test]
fn login_completes_and_promotes_to_running() {
    let h = Harness::new();
    h.start("user-1");
    h.control.push_status(ControlStatus::default());
    h.drain();

    h.control.set_auth_cant_continue(false);
    h.control.push_status(ControlStatus {
        login_finished: true,
        persist: Some(test_persist()),
        net_map: Some(authorized_map()),
        ..Default::default()
    });

    let notifications = h.drain();
    let prefs: Vec<_> = notifications.iter().filter_map(|n| n.prefs.as_deref()).collect();
    assert_eq!(prefs.len(), 1);
    assert_eq!(prefs[0].persist.as_ref(), Some(&test_persist()));
    assert!(prefs[0].want_running);
    assert!(notifications.iter().any(|n| n.login_finished.is_some()));
    assert!(notifications.iter().any(|n| n.net_map.is_some()));
    let states: Vec<_> = notifications.iter().filter_map(|n| n.state).collect();
    assert_eq!(states, vec![LifecycleState::Starting]);

    // The filter came from the map, not shields.
    match h.engine.last_filter().unwrap() {
        Filter::Rules(rules) => assert_eq!(rules.matches.len(), 1),
        Filter::AllowNone => panic!("expected a rules filter"),
    }

    // The map itself and the resolver bindings reached the engine.
    {
        let engine = h.engine.inner.lock().unwrap();
        assert_eq!(engine.netmaps_pushed, 1);
        assert_eq!(engine.dns_maps.len(), 1);
        assert!(engine.dns_maps[0].contains_key("peer.mesh.test."));
    }

    // Engine reports a live peer; the machine promotes itself.
    h.engine.set_next_status(EngineStatus {
        num_live: 1,
        local_addrs: vec!["203.0.113.5:41641".to_string()],
        ..Default::default()
    });
    h.engine.deliver_status();
    assert_eq!(h.agent.state(), LifecycleState::Running);
    // Endpoints were forwarded to the control plane.
    assert!(h
        .control
        .endpoint_updates()
        .iter()
        .any(|e| e == &vec!["203.0.113.5:41641".to_string()]));
}

#[test]
fn persisted_prefs_survive_restart() {
    let h = Harness::new();
    let custom = Prefs {
        hostname: "beehive".to_string(),
        shields_up: true,
        ..Default::default()
    };
    h.agent
        .start(StartOptions {
            state_key: "user-1".to_string(),
            prefs: Some(Box::new(custom.clone())),
            ..Default::default()
        })
        .unwrap();

    // Migration wrote through to the store.
    let stored = h.store.read_state(&StateKey("user-1".to_string())).unwrap();
    assert_eq!(Prefs::from_bytes(&stored).unwrap(), custom);

    // A later start with only the key loads the same prefs.
    h.start("user-1");
    assert_eq!(h.agent.prefs().unwrap(), custom);
    // The first control client was torn down when the second start
    // arrived.
    assert_eq!(h.control.shutdowns(), 1);
}

#[test]
fn set_prefs_never_accepts_persist_from_frontend() {
    let h = Harness::new();
    h.run_up();

    let mut attacker = Prefs::default();
    attacker.persist = Some(Persist {
        login_name: "mallory@example.com".to_string(),
        ..Default::default()
    });
    h.agent.set_prefs(attacker);

    assert_eq!(
        h.agent.prefs().unwrap().persist.as_ref(),
        Some(&test_persist())
    );
}

#[test]
fn shields_up_while_running() {
    let h = Harness::new();
    h.run_up();
    h.drain();

    h.agent.set_prefs(Prefs {
        shields_up: true,
        ..Default::default()
    });

    // Hostinfo went out with no advertised services.
    let hostinfo = h.control.last_hostinfo().unwrap();
    assert_eq!(hostinfo.services, Vec::new());

    // The filter kept local nets but admits nothing.
    match h.engine.last_filter().unwrap() {
        Filter::Rules(rules) => {
            assert!(rules.matches.is_empty());
            assert_eq!(rules.local_nets, vec!["100.64.0.1/32".parse().unwrap()]);
        }
        Filter::AllowNone => panic!("expected a rules filter"),
    }

    // Still running; prefs notification delivered.
    assert_eq!(h.agent.state(), LifecycleState::Running);
    let notifications = h.drain();
    assert!(notifications.iter().all(|n| n.state.is_none()));
    assert!(notifications.iter().any(|n| n.prefs.is_some()));
}

#[test]
fn unchanged_filter_inputs_do_not_reinstall() {
    let h = Harness::new();
    let map = h.run_up();
    let installed = h.engine.filters().len();

    // Same map again: same filter hash, no reinstall.
    h.control.push_status(ControlStatus {
        net_map: Some(map),
        ..Default::default()
    });
    assert_eq!(h.engine.filters().len(), installed);
}

#[test]
fn fake_expiry_forces_needs_login() {
    let h = Harness::new();
    h.run_up();
    h.drain();

    h.agent.fake_expire_after(std::time::Duration::ZERO);
    let notifications = h.drain();
    let map = notifications
        .iter()
        .find_map(|n| n.net_map.as_deref())
        .unwrap();
    assert!(map.expiry.is_some());

    // The next event drives the state machine over the expiry.
    h.engine.deliver_status();
    assert_eq!(h.agent.state(), LifecycleState::NeedsLogin);
    assert_eq!(h.engine.last_filter().unwrap(), Filter::AllowNone);
}

#[test]
fn blocked_agent_never_reconfigures_engine() {
    let h = Harness::new();
    h.run_up();

    // Asking for a browser login blocks engine updates.
    h.agent.start_login_interactive();
    h.control.push_status(ControlStatus {
        url: Some("https://auth.mesh.test/c/xyz".to_string()),
        ..Default::default()
    });
    assert!(h
        .drain()
        .iter()
        .any(|n| n.browse_to_url.is_some()));

    let reconfigs = h.engine.reconfig_count();
    // Same want_running, so this goes down the auth_reconfig path,
    // which must refuse to touch the engine while blocked.
    h.agent.set_prefs(Prefs {
        hostname: "renamed".to_string(),
        ..Default::default()
    });
    assert_eq!(h.engine.reconfig_count(), reconfigs);
}

#[test]
fn version_skew_is_rejected_unless_allowed() {
    let h = Harness::new();
    h.run_up();
    h.drain();
    let handler = CommandHandler::new(h.agent.clone());

    let mut skewed = Command::new(CommandOp::RequestStatus);
    skewed.version = "0.0.0-other".to_string();
    assert_eq!(handler.handle(skewed.clone()), Handled::Continue);
    let notifications = h.drain();
    assert!(notifications.iter().any(|n| n.error_message.is_some()));
    assert!(notifications.iter().all(|n| n.status.is_none()));

    skewed.allow_version_skew = true;
    handler.handle(skewed);
    let notifications = h.drain();
    let status = notifications
        .iter()
        .find_map(|n| n.status.as_deref())
        .unwrap();
    assert_eq!(status.backend_state, LifecycleState::Running);
    assert_eq!(status.self_name, "self.mesh.test.");
}

#[test]
fn logout_clears_the_map() {
    let h = Harness::new();
    h.run_up();
    h.control.set_auth_cant_continue(true);

    h.agent.logout();

    assert_eq!(h.control.logouts(), 1);
    assert_eq!(h.agent.state(), LifecycleState::NeedsLogin);
    // With the map gone the status report knows no self node.
    h.drain();
    h.agent.request_status();
    let status = h
        .drain()
        .into_iter()
        .find_map(|n| n.status)
        .unwrap();
    assert_eq!(status.self_name, "");
}

#[test]
fn stopping_pauses_control_and_empties_engine() {
    let h = Harness::new();
    h.run_up();
    let reconfigs = h.engine.reconfig_count();

    h.agent.set_prefs(Prefs {
        want_running: false,
        ..Default::default()
    });

    assert_eq!(h.agent.state(), LifecycleState::Stopped);
    assert_eq!(h.control.inner.lock().unwrap().pauses.last(), Some(&true));
    let all = h.engine.inner.lock().unwrap().reconfigs.clone();
    assert!(all.len() > reconfigs);
    let (wg, router) = all.last().cloned().unwrap();
    assert!(wg.peers.is_empty());
    assert!(router.routes.is_empty());
}

#[test]
fn ping_relays_results_and_drops_garbage() {
    let h = Harness::new();
    h.run_up();
    h.drain();

    h.agent.ping("not-an-ip");
    assert!(h.drain().iter().all(|n| n.ping_result.is_none()));

    h.agent.ping("100.64.0.2");
    let result = h
        .drain()
        .into_iter()
        .find_map(|n| n.ping_result)
        .unwrap();
    assert_eq!(result.ip, "100.64.0.2");
    assert_eq!(result.node_name, "peer.mesh.test.");
}

#[test]
fn derp_map_follows_the_disable_preference() {
    let h = Harness::new();
    h.run_up();
    // Map delivery pushed an enabled relay table.
    assert_eq!(h.engine.derp_maps(), vec![true]);

    h.agent.set_prefs(Prefs {
        disable_derp: true,
        ..Default::default()
    });
    assert_eq!(h.engine.derp_maps(), vec![true, false]);

    h.agent.set_prefs(Prefs::default());
    assert_eq!(h.engine.derp_maps(), vec![true, false, true]);
}

#[test]
fn quit_shuts_everything_down() {
    let h = Harness::new();
    h.run_up();
    let handler = CommandHandler::new(h.agent.clone());

    let quit = Command::new(CommandOp::Quit);
    assert_eq!(quit.version, version::LONG);
    assert_eq!(handler.handle(quit), Handled::Quit);
    assert_eq!(h.control.shutdowns(), 1);
    assert!(h.engine.closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn port_poller_advertises_interesting_services() {
    use trellis_core::portlist::Port;
    use trellis_core::protocol::ServiceProto;

    let engine = Arc::new(FakeEngine::default());
    let control = Arc::new(FakeControl::default());
    let store = Arc::new(MemoryStore::new());
    let lister = Arc::new(StaticPortLister::new(vec![
        Port {
            proto: ServiceProto::Tcp,
            port: 22,
            process: "sshd".to_string(),
        },
        Port {
            proto: ServiceProto::Udp,
            port: 5353,
            process: "avahi-daemon".to_string(),
        },
    ]));
    let factory: ControlFactory = {
        let control = control.clone();
        Box::new(move |_options| Ok(control.clone()))
    };
    let agent = LocalAgent::new(
        "poller-test".to_string(),
        engine,
        store,
        factory,
        lister.clone(),
    );

    agent
        .start(StartOptions {
            state_key: "user-1".to_string(),
            ..Default::default()
        })
        .unwrap();

    // The poller's first tick fires immediately; give it a moment.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        if let Some(hostinfo) = control.last_hostinfo() {
            assert_eq!(hostinfo.services.len(), 1);
            assert_eq!(hostinfo.services[0].port, 22);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "poller never reported");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
