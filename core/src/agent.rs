//! The agent: authoritative cache, lifecycle state machine, and event
//! fan-in for one trellis node.
//!
//! Four asynchronous sources meet here: control-plane callbacks,
//! engine callbacks, frontend commands, and the port poller. Every
//! public method and callback follows the same discipline: take the
//! cache lock, read or mutate fields, release the lock, then perform
//! engine/control/store side effects.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use trellis_protocol::EngineStatus;
use trellis_protocol::Hostinfo;
use trellis_protocol::LifecycleState;
use trellis_protocol::LoginFinished;
use trellis_protocol::NetInfo;
use trellis_protocol::NetworkMap;
use trellis_protocol::Notify;
use trellis_protocol::OauthToken;
use trellis_protocol::Prefs;
use trellis_protocol::StartOptions;
use trellis_protocol::StatusBuilder;
use trellis_protocol::netmap::MachineStatus;
use trellis_protocol::version;

use crate::control::ControlClient;
use crate::control::ControlFactory;
use crate::control::ControlOptions;
use crate::control::ControlStatus;
use crate::control::LoginMode;
use crate::derive;
use crate::derive::WgFlags;
use crate::engine::Engine;
use crate::engine::EngineError;
use crate::engine::RouterConfig;
use crate::engine::WgConfig;
use crate::error::AgentError;
use crate::error::Result;
use crate::filter::Filter;
use crate::filter::FilterHash;
use crate::filter::FilterInput;
use crate::filter::filter_hash;
use crate::portlist;
use crate::portlist::Port;
use crate::portlist::PortLister;
use crate::store::StateKey;
use crate::store::StateStore;
use crate::store::StoreError;

pub type NotifyCallback = Box<dyn Fn(Notify) + Send + Sync>;

/// Everything guarded by the agent's one cache mutex.
#[derive(Default)]
struct AgentCache {
    state: LifecycleState,
    prefs: Option<Prefs>,
    hostinfo: Option<Hostinfo>,
    /// Replaced wholesale, never mutated, so snapshots taken under the
    /// lock stay valid after release.
    netmap: Option<Arc<NetworkMap>>,
    engine_status: Option<EngineStatus>,
    endpoints: Vec<String>,
    /// One-shot login URL from the control plane; cleared on delivery.
    auth_url: Option<String>,
    /// Nonzero while a frontend is waiting for an auth URL.
    interact: u32,
    /// While set, no engine reconfiguration may be pushed.
    blocked: bool,
    state_key: StateKey,
    filter_hash: Option<FilterHash>,
}

/// Wakes engine-status waiters. Statuses carry an implicit sequence
/// number so a waiter only accepts one that arrived after its request;
/// an earlier in-flight status cannot unblock it prematurely.
#[derive(Default)]
struct StatusWaiter {
    seq: Mutex<u64>,
    changed: Condvar,
}

impl StatusWaiter {
    fn current(&self) -> u64 {
        *self.seq.lock().unwrap()
    }

    fn bump(&self) {
        *self.seq.lock().unwrap() += 1;
        self.changed.notify_all();
    }

    fn wait_past(&self, seen: u64, token: &CancellationToken) {
        let mut seq = self.seq.lock().unwrap();
        while *seq <= seen && !token.is_cancelled() {
            seq = self.changed.wait(seq).unwrap();
        }
    }
}

/// The local control agent. One per node process.
pub struct LocalAgent {
    backend_log_id: String,
    engine: Arc<dyn Engine>,
    store: Arc<dyn StateStore>,
    control_factory: ControlFactory,
    port_lister: Arc<dyn PortLister>,
    shutdown: CancellationToken,
    cache: Mutex<AgentCache>,
    status_waiter: StatusWaiter,
    control: Mutex<Option<Arc<dyn ControlClient>>>,
    notify: Mutex<Option<NotifyCallback>>,
    port_poller_started: AtomicBool,
}

impl LocalAgent {
    pub fn new(
        backend_log_id: String,
        engine: Arc<dyn Engine>,
        store: Arc<dyn StateStore>,
        control_factory: ControlFactory,
        port_lister: Arc<dyn PortLister>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend_log_id,
            engine,
            store,
            control_factory,
            port_lister,
            shutdown: CancellationToken::new(),
            cache: Mutex::new(AgentCache::default()),
            status_waiter: StatusWaiter::default(),
            control: Mutex::new(None),
            notify: Mutex::new(None),
            port_poller_started: AtomicBool::new(false),
        })
    }

    /// Installs (or clears) the sink for asynchronous notifications.
    pub fn set_notify_callback(&self, callback: Option<NotifyCallback>) {
        *self.notify.lock().unwrap() = callback;
    }

    pub fn state(&self) -> LifecycleState {
        self.cache.lock().unwrap().state
    }

    pub fn prefs(&self) -> Option<Prefs> {
        self.cache.lock().unwrap().prefs.clone()
    }

    pub fn backend_log_id(&self) -> &str {
        &self.backend_log_id
    }

    fn control(&self) -> Option<Arc<dyn ControlClient>> {
        self.control.lock().unwrap().clone()
    }

    pub(crate) fn send(&self, mut notify: Notify) {
        notify.version = Some(version::LONG.to_string());
        let sink = self.notify.lock().unwrap();
        match &*sink {
            Some(callback) => callback(notify),
            None => debug!("dropping notification, no frontend attached: {notify:?}"),
        }
    }

    pub fn send_error(&self, message: String) {
        self.send(Notify {
            error_message: Some(message),
            ..Default::default()
        });
    }

    /// Brings the agent up: loads preferences, rebuilds host info,
    /// connects a fresh control client, and starts the port poller.
    pub fn start(self: &Arc<Self>, opts: StartOptions) -> Result<()> {
        if opts.prefs.is_none() && opts.state_key.is_empty() {
            return Err(AgentError::NoStateSource);
        }
        if let Some(previous) = self.control.lock().unwrap().take() {
            previous.shutdown();
        }

        let mut hostinfo =
            Hostinfo::local(self.backend_log_id.clone(), opts.frontend_log_id.clone());
        {
            let mut cache = self.cache.lock().unwrap();
            // Keep discovered services and link info across restarts.
            if let Some(old) = &cache.hostinfo {
                hostinfo.services = old.services.clone();
                hostinfo.net_info = old.net_info.clone();
            }
            cache.hostinfo = Some(hostinfo);
            cache.state = LifecycleState::NoState;
            cache.engine_status = None;
        }

        let (state_key, prefs) = self.load_state(&opts)?;
        let (hostinfo, persist, endpoints) = {
            let mut cache = self.cache.lock().unwrap();
            cache.state_key = state_key;
            if let Some(hi) = &mut cache.hostinfo {
                fold_prefs_into_hostinfo(hi, &prefs);
            }
            cache.prefs = Some(prefs.clone());
            (
                cache.hostinfo.clone().unwrap_or_default(),
                prefs.persist.clone(),
                cache.endpoints.clone(),
            )
        };

        let weak = Arc::downgrade(self);
        self.engine
            .set_net_info_callback(Box::new(net_info_callback(weak.clone())));

        let control = (self.control_factory)(ControlOptions {
            server_url: prefs.control_url.clone(),
            auth_key: opts.auth_key.clone(),
            hostinfo,
            persist,
            keep_alive: true,
            disco_public_key: self.engine.disco_public_key(),
        })?;
        control.set_status_callback(Box::new(control_status_callback(weak.clone())));
        if !endpoints.is_empty() {
            control.update_endpoints(0, endpoints);
        }
        *self.control.lock().unwrap() = Some(control.clone());

        self.engine
            .set_status_callback(Box::new(engine_status_callback(weak.clone())));

        if self
            .port_poller_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.spawn_port_poller(weak);
        }

        self.send(Notify {
            backend_log_id: Some(self.backend_log_id.clone()),
            ..Default::default()
        });
        self.send(Notify {
            prefs: Some(Box::new(prefs)),
            ..Default::default()
        });

        control.login(None, LoginMode::Default);
        Ok(())
    }

    fn spawn_port_poller(&self, weak: Weak<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime; port polling disabled");
            return;
        };
        let lister = self.port_lister.clone();
        let token = self.shutdown.clone();
        let _guard = handle.enter();
        portlist::spawn_poller(lister, token, move |ports| {
            if let Some(agent) = weak.upgrade() {
                agent.on_port_list(ports);
            }
        });
    }

    /// Resolves starting preferences. Precedence: explicit prefs
    /// without a key run store-free; explicit prefs with a key migrate
    /// into the store; otherwise the store is read, falling back to a
    /// legacy file and then to defaults when the key has no entry.
    fn load_state(&self, opts: &StartOptions) -> Result<(StateKey, Prefs)> {
        let key = StateKey(opts.state_key.clone());
        if key.is_empty() {
            let prefs = opts.prefs.as_deref().cloned().unwrap_or_default();
            return Ok((StateKey::default(), prefs));
        }
        if let Some(prefs) = &opts.prefs {
            self.store.write_state(&key, &prefs.to_bytes()?)?;
            return Ok((key, (**prefs).clone()));
        }
        match self.store.read_state(&key) {
            Ok(bytes) => Ok((key, Prefs::from_bytes(&bytes)?)),
            Err(StoreError::NotFound) => {
                if let Some(path) = &opts.legacy_state_path
                    && let Ok(bytes) = std::fs::read(path)
                    && let Ok(prefs) = Prefs::from_bytes(&bytes)
                {
                    info!("imported legacy preferences from {}", path.display());
                    return Ok((key, prefs));
                }
                info!("no stored preferences for {key}; using defaults");
                Ok((key, Prefs::default()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the user preferences. The caller's `persist` field is
    /// discarded; identity only ever comes from the control plane or
    /// the store.
    pub fn set_prefs(&self, mut new_prefs: Prefs) {
        let (old_prefs, state_key, hostinfo, have_netmap, hostinfo_changed);
        {
            let mut cache = self.cache.lock().unwrap();
            let old = cache.prefs.clone().unwrap_or_default();
            new_prefs.persist = old.persist.clone();
            cache.prefs = Some(new_prefs.clone());
            let old_hostinfo = cache.hostinfo.clone();
            if let Some(hi) = &mut cache.hostinfo {
                fold_prefs_into_hostinfo(hi, &new_prefs);
            }
            hostinfo_changed = old_hostinfo != cache.hostinfo;
            hostinfo = cache.hostinfo.clone();
            have_netmap = cache.netmap.is_some();
            state_key = cache.state_key.clone();
            old_prefs = old;
        }

        if !state_key.is_empty() {
            self.persist_prefs(&state_key, &new_prefs);
        }
        let shields_flipped = old_prefs.shields_up != new_prefs.shields_up;
        if (shields_flipped || hostinfo_changed)
            && let Some(hi) = hostinfo
        {
            self.set_hostinfo_filter_services(hi);
        }
        self.update_filter();
        if have_netmap && old_prefs.disable_derp != new_prefs.disable_derp {
            let derp_map = if new_prefs.disable_derp {
                None
            } else {
                self.cache
                    .lock()
                    .unwrap()
                    .netmap
                    .as_ref()
                    .and_then(|nm| nm.derp_map.clone())
            };
            self.engine.set_derp_map(derp_map);
        }
        if old_prefs.want_running != new_prefs.want_running {
            self.advance();
        } else {
            self.auth_reconfig();
        }
        self.send(Notify {
            prefs: Some(Box::new(new_prefs)),
            ..Default::default()
        });
    }

    fn persist_prefs(&self, key: &StateKey, prefs: &Prefs) {
        let bytes = match prefs.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("encoding preferences failed: {e}");
                return;
            }
        };
        if let Err(e) = self.store.write_state(key, &bytes) {
            warn!("writing preferences for {key} failed: {e}");
            self.send_error(format!("saving preferences failed: {e}"));
        }
    }

    pub fn login(&self, token: OauthToken) {
        if let Some(control) = self.control() {
            control.login(Some(token), LoginMode::Interactive);
        } else {
            warn!("login before start; ignoring");
        }
    }

    /// Begins a browser-based login. If an auth URL is already cached
    /// it is delivered immediately; otherwise one is requested from
    /// the control plane and delivered when it arrives.
    pub fn start_login_interactive(&self) {
        let have_url = {
            let mut cache = self.cache.lock().unwrap();
            cache.interact += 1;
            cache.auth_url.is_some()
        };
        if have_url {
            self.pop_browser_auth_now();
        } else if let Some(control) = self.control() {
            control.login(None, LoginMode::Interactive);
        } else {
            warn!("interactive login before start; ignoring");
        }
    }

    fn pop_browser_auth_now(&self) {
        let url = {
            let mut cache = self.cache.lock().unwrap();
            cache.interact = 0;
            cache.auth_url.take()
        };
        let Some(url) = url else {
            return;
        };
        debug!("delivering auth url to frontend");
        self.block_engine_updates(true);
        self.stop_engine_and_wait();
        self.send(Notify {
            browse_to_url: Some(url),
            ..Default::default()
        });
        if self.state() == LifecycleState::Running {
            self.enter_state(LifecycleState::Starting);
        }
    }

    pub fn logout(&self) {
        self.cache.lock().unwrap().netmap = None;
        if let Some(control) = self.control() {
            control.logout();
        }
        // The control client may deliver a final map while logging
        // out; clear again so it cannot survive.
        self.cache.lock().unwrap().netmap = None;
        self.advance();
    }

    /// Pretends the node key expires `duration` from now. Never moves
    /// an earlier real expiry later.
    pub fn fake_expire_after(&self, duration: Duration) {
        let netmap = {
            let mut cache = self.cache.lock().unwrap();
            let Some(netmap) = &cache.netmap else {
                return;
            };
            let fake: DateTime<Utc> = Utc::now()
                + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
            let mut copy = (**netmap).clone();
            copy.expiry = Some(match copy.expiry {
                Some(real) if real < fake => real,
                _ => fake,
            });
            let replacement = Arc::new(copy);
            cache.netmap = Some(replacement.clone());
            replacement
        };
        self.send(Notify {
            net_map: Some(Box::new((*netmap).clone())),
            ..Default::default()
        });
    }

    /// Pings a mesh address; the result arrives as a notification.
    pub fn ping(self: &Arc<Self>, ip_text: &str) {
        let ip: IpAddr = match ip_text.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!("ping: invalid address {ip_text:?}");
                return;
            }
        };
        let weak = Arc::downgrade(self);
        self.engine.ping(
            ip,
            Box::new(move |result| {
                if let Some(agent) = weak.upgrade() {
                    agent.send(Notify {
                        ping_result: Some(Box::new(result)),
                        ..Default::default()
                    });
                }
            }),
        );
    }

    /// Answers `RequestStatus` with an overall report assembled from
    /// the engine's statistics and the agent's cache.
    pub fn request_status(&self) {
        let mut builder = StatusBuilder::default();
        self.engine.update_status(&mut builder);
        {
            let cache = self.cache.lock().unwrap();
            builder.set_backend_state(cache.state);
            builder.set_auth_url(cache.auth_url.clone());
            if let Some(netmap) = &cache.netmap {
                builder.set_self_name(netmap.name.clone());
                for peer in &netmap.peers {
                    builder.annotate_peer(&peer.key, &peer.name);
                }
            }
        }
        self.send(Notify {
            status: Some(Box::new(builder.into_status())),
            ..Default::default()
        });
    }

    /// Asks the engine for a fresh status; it arrives through the
    /// status callback as an `engine` notification.
    pub fn request_engine_status(&self) {
        self.engine.request_status();
    }

    pub fn shutdown(&self) {
        info!("agent shutting down");
        if let Some(control) = self.control.lock().unwrap().take() {
            control.shutdown();
        }
        self.shutdown.cancel();
        // Release anyone parked in stop_engine_and_wait.
        self.status_waiter.bump();
        self.engine.close();
        self.engine.wait();
    }

    // ----- state machine -----

    /// The only entry point to the state machine: computes the
    /// successor state from the cache and enters it.
    fn advance(&self) {
        let auth_cant_continue = self
            .control()
            .map_or(true, |c| c.auth_cant_continue());
        let next = {
            let cache = self.cache.lock().unwrap();
            next_state(&cache, auth_cant_continue, Utc::now())
        };
        self.enter_state(next);
    }

    fn enter_state(&self, new_state: LifecycleState) {
        let (old_state, want_running) = {
            let mut cache = self.cache.lock().unwrap();
            let old = cache.state;
            cache.state = new_state;
            (
                old,
                cache.prefs.as_ref().is_some_and(|p| p.want_running),
            )
        };
        if old_state == new_state {
            return;
        }
        info!("state {old_state} -> {new_state} (want_running={want_running})");
        self.send(Notify {
            state: Some(new_state),
            ..Default::default()
        });
        match new_state {
            LifecycleState::NeedsLogin => {
                self.block_engine_updates(true);
                self.set_filter_allow_none();
                self.pause_engine();
            }
            LifecycleState::Stopped => {
                self.pause_engine();
                if let Some(control) = self.control() {
                    control.set_paused(true);
                }
            }
            LifecycleState::Starting | LifecycleState::NeedsMachineAuth => {
                if let Some(control) = self.control() {
                    control.set_paused(false);
                }
                self.auth_reconfig();
                // A status delivery is what later promotes Starting to
                // Running.
                self.engine.request_status();
            }
            LifecycleState::Running | LifecycleState::NoState => {}
        }
    }

    /// Reconfigures the engine from the cache, unless blocked, mapless
    /// or not meant to be running.
    fn auth_reconfig(&self) {
        let (blocked, netmap, prefs) = {
            let cache = self.cache.lock().unwrap();
            (cache.blocked, cache.netmap.clone(), cache.prefs.clone())
        };
        if blocked {
            debug!("auth_reconfig: blocked, skipping");
            return;
        }
        let Some(netmap) = netmap else {
            debug!("auth_reconfig: no network map, skipping");
            return;
        };
        let Some(prefs) = prefs else {
            debug!("auth_reconfig: no prefs, skipping");
            return;
        };
        if !prefs.want_running {
            debug!("auth_reconfig: not running, skipping");
            return;
        }

        let wg = derive::derive_wg_config(&netmap, WgFlags::from_prefs(&prefs));
        let mut router = derive::derive_router(&wg, &prefs);
        router.dns = derive::derive_dns(&netmap, &prefs);
        match self.engine.reconfig(&wg, &router) {
            Ok(()) => info!(
                "engine reconfigured: {} peers, corp_dns={}",
                wg.peers.len(),
                router.dns.proxied || !router.dns.nameservers.is_empty()
            ),
            Err(EngineError::NoChanges) => {}
            Err(e) => warn!("engine reconfig failed: {e}"),
        }
    }

    fn block_engine_updates(&self, block: bool) {
        debug!("block_engine_updates({block})");
        self.cache.lock().unwrap().blocked = block;
    }

    /// Pushes the empty tunnel and router configuration, taking the
    /// data plane down without tearing the engine itself down.
    fn pause_engine(&self) {
        match self
            .engine
            .reconfig(&WgConfig::default(), &RouterConfig::empty())
        {
            Ok(()) | Err(EngineError::NoChanges) => {}
            Err(e) => warn!("pausing engine failed: {e}"),
        }
    }

    /// Recomputes the packet filter and installs it only when its
    /// inputs actually changed.
    fn update_filter(&self) {
        let (netmap, prefs) = {
            let cache = self.cache.lock().unwrap();
            (cache.netmap.clone(), cache.prefs.clone())
        };
        let prefs = prefs.unwrap_or_default();
        let filter = derive::derive_filter(netmap.as_deref(), &prefs);
        let hash = filter_hash(&derive::filter_input(netmap.as_deref(), &prefs));
        if !self.store_filter_hash(hash) {
            return;
        }
        debug!("installing new packet filter");
        self.engine.set_filter(filter);
    }

    fn set_filter_allow_none(&self) {
        let hash = filter_hash(&FilterInput::none());
        if !self.store_filter_hash(hash) {
            return;
        }
        debug!("installing deny-all packet filter");
        self.engine.set_filter(Filter::AllowNone);
    }

    /// Records the hash of the filter about to be installed. Returns
    /// false when it matches the installed one and nothing should
    /// happen.
    fn store_filter_hash(&self, hash: FilterHash) -> bool {
        let mut cache = self.cache.lock().unwrap();
        if cache.filter_hash == Some(hash) {
            return false;
        }
        cache.filter_hash = Some(hash);
        true
    }

    /// Takes the data plane down and blocks until the engine delivers
    /// a status that postdates the request.
    fn stop_engine_and_wait(&self) {
        debug!("stopping engine and waiting for status");
        self.pause_engine();
        let seen = self.status_waiter.current();
        self.engine.request_status();
        self.status_waiter.wait_past(seen, &self.shutdown);
    }

    // ----- event fan-in -----

    fn on_control_status(&self, status: ControlStatus) {
        if let Some(err) = &status.err {
            warn!("control error: {err}");
            return;
        }
        if status.login_finished {
            info!("control: login finished");
            self.block_engine_updates(false);
            self.auth_reconfig();
            self.send(Notify {
                login_finished: Some(LoginFinished {}),
                ..Default::default()
            });
        }

        let new_netmap = status.net_map.map(Arc::new);
        let mut prefs_changed = false;
        let (state_key, prefs, interact, old_netmap);
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(persist) = status.persist {
                let prefs = cache.prefs.get_or_insert_with(Prefs::default);
                if prefs.persist.as_ref() != Some(&persist) {
                    prefs.persist = Some(persist);
                    prefs_changed = true;
                }
            }
            old_netmap = cache.netmap.clone();
            if let Some(netmap) = &new_netmap {
                cache.netmap = Some(netmap.clone());
            }
            if let Some(url) = &status.url {
                cache.auth_url = Some(url.clone());
            }
            if cache.state == LifecycleState::NeedsLogin
                && let Some(prefs) = &mut cache.prefs
                && !prefs.want_running
            {
                prefs.want_running = true;
                prefs_changed = true;
            }
            state_key = cache.state_key.clone();
            prefs = cache.prefs.clone();
            interact = cache.interact;
        }

        if prefs_changed && let Some(prefs) = &prefs {
            if !state_key.is_empty() {
                self.persist_prefs(&state_key, prefs);
            }
            self.send(Notify {
                prefs: Some(Box::new(prefs.clone())),
                ..Default::default()
            });
        }

        if let Some(netmap) = &new_netmap {
            match &old_netmap {
                Some(old) if old.concise() == netmap.concise() => {}
                _ => info!("netmap:\n{}", netmap.concise()),
            }
            self.update_filter();
            self.engine.set_network_map(netmap);
            if !derive::dns_maps_equal(Some(netmap), old_netmap.as_deref()) {
                self.engine.set_dns_map(derive::derive_dns_map(netmap));
            }
            let disable_derp = prefs.as_ref().is_some_and(|p| p.disable_derp);
            self.engine.set_derp_map(if disable_derp {
                None
            } else {
                netmap.derp_map.clone()
            });
            self.send(Notify {
                net_map: Some(Box::new((**netmap).clone())),
                ..Default::default()
            });
        }

        if status.url.is_some() {
            info!("control: received auth url");
            if interact > 0 {
                self.pop_browser_auth_now();
            }
        }

        self.advance();
        // May repeat the reconfig advance() just did; the engine's
        // change detection absorbs the duplicate.
        self.auth_reconfig();
    }

    fn on_engine_status(&self, status: std::result::Result<EngineStatus, EngineError>) {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                warn!("engine status error: {e}");
                return;
            }
        };
        {
            let mut cache = self.cache.lock().unwrap();
            cache.engine_status = Some(status.clone());
            cache.endpoints = status.local_addrs.clone();
        }
        if let Some(control) = self.control() {
            control.update_endpoints(0, status.local_addrs.clone());
        }
        self.advance();
        self.status_waiter.bump();
        self.send(Notify {
            engine: Some(status),
            ..Default::default()
        });
    }

    fn on_net_info(&self, net_info: NetInfo) {
        debug!("netinfo: {net_info:?}");
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(hostinfo) = &mut cache.hostinfo {
                hostinfo.net_info = Some(net_info.clone());
            }
        }
        if let Some(control) = self.control() {
            control.set_netinfo(&net_info);
        }
    }

    fn on_port_list(&self, ports: Vec<Port>) {
        let services = portlist::interesting_services(&ports, std::env::consts::OS);
        let hostinfo = {
            let mut cache = self.cache.lock().unwrap();
            let Some(hostinfo) = &mut cache.hostinfo else {
                return;
            };
            hostinfo.services = services;
            hostinfo.clone()
        };
        self.set_hostinfo_filter_services(hostinfo);
    }

    /// Sends host info to the control plane, masking the advertised
    /// services to nothing while shields are up.
    fn set_hostinfo_filter_services(&self, mut hostinfo: Hostinfo) {
        let shields_up = {
            let cache = self.cache.lock().unwrap();
            cache.prefs.as_ref().is_some_and(|p| p.shields_up)
        };
        if shields_up {
            hostinfo.services = Vec::new();
        }
        if let Some(control) = self.control() {
            control.set_hostinfo(&hostinfo);
        }
    }
}

/// Successor-state decision, evaluated top to bottom against a cache
/// snapshot. Pure so it can be tested exhaustively.
fn next_state(
    cache: &AgentCache,
    auth_cant_continue: bool,
    now: DateTime<Utc>,
) -> LifecycleState {
    let want_running = cache.prefs.as_ref().is_some_and(|p| p.want_running);
    let Some(netmap) = &cache.netmap else {
        return if auth_cant_continue {
            LifecycleState::NeedsLogin
        } else {
            cache.state
        };
    };
    if !want_running {
        return LifecycleState::Stopped;
    }
    if let Some(expiry) = netmap.expiry
        && expiry <= now
    {
        return LifecycleState::NeedsLogin;
    }
    if netmap.machine_status != MachineStatus::Authorized {
        return LifecycleState::NeedsMachineAuth;
    }
    if cache.state == LifecycleState::NeedsMachineAuth {
        return LifecycleState::Starting;
    }
    if cache.state == LifecycleState::Starting {
        let live = cache
            .engine_status
            .as_ref()
            .is_some_and(|s| s.num_live > 0 || s.live_derps > 0);
        if live {
            return LifecycleState::Running;
        }
    }
    if cache.state == LifecycleState::Running {
        return LifecycleState::Running;
    }
    LifecycleState::Starting
}

fn fold_prefs_into_hostinfo(hostinfo: &mut Hostinfo, prefs: &Prefs) {
    hostinfo.routable_ips = prefs.advertise_routes.clone();
    hostinfo.request_tags = prefs.advertise_tags.clone();
    if !prefs.hostname.is_empty() {
        hostinfo.hostname = prefs.hostname.clone();
    }
    if !prefs.os_version.is_empty() {
        hostinfo.os_version = prefs.os_version.clone();
    }
    if !prefs.device_model.is_empty() {
        hostinfo.device_model = prefs.device_model.clone();
    }
}

fn control_status_callback(weak: Weak<LocalAgent>) -> impl Fn(ControlStatus) + Send + Sync {
    move |status| {
        if let Some(agent) = weak.upgrade() {
            agent.on_control_status(status);
        }
    }
}

fn engine_status_callback(
    weak: Weak<LocalAgent>,
) -> impl Fn(std::result::Result<EngineStatus, EngineError>) + Send + Sync {
    move |status| {
        if let Some(agent) = weak.upgrade() {
            agent.on_engine_status(status);
        }
    }
}

fn net_info_callback(weak: Weak<LocalAgent>) -> impl Fn(NetInfo) + Send + Sync {
    move |net_info| {
        if let Some(agent) = weak.upgrade() {
            agent.on_net_info(net_info);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use trellis_protocol::NodeKey;

    use super::*;

    fn authorized_map() -> Arc<NetworkMap> {
        Arc::new(NetworkMap {
            name: "self.mesh.test.".to_string(),
            node_key: NodeKey("nkey:self".to_string()),
            machine_status: MachineStatus::Authorized,
            ..Default::default()
        })
    }

    fn cache_with(state: LifecycleState, netmap: Option<Arc<NetworkMap>>) -> AgentCache {
        AgentCache {
            state,
            prefs: Some(Prefs::default()),
            netmap,
            ..Default::default()
        }
    }

    #[test]
    fn no_map_needs_login_only_when_auth_stuck() {
        let cache = cache_with(LifecycleState::NoState, None);
        assert_eq!(
            next_state(&cache, true, Utc::now()),
            LifecycleState::NeedsLogin
        );
        assert_eq!(
            next_state(&cache, false, Utc::now()),
            LifecycleState::NoState
        );
    }

    #[test]
    fn not_wanting_to_run_stops() {
        let mut cache = cache_with(LifecycleState::Running, Some(authorized_map()));
        if let Some(prefs) = &mut cache.prefs {
            prefs.want_running = false;
        }
        assert_eq!(next_state(&cache, false, Utc::now()), LifecycleState::Stopped);
    }

    #[test]
    fn expired_map_needs_login() {
        let mut map = (*authorized_map()).clone();
        map.expiry = Some(Utc::now() - chrono::Duration::seconds(1));
        let cache = cache_with(LifecycleState::Running, Some(Arc::new(map)));
        assert_eq!(
            next_state(&cache, false, Utc::now()),
            LifecycleState::NeedsLogin
        );
    }

    #[test]
    fn unauthorized_machine_waits() {
        let mut map = (*authorized_map()).clone();
        map.machine_status = MachineStatus::Unauthorized;
        let cache = cache_with(LifecycleState::Starting, Some(Arc::new(map)));
        assert_eq!(
            next_state(&cache, false, Utc::now()),
            LifecycleState::NeedsMachineAuth
        );
    }

    #[test]
    fn authorization_promotes_from_machine_auth() {
        let cache = cache_with(LifecycleState::NeedsMachineAuth, Some(authorized_map()));
        assert_eq!(
            next_state(&cache, false, Utc::now()),
            LifecycleState::Starting
        );
    }

    #[test]
    fn starting_promotes_to_running_on_live_peers() {
        let mut cache = cache_with(LifecycleState::Starting, Some(authorized_map()));
        assert_eq!(
            next_state(&cache, false, Utc::now()),
            LifecycleState::Starting
        );
        cache.engine_status = Some(EngineStatus {
            num_live: 1,
            ..Default::default()
        });
        assert_eq!(
            next_state(&cache, false, Utc::now()),
            LifecycleState::Running
        );
        // Relay-only connectivity counts too.
        cache.engine_status = Some(EngineStatus {
            live_derps: 2,
            ..Default::default()
        });
        assert_eq!(
            next_state(&cache, false, Utc::now()),
            LifecycleState::Running
        );
    }

    #[test]
    fn running_stays_running_and_identical_inputs_agree() {
        let cache = cache_with(LifecycleState::Running, Some(authorized_map()));
        let now = Utc::now();
        let first = next_state(&cache, false, now);
        let second = next_state(&cache, false, now);
        assert_eq!(first, LifecycleState::Running);
        assert_eq!(first, second);
    }

    #[test]
    fn anything_else_starts() {
        let cache = cache_with(LifecycleState::Stopped, Some(authorized_map()));
        assert_eq!(
            next_state(&cache, false, Utc::now()),
            LifecycleState::Starting
        );
    }
}
