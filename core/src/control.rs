//! The consumed surface of the control-plane client.
//!
//! The real client speaks the coordination protocol over HTTPS,
//! performs authentication, and delivers signed network maps. The
//! agent constructs one per `Start` through a [`ControlFactory`] so
//! tests can substitute their own.

use std::sync::Arc;

use strum_macros::Display;
use thiserror::Error;
use trellis_protocol::DiscoKey;
use trellis_protocol::Hostinfo;
use trellis_protocol::NetInfo;
use trellis_protocol::NetworkMap;
use trellis_protocol::OauthToken;
use trellis_protocol::Persist;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control client shut down")]
    ShutDown,

    #[error("{0}")]
    Other(String),
}

/// How a login was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LoginMode {
    /// Background login using stored identity; never opens a browser.
    Default,
    /// A user asked for this login and is waiting for an auth URL.
    Interactive,
}

/// Options for constructing a control client.
#[derive(Debug, Clone, Default)]
pub struct ControlOptions {
    pub server_url: String,
    /// Pre-authorized key; empty for browser-based login.
    pub auth_key: String,
    pub hostinfo: Hostinfo,
    /// Stored identity from a previous session, if any.
    pub persist: Option<Persist>,
    pub keep_alive: bool,
    pub disco_public_key: DiscoKey,
}

/// Asynchronous status from the control plane.
#[derive(Debug, Clone, Default)]
pub struct ControlStatus {
    pub err: Option<String>,
    /// Authentication completed; the agent may reconfigure the engine.
    pub login_finished: bool,
    /// Updated identity to merge into preferences.
    pub persist: Option<Persist>,
    pub net_map: Option<NetworkMap>,
    /// URL a human must visit to continue authentication.
    pub url: Option<String>,
}

pub type ControlStatusCallback = Box<dyn Fn(ControlStatus) + Send + Sync>;

/// Control-plane client, as consumed by the agent.
pub trait ControlClient: Send + Sync {
    fn set_status_callback(&self, callback: ControlStatusCallback);

    fn login(&self, token: Option<OauthToken>, mode: LoginMode);

    fn logout(&self);

    /// Pauses map polling while the node is intentionally stopped.
    fn set_paused(&self, paused: bool);

    /// Reports the engine's local endpoints for peer connectivity.
    fn update_endpoints(&self, client_version: u32, endpoints: Vec<String>);

    fn set_hostinfo(&self, hostinfo: &Hostinfo);

    fn set_netinfo(&self, net_info: &NetInfo);

    /// True when authentication cannot proceed without a human.
    fn auth_cant_continue(&self) -> bool;

    fn shutdown(&self);
}

/// Builds a control client from options. The daemon installs a real
/// implementation; tests install fakes.
pub type ControlFactory =
    Box<dyn Fn(ControlOptions) -> Result<Arc<dyn ControlClient>, ControlError> + Send + Sync>;

/// A control client with no server behind it. Every login stalls in
/// the needs-login state; useful for bring-up and offline runs.
#[derive(Default)]
pub struct NullControl {}

impl ControlClient for NullControl {
    fn set_status_callback(&self, _callback: ControlStatusCallback) {}

    fn login(&self, _token: Option<OauthToken>, mode: LoginMode) {
        tracing::debug!(%mode, "null control: login ignored");
    }

    fn logout(&self) {}

    fn set_paused(&self, _paused: bool) {}

    fn update_endpoints(&self, _client_version: u32, _endpoints: Vec<String>) {}

    fn set_hostinfo(&self, _hostinfo: &Hostinfo) {}

    fn set_netinfo(&self, _net_info: &NetInfo) {}

    fn auth_cant_continue(&self) -> bool {
        true
    }

    fn shutdown(&self) {}
}
