use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::prefs::Prefs;
use crate::version;

/// OAuth token handed to the control client for a non-browser login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OauthToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

/// Arguments to the `Start` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartOptions {
    /// Store key under which preferences persist. Empty means run from
    /// the supplied `prefs` without touching the store.
    pub state_key: String,
    /// Initial preferences. When both this and `state_key` are set the
    /// preferences are written through to the store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefs: Option<Box<Prefs>>,
    /// Pre-store preference file to migrate from when the store has no
    /// entry for `state_key`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_state_path: Option<PathBuf>,
    /// Pre-authorized key for login without a browser.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub auth_key: String,
    /// Log identifier of the frontend issuing the start.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub frontend_log_id: String,
}

/// Operation requested by a frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CommandOp {
    /// Shut the backend down and close the channel.
    Quit,

    /// Bring the agent up: load preferences, build host info, connect
    /// the control client, start the port poller.
    Start { opts: StartOptions },

    /// Begin a browser-based login; the backend answers with a
    /// `browse_to_url` notification once the control plane supplies
    /// the URL.
    StartLoginInteractive,

    /// Log in with a previously obtained OAuth token.
    Login { token: OauthToken },

    /// Drop the network map and log out of the control plane.
    Logout,

    /// Replace the user preferences. The `persist` field is ignored;
    /// identity can only come from the control plane or the store.
    SetPrefs { prefs: Box<Prefs> },

    /// Ask the engine for a fresh status, delivered as an `engine`
    /// notification.
    RequestEngineStatus,

    /// Ask for an overall status report, delivered as a `status`
    /// notification.
    RequestStatus,

    /// Pretend the node key expires `duration_ms` from now. Testing
    /// aid for expiry handling; never extends the real expiry.
    FakeExpireAfter { duration_ms: u64 },

    /// Ping a mesh address; the result arrives as a `ping_result`
    /// notification. Invalid addresses are logged and ignored.
    Ping { ip: String },
}

/// Envelope for every frontend-to-backend message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Version of the frontend, checked against the backend's.
    pub version: String,
    /// Accept this command even when the versions differ.
    #[serde(default)]
    pub allow_version_skew: bool,
    #[serde(flatten)]
    pub op: CommandOp,
}

impl Command {
    /// An envelope stamped with this build's version.
    pub fn new(op: CommandOp) -> Self {
        Self {
            version: version::LONG.to_string(),
            allow_version_skew: false,
            op,
        }
    }
}
