use serde::Deserialize;
use serde::Serialize;

use crate::netmap::NetworkMap;
use crate::prefs::Prefs;
use crate::state::LifecycleState;
use crate::status::EngineStatus;
use crate::status::PingResult;
use crate::status::Status;

/// Marker payload for the `login_finished` notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginFinished {}

/// Asynchronous message from the backend to the frontend.
///
/// Any subset of the optional fields may be populated; absent fields
/// are omitted from the wire encoding. The backend stamps `version` on
/// every message it sends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Notify {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Human-readable error to surface to the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_finished: Option<LoginFinished>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<LifecycleState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefs: Option<Box<Prefs>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_map: Option<Box<NetworkMap>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineStatus>,
    /// URL the user must visit to complete an interactive login.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browse_to_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_log_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_result: Option<Box<PingResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Box<Status>>,
}
