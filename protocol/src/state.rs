use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Lifecycle state of the backend, as reported to frontends.
///
/// A freshly constructed agent is in [`LifecycleState::NoState`]. All
/// later changes flow through the agent state machine; nothing else
/// assigns the state directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    NoState,
    /// A human has to complete a login flow before anything can run.
    NeedsLogin,
    /// Logged in, but an administrator has not authorized the machine.
    NeedsMachineAuth,
    /// Authenticated and intentionally not running.
    Stopped,
    /// Engine is being configured; no live peers yet.
    Starting,
    Running,
}
