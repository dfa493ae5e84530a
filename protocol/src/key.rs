//! Key material newtypes.
//!
//! The backend never inspects key bytes; keys are opaque strings minted
//! by the control plane or the engine and compared for equality only.

use serde::Deserialize;
use serde::Serialize;

/// Public or private machine key, as issued by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineKey(pub String);

/// Per-node WireGuard-style key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(pub String);

impl NodeKey {
    /// Shortened form for logs.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

/// Discovery key used by the engine's path discovery layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscoKey(pub String);
