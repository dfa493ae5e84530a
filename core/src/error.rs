use thiserror::Error;

use crate::control::ControlError;
use crate::engine::EngineError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    /// `Start` was called with neither a state key nor initial
    /// preferences; there is nothing to run from.
    #[error("no state key or initial preferences supplied")]
    NoStateSource,

    /// The agent has been shut down and accepts no further work.
    #[error("backend is shut down")]
    ShutDown,

    #[error("state store: {0}")]
    Store(#[from] StoreError),

    #[error("control client: {0}")]
    Control(#[from] ControlError),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("preference encoding: {0}")]
    PrefsCodec(#[from] serde_json::Error),
}
