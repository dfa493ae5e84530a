//! Dispatches framed frontend commands to the agent facade.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use trellis_protocol::Command;
use trellis_protocol::CommandOp;
use trellis_protocol::version;

use crate::agent::LocalAgent;

/// Outcome of handling one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Keep reading commands.
    Continue,
    /// The frontend asked to quit; the agent is shut down and the
    /// channel should close.
    Quit,
}

/// Serializes commands from one frontend onto the agent.
#[derive(Clone)]
pub struct CommandHandler {
    agent: Arc<LocalAgent>,
}

impl CommandHandler {
    pub fn new(agent: Arc<LocalAgent>) -> Self {
        Self { agent }
    }

    pub fn handle(&self, command: Command) -> Handled {
        if command.version != version::LONG && !command.allow_version_skew {
            let message = format!(
                "frontend version {:?} does not match backend version {:?}",
                command.version,
                version::LONG
            );
            warn!("{message}");
            self.agent.send_error(message);
            return Handled::Continue;
        }

        match command.op {
            CommandOp::Quit => {
                self.agent.shutdown();
                return Handled::Quit;
            }
            CommandOp::Start { opts } => {
                if let Err(e) = self.agent.start(opts) {
                    warn!("start failed: {e}");
                    self.agent.send_error(format!("start failed: {e}"));
                }
            }
            CommandOp::StartLoginInteractive => self.agent.start_login_interactive(),
            CommandOp::Login { token } => self.agent.login(token),
            CommandOp::Logout => self.agent.logout(),
            CommandOp::SetPrefs { prefs } => self.agent.set_prefs(*prefs),
            CommandOp::RequestEngineStatus => self.agent.request_engine_status(),
            CommandOp::RequestStatus => self.agent.request_status(),
            CommandOp::FakeExpireAfter { duration_ms } => self
                .agent
                .fake_expire_after(Duration::from_millis(duration_ms)),
            CommandOp::Ping { ip } => self.agent.ping(&ip),
            _ => {
                warn!("unhandled command: {:?}", command.op);
                self.agent.send_error("unhandled command".to_string());
            }
        }
        Handled::Continue
    }
}
