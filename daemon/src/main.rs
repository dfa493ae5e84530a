//! `trellisd`: hosts a [`LocalAgent`] and serves the framed command
//! channel on a Unix socket, one frontend at a time.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use trellis_core::CommandHandler;
use trellis_core::Handled;
use trellis_core::LocalAgent;
use trellis_core::control::ControlClient;
use trellis_core::control::ControlFactory;
use trellis_core::control::NullControl;
use trellis_core::engine::NullEngine;
use trellis_core::portlist::StaticPortLister;
use trellis_core::store::FileStore;
use trellis_core::store::MemoryStore;
use trellis_core::store::StateStore;
use trellis_protocol::Notify;
use trellis_protocol::ProtocolError;
use trellis_protocol::codec;

#[derive(Debug, Parser)]
#[command(name = "trellisd", about = "trellis node control agent")]
struct Cli {
    /// Path of the Unix socket to serve frontends on.
    #[arg(long, default_value = "/var/run/trellisd.sock")]
    socket: PathBuf,

    /// File backing the preference store; in-memory when omitted.
    #[arg(long)]
    state_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let store: Arc<dyn StateStore> = match &cli.state_file {
        Some(path) => Arc::new(
            FileStore::new(path)
                .with_context(|| format!("opening state file {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    let control_factory: ControlFactory = Box::new(|_opts| {
        let control: Arc<dyn ControlClient> = Arc::new(NullControl::default());
        Ok(control)
    });
    let agent = LocalAgent::new(
        format!("trellisd-{}", std::process::id()),
        Arc::new(NullEngine::new()),
        store,
        control_factory,
        Arc::new(StaticPortLister::default()),
    );

    let _ = std::fs::remove_file(&cli.socket);
    let listener = UnixListener::bind(&cli.socket)
        .with_context(|| format!("binding {}", cli.socket.display()))?;
    info!("listening on {}", cli.socket.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt; shutting down");
                let agent = agent.clone();
                tokio::task::spawn_blocking(move || agent.shutdown()).await?;
                break;
            }
            accepted = listener.accept() => {
                let (stream, _addr) = accepted.context("accept")?;
                debug!("frontend connected");
                if serve_frontend(agent.clone(), stream).await? == Handled::Quit {
                    break;
                }
                debug!("frontend disconnected");
            }
        }
    }

    let _ = std::fs::remove_file(&cli.socket);
    Ok(())
}

/// Serves one frontend connection until it quits or hangs up.
async fn serve_frontend(agent: Arc<LocalAgent>, stream: UnixStream) -> anyhow::Result<Handled> {
    let (mut reader, mut writer) = stream.into_split();

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Notify>();
    agent.set_notify_callback(Some(Box::new(move |notify| {
        let _ = notify_tx.send(notify);
    })));

    let writer_task = tokio::spawn(async move {
        while let Some(notify) = notify_rx.recv().await {
            if let Err(e) = codec::write_notify(&mut writer, &notify).await {
                warn!("writing notification failed: {e}");
                break;
            }
        }
    });

    let handler = CommandHandler::new(agent.clone());
    let mut outcome = Handled::Continue;
    loop {
        match codec::read_command(&mut reader).await {
            Ok(command) => {
                let handler = handler.clone();
                // Facade calls may block on the engine; keep them off
                // the reactor.
                let handled =
                    tokio::task::spawn_blocking(move || handler.handle(command)).await?;
                if handled == Handled::Quit {
                    outcome = Handled::Quit;
                    break;
                }
            }
            Err(ProtocolError::Json(e)) => {
                warn!("undecodable command: {e}");
                agent.send_error(format!("undecodable command: {e}"));
            }
            Err(e) => {
                if !e.is_disconnect() {
                    warn!("command channel failed: {e}");
                }
                break;
            }
        }
    }

    // Dropping the callback closes the channel and ends the writer.
    agent.set_notify_callback(None);
    let _ = writer_task.await;
    Ok(outcome)
}
