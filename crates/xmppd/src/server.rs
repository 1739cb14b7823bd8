//! TCP listener and server lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection;
use crate::registry::ServerState;
use crate::stream::stream_error_text;
use crate::stream_errors;
use crate::XmppError;

/// One listener plus up to fifteen client sessions.
pub const MAX_CLIENTS: usize = 16;

/// The server: configuration plus the shared session table.
pub struct Server {
    /// Immutable runtime configuration.
    pub config: Config,
    /// Live-session state; stanza handlers run under this lock.
    pub state: Mutex<ServerState>,
}

impl Server {
    /// Create a server around a configuration.
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(ServerState::new()),
        })
    }

    /// Accept clients until the shutdown token fires, then notify every
    /// session and drain.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), XmppError> {
        info!(
            addr = %self.config.listen_addr(),
            domain = %self.config.domain,
            datadir = %self.config.datadir.display(),
            "Listening for client connections"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let live = self.state.lock().await.sessions.len();
                        if live >= MAX_CLIENTS - 1 {
                            warn!(%peer, "Max clients reached, rejecting connection");
                            drop(socket);
                            continue;
                        }
                        let _ = socket.set_nodelay(true);
                        tasks.spawn(connection::handle_connection(
                            Arc::clone(&self),
                            socket,
                            peer,
                        ));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                // Reap finished connection tasks as they complete.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        self.shutdown_sessions().await;

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            warn!("Timed out draining connection tasks");
        }
        info!("Server stopped");
        Ok(())
    }

    /// Queue a `system-shutdown` stream error on every live session and
    /// drop the table; writers flush once and close.
    async fn shutdown_sessions(&self) {
        let mut state = self.state.lock().await;
        if !state.sessions.is_empty() {
            info!(count = state.sessions.len(), "Notifying sessions of shutdown");
        }
        let text = stream_error_text(stream_errors::SYSTEM_SHUTDOWN);
        for (_, entry) in state.sessions.drain() {
            entry.close_with(text.clone());
        }
    }
}
