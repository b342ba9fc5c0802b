use std::{
    future::Future,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
    task::{JoinError, JoinSet},
};
use tracing::{debug, info, warn};

use crate::{
    credentials::CredentialStore,
    registry::{ConnectionId, ConnectionRegistry, GroupRegistry},
    session,
};

pub const SERVER_FULL: &str = "Server is full.";

/// Settings needed to start a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub users: PathBuf,
    /// Upper bound on concurrently open sessions. `None` means unbounded.
    pub max_sessions: Option<usize>,
}

/// State shared by every session of one server.
pub struct ChatState {
    credentials: CredentialStore,
    connections: ConnectionRegistry,
    groups: GroupRegistry,
    next_id: AtomicU64,
}

impl ChatState {
    pub fn new(credentials: CredentialStore) -> Self {
        Self {
            credentials,
            connections: ConnectionRegistry::new(),
            groups: GroupRegistry::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ChatState>,
    session_slots: Option<Arc<Semaphore>>,
}

impl Server {
    pub fn new(listener: TcpListener, credentials: CredentialStore) -> Self {
        Self {
            listener,
            state: Arc::new(ChatState::new(credentials)),
            session_slots: None,
        }
    }

    /// Loads credentials and binds the listening socket described by `config`.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let credentials = CredentialStore::load(&config.users).await;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;

        let server = Self::new(listener, credentials);
        Ok(match config.max_sessions {
            Some(limit) => server.with_max_sessions(limit),
            None => server,
        })
    }

    pub fn with_max_sessions(mut self, limit: usize) -> Self {
        self.session_slots = Some(Arc::new(Semaphore::new(limit)));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<ChatState> {
        Arc::clone(&self.state)
    }

    /// Accepts connections until `shutdown` resolves, then aborts every
    /// session still running. Aborted sessions still unregister themselves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            state,
            session_slots,
        } = self;
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(open_sessions = sessions.len(), "chat server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, session_slots.as_ref(), &mut sessions);
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    reap_session(finished);
                }
            }
        }

        sessions.shutdown().await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ChatState>,
    session_slots: Option<&Arc<Semaphore>>,
    sessions: &mut JoinSet<()>,
) {
    let (stream, peer) = match result {
        Ok(accepted) => accepted,
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            return;
        }
    };

    let permit = match session_slots.map(|slots| Arc::clone(slots).try_acquire_owned()) {
        None => None,
        Some(Ok(permit)) => Some(permit),
        Some(Err(_)) => {
            warn!(%peer, "session limit reached; rejecting connection");
            sessions.spawn(reject_connection(stream, peer));
            return;
        }
    };

    spawn_session(stream, peer, state, permit, sessions);
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ChatState>,
    permit: Option<OwnedSemaphorePermit>,
    sessions: &mut JoinSet<()>,
) {
    let state = Arc::clone(state);
    let id = state.next_id();
    debug!(%peer, id, "accepted connection");

    sessions.spawn(async move {
        let _permit = permit;
        if let Err(err) = session::run(stream, id, &state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

async fn reject_connection(mut stream: TcpStream, peer: SocketAddr) {
    let reply = format!("{SERVER_FULL}\n");
    if let Err(err) = stream.write_all(reply.as_bytes()).await {
        debug!(%peer, error = ?err, "failed to notify rejected client");
    }
    if let Err(err) = stream.shutdown().await {
        debug!(%peer, error = ?err, "failed to shut down rejected connection");
    }
}

fn reap_session(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            warn!(error = ?err, "session task panicked");
        }
    }
}
