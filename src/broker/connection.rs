use std::{
    fmt::{Display, Formatter},
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::{Error, Result};
use tokio::{
    sync::{Mutex, RwLock, mpsc::UnboundedReceiver, watch},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{BrokerConnector, BrokerLink, BrokerSession, topology::QueueTopology};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State plus the generation of the active session; the generation grows by
/// one on every successful (re)connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub generation: u64,
}

struct ActiveSession {
    session: Arc<dyn BrokerSession>,
    generation: u64,
}

/// Owns the broker session and keeps it alive across broker-side closures.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    topology: QueueTopology,
    reconnect_interval: Duration,
    active: RwLock<ActiveSession>,
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        topology: QueueTopology,
        reconnect_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>, Error> {
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Connecting,
            generation: 0,
        });

        info!(queue = %topology.queue, "Connecting to message broker");

        let BrokerLink { session, closed } = establish(connector.as_ref(), &topology).await?;

        status.send_replace(ConnectionStatus {
            state: ConnectionState::Connected,
            generation: 1,
        });

        info!("Message broker connection established");

        let manager = Arc::new(Self {
            connector,
            topology,
            reconnect_interval,
            active: RwLock::new(ActiveSession {
                session,
                generation: 1,
            }),
            status,
            cancel: cancel.child_token(),
            supervisor: Mutex::new(None),
        });

        let handle = tokio::spawn(supervise(
            Arc::downgrade(&manager),
            manager.cancel.clone(),
            closed,
        ));
        *manager.supervisor.lock().await = Some(handle);

        Ok(manager)
    }

    /// Current session. Never observes a half-replaced pair.
    pub async fn session(&self) -> Arc<dyn BrokerSession> {
        Arc::clone(&self.active.read().await.session)
    }

    pub async fn session_with_generation(&self) -> (Arc<dyn BrokerSession>, u64) {
        let active = self.active.read().await;
        (Arc::clone(&active.session), active.generation)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Waits until a session newer than `generation` is connected. Returns
    /// `None` if `cancel` fires first.
    pub async fn wait_for_session_after(
        &self,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Option<(Arc<dyn BrokerSession>, u64)> {
        let mut status = self.status.subscribe();

        let ready = tokio::select! {
            _ = cancel.cancelled() => false,
            changed = status.wait_for(|s| {
                s.state == ConnectionState::Connected && s.generation > generation
            }) => changed.is_ok(),
        };

        if !ready {
            return None;
        }

        Some(self.session_with_generation().await)
    }

    /// Stops the reconnect loop and closes channel and connection.
    pub async fn close(&self) -> Result<(), Error> {
        self.cancel.cancel();

        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }

        let session = {
            let active = self.active.read().await;
            self.status.send_replace(ConnectionStatus {
                state: ConnectionState::Disconnected,
                generation: active.generation,
            });
            Arc::clone(&active.session)
        };

        info!("Closing message broker channel and connection");
        session.close().await
    }

    fn mark(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.state = state);
    }

    async fn replace_session(&self, session: Arc<dyn BrokerSession>) -> u64 {
        let mut active = self.active.write().await;
        active.session = session;
        active.generation += 1;

        self.status.send_replace(ConnectionStatus {
            state: ConnectionState::Connected,
            generation: active.generation,
        });

        active.generation
    }

    /// Retries at a fixed interval until connected or canceled.
    async fn reconnect(&self) -> Option<UnboundedReceiver<String>> {
        self.mark(ConnectionState::Reconnecting);

        let mut attempt: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                info!("Shutdown requested, stopping reconnect attempts");
                self.mark(ConnectionState::Disconnected);
                return None;
            }

            attempt += 1;

            match establish(self.connector.as_ref(), &self.topology).await {
                Ok(BrokerLink { session, closed }) => {
                    let generation = self.replace_session(session).await;
                    info!(attempt, generation, "Message broker reconnected");
                    return Some(closed);
                }
                Err(e) => {
                    error!(
                        attempt,
                        error = %e,
                        retry_in_ms = self.reconnect_interval.as_millis() as u64,
                        "Reconnect failed, retrying"
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = sleep(self.reconnect_interval) => {}
            }
        }
    }
}

async fn establish(
    connector: &dyn BrokerConnector,
    topology: &QueueTopology,
) -> Result<BrokerLink, Error> {
    let link = connector.connect().await?;

    if let Err(e) = topology.declare(link.session.as_ref()).await {
        if let Err(close_err) = link.session.close().await {
            warn!(error = %close_err, "Failed to close session after topology error");
        }
        return Err(e);
    }

    Ok(link)
}

async fn supervise(
    manager: Weak<ConnectionManager>,
    cancel: CancellationToken,
    mut closed: UnboundedReceiver<String>,
) {
    loop {
        let reason = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Connection supervisor stopped");
                return;
            }
            reason = closed.recv() => {
                reason.unwrap_or_else(|| "liveness subscription dropped".to_string())
            }
        };

        let Some(manager) = manager.upgrade() else {
            return;
        };

        error!(reason = %reason, "Message broker connection closed, trying to reconnect");

        match manager.reconnect().await {
            Some(next) => closed = next,
            None => return,
        }
    }
}
